//! warden-agent entry point.
//!
//! This file is intentionally thin: it sets up tracing, resolves the
//! layered configuration, and either runs the agent supervisor or delivers
//! an out-of-band control message. All wiring lives in the library target.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use wdn_agent::cli::{Cli, Command};
use wdn_agent::runner::{Agent, RunOutcome};
use wdn_agent::settings::AgentSettings;
use wdn_config::ConfigParser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli.config).await,
        Command::Reload { module } => reload(&cli.config, module).await,
        Command::Status => status(&cli.config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn run(config: &Path) -> Result<()> {
    loop {
        let settings = load_settings(config)?;
        info!(config_hash = %settings.config_hash, "warden-agent starting");

        let agent = Agent::bootstrap(settings).await?;
        match agent.run().await? {
            RunOutcome::Shutdown => {
                info!("warden-agent stopped");
                return Ok(());
            }
            RunOutcome::Restart => {
                info!("warden-agent restarting");
            }
        }
    }
}

/// Base config first, then any group files already on disk, honoring a
/// persisted group membership over the statically configured one.
fn load_settings(config: &Path) -> Result<AgentSettings> {
    let base = ConfigParser::load(&[config])
        .with_context(|| format!("load configuration {}", config.display()))?;
    let mut settings = AgentSettings::from_parser(&base);

    if let Some(groups) = persisted_groups(&settings.data_path) {
        settings.groups = groups;
    }

    let mut layers: Vec<PathBuf> = vec![config.to_path_buf()];
    layers.extend(
        settings
            .groups
            .iter()
            .map(|g| settings.group_file(g))
            .filter(|p| p.exists()),
    );
    if layers.len() == 1 {
        return Ok(settings);
    }

    let merged = ConfigParser::load(&layers).context("merge group configuration")?;
    let mut merged_settings = AgentSettings::from_parser(&merged);
    merged_settings.groups = settings.groups;
    Ok(merged_settings)
}

fn persisted_groups(data_path: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(data_path.join("groups.json")).ok()?;
    serde_json::from_str(&raw).ok()
}

async fn reload(config: &Path, module: Option<String>) -> Result<()> {
    let settings = load_settings(config)?;
    let message = match module {
        Some(name) => format!("RELOAD-MODULE:{name}"),
        None => "RELOAD".to_string(),
    };
    wdn_listener::send_signal(&settings.run_path, &message)
        .await
        .context("deliver reload signal (is the agent running?)")?;
    println!("reload signal sent");
    Ok(())
}

async fn status(config: &Path) -> Result<()> {
    let settings = load_settings(config)?;
    match wdn_listener::send_signal(&settings.run_path, "").await {
        Ok(()) => {
            println!("warden-agent is running");
            Ok(())
        }
        Err(_) => {
            println!("warden-agent is not running");
            std::process::exit(1);
        }
    }
}
