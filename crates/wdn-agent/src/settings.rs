//! Effective agent settings, resolved from the layered configuration.

use std::path::PathBuf;
use std::time::Duration;

use wdn_communicator::CommunicatorOptions;
use wdn_config::ConfigParser;
use wdn_http::VerificationMode;
use wdn_queue::QueueOptions;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/warden.yml";

const DEFAULT_SERVER_URL: &str = "https://localhost:27000";
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_COMMANDS_REQUEST_TIMEOUT: Duration = Duration::from_secs(11 * 60);
const DEFAULT_BATCH_SIZE: u64 = 1_000_000;
const DEFAULT_DATA_PATH: &str = "/var/lib/warden";
const DEFAULT_RUN_PATH: &str = "/var/run/warden";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub server_url: String,
    pub retry_interval: Duration,
    pub verification_mode: VerificationMode,
    pub commands_request_timeout: Duration,
    pub batch_size: u64,
    pub data_path: PathBuf,
    pub run_path: PathBuf,
    pub uuid: String,
    pub key: String,
    /// Groups this agent belongs to; group config files layer over the base.
    pub groups: Vec<String>,
    pub queue_max_items: u64,
    pub queue_max_bytes: u64,
    pub config_hash: String,
}

impl AgentSettings {
    pub fn from_parser(parser: &ConfigParser) -> Self {
        Self {
            server_url: parser.get_string_or(DEFAULT_SERVER_URL, &["agent", "server_url"]),
            retry_interval: parser.get_time_or(DEFAULT_RETRY_INTERVAL, &["agent", "retry_interval"]),
            verification_mode: VerificationMode::parse(
                &parser.get_string_or("full", &["agent", "verification_mode"]),
            ),
            commands_request_timeout: parser.get_time_or(
                DEFAULT_COMMANDS_REQUEST_TIMEOUT,
                &["agent", "commands_request_timeout"],
            ),
            batch_size: parser.get_bytes_or(DEFAULT_BATCH_SIZE, &["events", "batch_size"]),
            data_path: parser.get_string_or(DEFAULT_DATA_PATH, &["agent", "path", "data"]).into(),
            run_path: parser.get_string_or(DEFAULT_RUN_PATH, &["agent", "path", "run"]).into(),
            uuid: parser.get_string_or("", &["agent", "uuid"]),
            key: parser.get_string_or("", &["agent", "key"]),
            groups: parser.get_strings_or(&["default"], &["agent", "groups"]),
            queue_max_items: parser.get_bytes_or(wdn_queue::DEFAULT_MAX_ITEMS, &["agent", "queue_size"]),
            queue_max_bytes: parser.get_bytes_or(wdn_queue::DEFAULT_MAX_BYTES, &["agent", "queue_bytes"]),
            config_hash: parser.config_hash().to_string(),
        }
    }

    pub fn communicator_options(&self) -> CommunicatorOptions {
        CommunicatorOptions {
            server_url: self.server_url.clone(),
            retry_interval: self.retry_interval,
            verification_mode: self.verification_mode,
            batch_size: self.batch_size,
            commands_request_timeout: self.commands_request_timeout,
        }
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_items: self.queue_max_items,
            max_bytes: self.queue_max_bytes,
            ..QueueOptions::default()
        }
    }

    /// Directory holding manager-shared group configuration files.
    pub fn shared_dir(&self) -> PathBuf {
        self.data_path.join("shared")
    }

    pub fn group_file(&self, group: &str) -> PathBuf {
        self.shared_dir()
            .join(format!("{group}{}", wdn_communicator::SHARED_FILE_EXTENSION))
    }

    /// Identification string sent as the user agent on every request.
    pub fn header_info() -> String {
        format!(
            "WardenAgent/{} ({} {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}
