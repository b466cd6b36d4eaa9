//! Agent supervisor: builds the components, spawns every suspendable task
//! on the single-threaded executor, and turns signals, restart requests and
//! fatal authentication errors into an orderly exit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wdn_commands::{CommandHandler, CommandStore};
use wdn_communicator::Communicator;
use wdn_http::{HttpPerformer, ReqwestPerformer};
use wdn_listener::InstanceListener;
use wdn_queue::MultiTypeQueue;

use crate::executor::{CommandExecutor, RestartHandle};
use crate::pipeline;
use crate::settings::AgentSettings;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Shutdown,
    Restart,
}

pub struct Agent {
    settings: AgentSettings,
    queue: Arc<MultiTypeQueue>,
    communicator: Arc<Communicator>,
    handler: Arc<CommandHandler>,
    listener: Arc<InstanceListener>,
    executor: Arc<CommandExecutor>,
    restart: Arc<RestartHandle>,
    reload_rx: mpsc::UnboundedReceiver<Option<String>>,
}

impl Agent {
    pub async fn bootstrap(settings: AgentSettings) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&settings.data_path)
            .await
            .with_context(|| format!("create data dir {}", settings.data_path.display()))?;
        tokio::fs::create_dir_all(&settings.run_path)
            .await
            .with_context(|| format!("create run dir {}", settings.run_path.display()))?;

        let queue = Arc::new(
            MultiTypeQueue::open(&settings.data_path, settings.queue_options())
                .await
                .context("open event queue")?,
        );
        let store = CommandStore::open(&settings.data_path)
            .await
            .context("open command store")?;
        let handler = Arc::new(CommandHandler::new(store));

        let http: Arc<dyn HttpPerformer> =
            Arc::new(ReqwestPerformer::new().context("build http client")?);
        let communicator = Arc::new(Communicator::new(
            http,
            settings.communicator_options(),
            settings.uuid.clone(),
            settings.key.clone(),
            AgentSettings::header_info,
        ));

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let restart = Arc::new(RestartHandle::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&communicator),
            &settings,
            reload_tx.clone(),
            Arc::clone(&restart),
        ));

        let listener = Arc::new(InstanceListener::new(move |module| {
            let _ = reload_tx.send(module);
        }));

        Ok(Self {
            settings,
            queue,
            communicator,
            handler,
            listener,
            executor,
            restart,
            reload_rx,
        })
    }

    pub fn queue(&self) -> Arc<MultiTypeQueue> {
        Arc::clone(&self.queue)
    }

    /// Runs until a shutdown signal, a restart command, or a fatal
    /// authentication rejection.
    pub async fn run(self) -> anyhow::Result<RunOutcome> {
        let Agent {
            settings,
            queue,
            communicator,
            handler,
            listener,
            executor,
            restart,
            mut reload_rx,
        } = self;

        anyhow::ensure!(
            !settings.uuid.is_empty() && !settings.key.is_empty(),
            "agent is not enrolled: agent.uuid / agent.key missing from configuration"
        );

        // Token lifecycle: authenticates immediately (no token yet), then
        // refreshes ahead of every expiry.
        let mut auth_task = tokio::spawn({
            let communicator = Arc::clone(&communicator);
            async move { communicator.wait_for_token_expiration_and_authenticate().await }
        });

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn({
            let communicator = Arc::clone(&communicator);
            let get = pipeline::batch_from_queue(Arc::clone(&queue), wdn_queue::MessageType::Stateful);
            let done = pipeline::remove_on_success(Arc::clone(&queue), wdn_queue::MessageType::Stateful);
            async move { communicator.stateful_message_processing_task(get, done).await }
        }));

        tasks.push(tokio::spawn({
            let communicator = Arc::clone(&communicator);
            let get = pipeline::batch_from_queue(Arc::clone(&queue), wdn_queue::MessageType::Stateless);
            let done = pipeline::remove_on_success(Arc::clone(&queue), wdn_queue::MessageType::Stateless);
            async move { communicator.stateless_message_processing_task(get, done).await }
        }));

        tasks.push(tokio::spawn({
            let communicator = Arc::clone(&communicator);
            let enqueue = pipeline::enqueue_commands(Arc::clone(&queue));
            async move { communicator.get_commands_from_manager(enqueue).await }
        }));

        tasks.push(tokio::spawn({
            let handler = Arc::clone(&handler);
            let executor = Arc::clone(&executor);
            let get = pipeline::command_supplier(Arc::clone(&queue));
            let pop = pipeline::command_popper(Arc::clone(&queue));
            let report = pipeline::report_to_stateful(Arc::clone(&queue));
            async move {
                handler
                    .process_commands(get, pop, report, move |entry| {
                        let executor = Arc::clone(&executor);
                        async move { executor.dispatch(entry).await }
                    })
                    .await
            }
        }));

        tasks.push(tokio::spawn({
            let listener = Arc::clone(&listener);
            let run_path = settings.run_path.clone();
            async move {
                if let Err(e) = listener.listen(&run_path).await {
                    tracing::error!(error = %e, "instance listener failed");
                }
            }
        }));

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;

        let mut auth_finished = false;
        let mut fatal: Option<wdn_communicator::AuthError> = None;

        let outcome = loop {
            tokio::select! {
                auth = &mut auth_task, if !auth_finished => {
                    auth_finished = true;
                    match auth {
                        Ok(Err(rejection)) => {
                            fatal = Some(rejection);
                            break RunOutcome::Shutdown;
                        }
                        Ok(Ok(())) => break RunOutcome::Shutdown,
                        Err(e) => {
                            tracing::error!(error = %e, "token lifecycle task failed");
                            break RunOutcome::Shutdown;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, shutting down");
                    break RunOutcome::Shutdown;
                }
                _ = sigterm.recv() => {
                    tracing::info!("termination signal received, shutting down");
                    break RunOutcome::Shutdown;
                }
                _ = restart.wait_requested() => {
                    tracing::info!("restart requested by command");
                    break RunOutcome::Restart;
                }
                Some(module) = reload_rx.recv() => {
                    match module {
                        Some(name) => tracing::info!(module = %name, "module reload requested"),
                        None => tracing::info!("module reload requested for all modules"),
                    }
                }
            }
        };

        communicator.stop();
        handler.stop();
        listener.stop();
        queue.shutdown();

        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if !auth_finished && tokio::time::timeout(SHUTDOWN_GRACE, &mut auth_task).await.is_err() {
            auth_task.abort();
        }
        tracing::info!("agent rundown complete");

        if let Some(rejection) = fatal {
            return Err(anyhow::Error::new(rejection)
                .context("authentication rejected by the manager; re-enrollment required"));
        }
        Ok(outcome)
    }
}
