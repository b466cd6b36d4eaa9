//! Local control channel.
//!
//! A Unix-domain stream socket under the agent's run directory accepts
//! short newline-terminated text messages from an out-of-band process:
//!
//! - `RELOAD` reloads every module,
//! - `RELOAD-MODULE:<name>` reloads one module.
//!
//! One message per connection; the peer is closed after dispatch. Accept
//! errors close and re-open the endpoint, handler failures are logged and
//! the loop continues.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

pub const SOCKET_FILE_NAME: &str = "agent-socket";

const RELOAD_MESSAGE: &str = "RELOAD";
const RELOAD_MODULE_PREFIX: &str = "RELOAD-MODULE:";

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind local socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to reach local socket {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Path of the control socket under `run_path`.
pub fn socket_path(run_path: &Path) -> PathBuf {
    run_path.join(SOCKET_FILE_NAME)
}

/// Delivers one control message to a running agent.
pub async fn send_signal(run_path: &Path, message: &str) -> Result<(), ListenerError> {
    let path = socket_path(run_path);
    let mut stream = UnixStream::connect(&path)
        .await
        .map_err(|source| ListenerError::Connect {
            path: path.clone(),
            source,
        })?;
    let line = format!("{message}\n");
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|source| ListenerError::Connect { path, source })?;
    let _ = stream.shutdown().await;
    Ok(())
}

pub struct InstanceListener {
    on_reload: Box<dyn Fn(Option<String>) + Send + Sync>,
    keep_running: AtomicBool,
    wake: Notify,
}

impl InstanceListener {
    pub fn new(on_reload: impl Fn(Option<String>) + Send + Sync + 'static) -> Self {
        Self {
            on_reload: Box::new(on_reload),
            keep_running: AtomicBool::new(true),
            wake: Notify::new(),
        }
    }

    /// Parses and dispatches one control message.
    pub fn handle_message(&self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == RELOAD_MESSAGE {
            (self.on_reload)(None);
        } else if let Some(name) = line.strip_prefix(RELOAD_MODULE_PREFIX) {
            if name.is_empty() {
                tracing::warn!("reload-module message without a module name");
            } else {
                (self.on_reload)(Some(name.to_string()));
            }
        } else if !line.is_empty() {
            tracing::warn!(message = line, "unrecognized instance message");
        }
    }

    /// Accept loop. Binds the endpoint under `run_path` (replacing any stale
    /// socket file), reads one line per connection, and re-opens the
    /// endpoint after accept errors. Returns once [`stop`](Self::stop) is
    /// called; the socket file is removed on exit.
    pub async fn listen(&self, run_path: &Path) -> Result<(), ListenerError> {
        let path = socket_path(run_path);

        'rebind: while self.keep_running.load(Ordering::SeqCst) {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            let listener = UnixListener::bind(&path).map_err(|source| ListenerError::Bind {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "instance listener ready");

            while self.keep_running.load(Ordering::SeqCst) {
                let accepted = tokio::select! {
                    res = listener.accept() => res,
                    _ = self.wake.notified() => continue,
                };

                match accepted {
                    Ok((stream, _addr)) => {
                        if let Err(e) = self.serve_connection(stream).await {
                            tracing::warn!(error = %e, "instance connection failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed, re-opening endpoint");
                        continue 'rebind;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    async fn serve_connection(&self, stream: UnixStream) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        self.handle_message(&line);
        Ok(())
    }
}
