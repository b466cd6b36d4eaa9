//! Manager connectivity: authentication, token lifecycle, and the three
//! long-lived request loops (command polling, stateful events, stateless
//! events).
//!
//! The loops are self-healing: every failure becomes a retry decision, and
//! the only error that ever escapes is a fatal authentication rejection
//! (`Invalid key` / `Agent does not exist`), which means the agent must stop
//! and re-enroll.

pub mod jwt;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};

use wdn_http::{
    is_success, HttpPerformer, HttpRequestParams, Method, VerificationMode, HTTP_CODE_FORBIDDEN,
    HTTP_CODE_TIMEOUT, HTTP_CODE_UNAUTHORIZED,
};

/// Seconds before `exp` at which the refresh task re-authenticates.
const TOKEN_PRE_EXPIRY_SECS: i64 = 2;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

const MIN_BATCH_SIZE: u64 = 1_000;
const MAX_BATCH_SIZE: u64 = 100_000_000;
const COMMANDS_TIMEOUT_MIN: Duration = Duration::from_secs(10);
const COMMANDS_TIMEOUT_MAX: Duration = Duration::from_secs(15 * 60);

/// Extension of manager-shared group configuration files.
pub const SHARED_FILE_EXTENSION: &str = ".yml";

/// Supplies a request body: given a byte budget, returns the batched item
/// count and the serialized payload.
pub type GetMessages = Box<dyn Fn(u64) -> BoxFuture<'static, (usize, String)> + Send + Sync>;

/// Invoked with the batched item count and the response body after a 2xx.
pub type OnSuccess = Box<dyn Fn(usize, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The manager rejected the agent's identity outright. Not recoverable
    /// by retrying; the agent must stop and re-enroll.
    #[error("fatal authentication failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct CommunicatorOptions {
    pub server_url: String,
    /// Delay after a failed attempt before the next one.
    pub retry_interval: Duration,
    pub verification_mode: VerificationMode,
    /// Max body bytes per event batch; clamped to [1000, 100_000_000].
    pub batch_size: u64,
    /// Per-request timeout for the commands poll; clamped to [10s, 15m].
    pub commands_request_timeout: Duration,
}

impl Default for CommunicatorOptions {
    fn default() -> Self {
        Self {
            server_url: "https://localhost:27000".to_string(),
            retry_interval: Duration::from_secs(30),
            verification_mode: VerificationMode::Full,
            batch_size: MIN_BATCH_SIZE,
            commands_request_timeout: Duration::from_secs(11 * 60),
        }
    }
}

pub struct Communicator {
    http: Arc<dyn HttpPerformer>,
    server_url: String,
    uuid: String,
    key: String,
    verification_mode: VerificationMode,
    retry_interval: Duration,
    batch_size: u64,
    commands_request_timeout: Duration,
    get_header_info: Box<dyn Fn() -> String + Send + Sync>,

    /// Single writer (the authentication path), many readers.
    token: RwLock<String>,
    token_exp_secs: AtomicI64,
    keep_running: AtomicBool,

    /// Together with `is_reauthenticating`, guarantees at most one re-auth
    /// in flight; losers are no-ops.
    reauth_gate: Mutex<()>,
    is_reauthenticating: AtomicBool,
    /// Cancels the expiry timer, which wakes the refresh task immediately.
    token_timer_cancel: Notify,
}

impl Communicator {
    pub fn new(
        http: Arc<dyn HttpPerformer>,
        options: CommunicatorOptions,
        uuid: impl Into<String>,
        key: impl Into<String>,
        get_header_info: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        if !options.server_url.starts_with("https://") {
            tracing::info!("using insecure connection");
        }

        let batch_size = clamp_with_warn(
            "events.batch_size",
            options.batch_size,
            MIN_BATCH_SIZE,
            MAX_BATCH_SIZE,
        );
        let commands_request_timeout = clamp_with_warn(
            "agent.commands_request_timeout",
            options.commands_request_timeout,
            COMMANDS_TIMEOUT_MIN,
            COMMANDS_TIMEOUT_MAX,
        );

        Self {
            http,
            server_url: options.server_url,
            uuid: uuid.into(),
            key: key.into(),
            verification_mode: options.verification_mode,
            retry_interval: options.retry_interval,
            batch_size,
            commands_request_timeout,
            get_header_info: Box::new(get_header_info),
            token: RwLock::new(String::new()),
            token_exp_secs: AtomicI64::new(0),
            keep_running: AtomicBool::new(true),
            reauth_gate: Mutex::new(()),
            is_reauthenticating: AtomicBool::new(false),
            token_timer_cancel: Notify::new(),
        }
    }

    pub fn keep_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.token_timer_cancel.notify_waiters();
    }

    /// Snapshot of the current token (empty when unauthenticated).
    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn commands_request_timeout(&self) -> Duration {
        self.commands_request_timeout
    }

    /// Seconds until the current token expires (0 when absent or expired).
    pub fn token_remaining_secs(&self) -> i64 {
        let now = chrono::Utc::now().timestamp();
        (self.token_exp_secs.load(Ordering::SeqCst) - now).max(0)
    }

    /// POSTs the agent's uuid/key and installs the returned token. `Ok(false)`
    /// means a retryable failure (the in-memory token has been cleared);
    /// fatal rejections surface as [`AuthError::Fatal`].
    pub async fn send_authentication_request(&self) -> Result<bool, AuthError> {
        let body = serde_json::json!({ "uuid": self.uuid, "key": self.key }).to_string();
        let params = HttpRequestParams::new(
            Method::Post,
            self.server_url.as_str(),
            "/api/v1/authentication",
        )
        .with_user_agent((self.get_header_info)())
        .with_verification(self.verification_mode)
        .with_body(body);

        let res = self.http.perform(&params).await;

        if !is_success(res.status) {
            if res.status == HTTP_CODE_UNAUTHORIZED || res.status == HTTP_CODE_FORBIDDEN {
                let message = serde_json::from_str::<Value>(&res.body)
                    .ok()
                    .and_then(|v| {
                        v.get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                if message == "Invalid key" || message == "Agent does not exist" {
                    return Err(AuthError::Fatal(message));
                }
            }
            tracing::warn!(
                status = res.status,
                "failed to authenticate with the manager, retrying in {}s",
                self.retry_interval.as_secs()
            );
            self.clear_token().await;
            return Ok(false);
        }

        let Some(token) = parse_token(&res.body) else {
            tracing::error!("error parsing token in authentication response");
            self.clear_token().await;
            return Ok(false);
        };

        match jwt::decode_exp(&token) {
            Ok(exp) => {
                *self.token.write().await = token;
                self.token_exp_secs.store(exp, Ordering::SeqCst);
                tracing::info!("successfully authenticated with the manager");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to decode token");
                self.clear_token().await;
                self.token_exp_secs.store(1, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    /// Authenticates with user/password basic auth and returns the raw
    /// token without installing it; the one-shot enrollment flow owns that
    /// token, not the running agent.
    pub async fn authenticate_with_user_password(
        &self,
        user: &str,
        password: &str,
    ) -> Option<String> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;

        let user_pass = STANDARD.encode(format!("{user}:{password}"));
        let params = HttpRequestParams::new(
            Method::Post,
            self.server_url.as_str(),
            "/api/v1/authentication",
        )
        .with_user_agent((self.get_header_info)())
        .with_verification(self.verification_mode)
        .with_user_pass(user_pass);

        let res = self.http.perform(&params).await;
        if !is_success(res.status) {
            tracing::warn!(status = res.status, "user/password authentication failed");
            return None;
        }
        let token = parse_token(&res.body);
        if token.is_none() {
            tracing::error!("error parsing token in authentication response");
        }
        token
    }

    /// Token refresh task: sleeps until `exp - 2s` (or until the timer is
    /// cancelled, which means "wake now"), re-authenticates, repeats while
    /// the agent runs. Fatal rejections surface to the supervisor.
    pub async fn wait_for_token_expiration_and_authenticate(&self) -> Result<(), AuthError> {
        let remaining = self.token_remaining_secs();
        if remaining > TOKEN_PRE_EXPIRY_SECS {
            self.wait_or_cancel(Duration::from_secs(
                (remaining - TOKEN_PRE_EXPIRY_SECS) as u64,
            ))
            .await;
        }

        while self.keep_running() {
            let wait = match self.send_authentication_request().await {
                Ok(true) => {
                    let secs = (self.token_remaining_secs() - TOKEN_PRE_EXPIRY_SECS).max(0);
                    Duration::from_secs(secs as u64)
                }
                Ok(false) => self.retry_interval,
                Err(fatal) => return Err(fatal),
            };
            self.wait_or_cancel(wait).await;
        }
        Ok(())
    }

    /// Arbitrated re-authentication trigger. At most one caller wins: the
    /// winner cancels the expiry timer (whose task then re-authenticates),
    /// every other concurrent caller is a logged no-op.
    pub fn try_reauthenticate(&self) {
        match self.reauth_gate.try_lock() {
            Ok(_guard) => {
                if self
                    .is_reauthenticating
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.token_timer_cancel.notify_waiters();
                    self.is_reauthenticating.store(false, Ordering::SeqCst);
                } else {
                    tracing::debug!("re-authentication already in progress");
                }
            }
            Err(_) => {
                tracing::debug!("re-authentication attempt skipped, another task holds the gate");
            }
        }
    }

    /// Long-lived commands poll: GET `/api/v1/commands` with the configured
    /// per-request timeout; each 2xx body goes to `on_success` verbatim.
    pub async fn get_commands_from_manager(&self, on_success: OnSuccess) {
        let params = HttpRequestParams::new(Method::Get, self.server_url.as_str(), "/api/v1/commands")
            .with_user_agent((self.get_header_info)())
            .with_verification(self.verification_mode)
            .with_timeout(self.commands_request_timeout);
        self.execute_request_loop(params, None, on_success).await;
    }

    /// Long-lived stateful event delivery loop.
    pub async fn stateful_message_processing_task(
        &self,
        get_messages: GetMessages,
        on_success: OnSuccess,
    ) {
        let params = HttpRequestParams::new(
            Method::Post,
            self.server_url.as_str(),
            "/api/v1/events/stateful",
        )
        .with_user_agent((self.get_header_info)())
        .with_verification(self.verification_mode);
        self.execute_request_loop(params, Some(get_messages), on_success)
            .await;
    }

    /// Long-lived stateless event delivery loop.
    pub async fn stateless_message_processing_task(
        &self,
        get_messages: GetMessages,
        on_success: OnSuccess,
    ) {
        let params = HttpRequestParams::new(
            Method::Post,
            self.server_url.as_str(),
            "/api/v1/events/stateless",
        )
        .with_user_agent((self.get_header_info)())
        .with_verification(self.verification_mode);
        self.execute_request_loop(params, Some(get_messages), on_success)
            .await;
    }

    /// Downloads one group configuration file to `dst_path`. Returns whether
    /// the file was written.
    pub async fn get_group_config(&self, group_name: &str, dst_path: impl AsRef<Path>) -> bool {
        let token = self.token().await;
        if token.is_empty() {
            return false;
        }

        let endpoint = format!("/api/v1/files?file_name={group_name}{SHARED_FILE_EXTENSION}");
        let params = HttpRequestParams::new(Method::Get, self.server_url.as_str(), endpoint)
            .with_user_agent((self.get_header_info)())
            .with_verification(self.verification_mode)
            .with_token(token);

        let res = self.http.perform(&params).await;
        if res.is_success() {
            match tokio::fs::write(dst_path.as_ref(), res.body.as_bytes()).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(error = %e, path = %dst_path.as_ref().display(), "failed to write group configuration");
                    false
                }
            }
        } else {
            if res.status == HTTP_CODE_UNAUTHORIZED || res.status == HTTP_CODE_FORBIDDEN {
                self.try_reauthenticate();
            }
            tracing::warn!(status = res.status, group = group_name, "group configuration download failed");
            false
        }
    }

    /// Shared loop protocol for the three request loops; they differ only
    /// in method, endpoint, and body supplier.
    async fn execute_request_loop(
        &self,
        mut params: HttpRequestParams,
        message_getter: Option<GetMessages>,
        on_success: OnSuccess,
    ) {
        while self.keep_running() {
            let token = self.token().await;
            if token.is_empty() {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let mut count = 0usize;
            if let Some(getter) = &message_getter {
                // Stay attached to the queue until work exists; producers
                // fill it concurrently.
                loop {
                    if !self.keep_running() {
                        return;
                    }
                    let (n, body) = getter(self.batch_size).await;
                    if n > 0 {
                        tracing::trace!(items = n, endpoint = %params.endpoint, "batch ready");
                        count = n;
                        params.body = body;
                        break;
                    }
                }
            } else {
                params.body.clear();
            }

            params.token = token;
            let res = self.http.perform(&params).await;
            let status = res.status;

            let mut pause = POLL_INTERVAL;
            if is_success(status) {
                on_success(count, res.body).await;
            } else {
                if status == HTTP_CODE_UNAUTHORIZED || status == HTTP_CODE_FORBIDDEN {
                    self.try_reauthenticate();
                }
                if status != HTTP_CODE_TIMEOUT {
                    pause = self.retry_interval;
                }
            }

            tracing::debug!(endpoint = %params.endpoint, status, "request loop iteration");
            tokio::time::sleep(pause).await;
        }
    }

    async fn clear_token(&self) {
        self.token.write().await.clear();
    }

    async fn wait_or_cancel(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.token_timer_cancel.notified() => {
                tracing::debug!("token expiration timer was canceled");
            }
        }
    }
}

/// The manager wraps the token as `{"data":{"token":...}}`; older releases
/// returned it at the top level. Accept both.
fn parse_token(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/data/token")
        .or_else(|| value.get("token"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn clamp_with_warn<T: PartialOrd + Copy + std::fmt::Debug>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> T {
    if value < min {
        tracing::warn!(option = name, ?value, ?min, "configured value below minimum, clamping");
        min
    } else if value > max {
        tracing::warn!(option = name, ?value, ?max, "configured value above maximum, clamping");
        max
    } else {
        value
    }
}
