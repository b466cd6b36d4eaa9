//! Test support for the connectivity layer: an in-process mock manager the
//! agent components talk real HTTP to, plus small shared helpers.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Unsigned JWT with the given absolute `exp` claim.
pub fn make_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#).as_bytes());
    format!("{header}.{payload}.signature")
}

/// Polls `check` until it holds or `deadline` elapses.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = std::time::Instant::now() + deadline;
    while std::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// What the mock manager answers to an authentication attempt.
#[derive(Debug, Clone)]
pub enum AuthReply {
    /// 200 with a token expiring `exp_in_secs` from now.
    Token { exp_in_secs: i64 },
    /// 401 with the given fatal body message.
    Fatal(&'static str),
    /// 500.
    ServerError,
}

pub struct ManagerState {
    pub auth_requests: AtomicUsize,
    auth_script: Mutex<VecDeque<AuthReply>>,
    auth_default: Mutex<AuthReply>,
    commands: Mutex<VecDeque<String>>,
    pub stateful_bodies: Mutex<Vec<String>>,
    pub stateless_bodies: Mutex<Vec<String>>,
    event_script: Mutex<VecDeque<u16>>,
    event_status: AtomicU16,
    files: Mutex<HashMap<String, String>>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            auth_requests: AtomicUsize::new(0),
            auth_script: Mutex::new(VecDeque::new()),
            auth_default: Mutex::new(AuthReply::Token { exp_in_secs: 3600 }),
            commands: Mutex::new(VecDeque::new()),
            stateful_bodies: Mutex::new(Vec::new()),
            stateless_bodies: Mutex::new(Vec::new()),
            event_script: Mutex::new(VecDeque::new()),
            event_status: AtomicU16::new(200),
            files: Mutex::new(HashMap::new()),
        }
    }
}

/// In-process manager speaking the real wire protocol over loopback HTTP.
pub struct MockManager {
    addr: SocketAddr,
    pub state: Arc<ManagerState>,
}

impl MockManager {
    pub async fn start() -> Self {
        let state = Arc::new(ManagerState::default());
        let router = Router::new()
            .route("/api/v1/authentication", post(handle_auth))
            .route("/api/v1/commands", get(handle_commands))
            .route("/api/v1/events/stateful", post(handle_stateful))
            .route("/api/v1/events/stateless", post(handle_stateless))
            .route("/api/v1/files", get(handle_files))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock manager");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queues a one-shot authentication reply ahead of the default.
    pub fn push_auth(&self, reply: AuthReply) {
        self.state.auth_script.lock().unwrap().push_back(reply);
    }

    pub fn set_auth_default(&self, reply: AuthReply) {
        *self.state.auth_default.lock().unwrap() = reply;
    }

    pub fn auth_requests(&self) -> usize {
        self.state.auth_requests.load(Ordering::SeqCst)
    }

    /// Queues one commands-poll response body; once drained the poll answers
    /// with an empty command list.
    pub fn push_commands_body(&self, body: &str) {
        self.state
            .commands
            .lock()
            .unwrap()
            .push_back(body.to_string());
    }

    /// Queues a one-shot status for the next event post (after the script
    /// drains, posts answer with the default 200).
    pub fn push_event_status(&self, status: u16) {
        self.state.event_script.lock().unwrap().push_back(status);
    }

    pub fn add_file(&self, name: &str, content: &str) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), content.to_string());
    }

    pub fn stateful_bodies(&self) -> Vec<String> {
        self.state.stateful_bodies.lock().unwrap().clone()
    }

    pub fn stateless_bodies(&self) -> Vec<String> {
        self.state.stateless_bodies.lock().unwrap().clone()
    }
}

async fn handle_auth(State(state): State<Arc<ManagerState>>) -> (StatusCode, String) {
    state.auth_requests.fetch_add(1, Ordering::SeqCst);
    let reply = state
        .auth_script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.auth_default.lock().unwrap().clone());
    match reply {
        AuthReply::Token { exp_in_secs } => {
            let exp = chrono::Utc::now().timestamp() + exp_in_secs;
            (
                StatusCode::OK,
                format!(r#"{{"data":{{"token":"{}"}}}}"#, make_jwt(exp)),
            )
        }
        AuthReply::Fatal(message) => (
            StatusCode::UNAUTHORIZED,
            format!(r#"{{"message":"{message}"}}"#),
        ),
        AuthReply::ServerError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        ),
    }
}

async fn handle_commands(State(state): State<Arc<ManagerState>>) -> (StatusCode, String) {
    let body = state
        .commands
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| r#"{"commands":[]}"#.to_string());
    (StatusCode::OK, body)
}

fn event_status(state: &ManagerState) -> StatusCode {
    let code = state
        .event_script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.event_status.load(Ordering::SeqCst));
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

async fn handle_stateful(State(state): State<Arc<ManagerState>>, body: String) -> StatusCode {
    let status = event_status(&state);
    if status.is_success() {
        state.stateful_bodies.lock().unwrap().push(body);
    }
    status
}

async fn handle_stateless(State(state): State<Arc<ManagerState>>, body: String) -> StatusCode {
    let status = event_status(&state);
    if status.is_success() {
        state.stateless_bodies.lock().unwrap().push(body);
    }
    status
}

async fn handle_files(
    State(state): State<Arc<ManagerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(name) = params.get("file_name") else {
        return (StatusCode::BAD_REQUEST, "missing file_name".to_string());
    };
    match state.files.lock().unwrap().get(name) {
        Some(content) => (StatusCode::OK, content.clone()),
        None => (StatusCode::NOT_FOUND, "no such file".to_string()),
    }
}
