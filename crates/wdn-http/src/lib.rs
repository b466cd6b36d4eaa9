//! HTTP client used for every manager-bound request.
//!
//! The [`HttpPerformer`] trait is the seam between the connectivity layer and
//! the wire: production code uses [`ReqwestPerformer`], tests substitute a
//! scripted implementation. Request parameters are a plain struct so loops
//! can reuse one set of params and swap the token/body per iteration.

mod client;
mod tls;

pub use client::ReqwestPerformer;

use std::time::Duration;

use async_trait::async_trait;

pub const HTTP_CODE_OK: u16 = 200;
pub const HTTP_CODE_MULTIPLE_CHOICES: u16 = 300;
pub const HTTP_CODE_UNAUTHORIZED: u16 = 401;
pub const HTTP_CODE_FORBIDDEN: u16 = 403;
pub const HTTP_CODE_TIMEOUT: u16 = 408;
pub const HTTP_CODE_INTERNAL_SERVER_ERROR: u16 = 500;

/// Shared per-request deadline covering connect, handshake, write and read.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

pub fn is_success(status: u16) -> bool {
    (HTTP_CODE_OK..HTTP_CODE_MULTIPLE_CHOICES).contains(&status)
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

/// Strictness of TLS peer verification for outbound HTTPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VerificationMode {
    /// Verify the certificate chain and the hostname.
    #[default]
    Full,
    /// Verify the certificate chain only, skipping the hostname check.
    Certificate,
    /// No peer verification.
    None,
}

impl VerificationMode {
    /// Parses a configuration string. Anything unrecognized falls through to
    /// [`VerificationMode::Full`] with a warning.
    pub fn parse(value: &str) -> Self {
        match value {
            "full" => VerificationMode::Full,
            "certificate" => VerificationMode::Certificate,
            "none" => VerificationMode::None,
            other => {
                tracing::warn!(
                    mode = other,
                    "verification mode unknown, full mode is used"
                );
                VerificationMode::Full
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMode::Full => "full",
            VerificationMode::Certificate => "certificate",
            VerificationMode::None => "none",
        }
    }
}

/// Everything needed to issue one request.
#[derive(Debug, Clone)]
pub struct HttpRequestParams {
    pub method: Method,
    pub server_url: String,
    pub endpoint: String,
    pub user_agent: String,
    pub verification_mode: VerificationMode,
    /// Bearer token; takes precedence over `user_pass` when non-empty.
    pub token: String,
    /// Base64-encoded `user:password` for basic auth (caller encodes).
    pub user_pass: String,
    pub body: String,
    pub request_timeout: Duration,
}

impl HttpRequestParams {
    pub fn new(
        method: Method,
        server_url: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            method,
            server_url: server_url.into(),
            endpoint: endpoint.into(),
            user_agent: String::new(),
            verification_mode: VerificationMode::default(),
            token: String::new(),
            user_pass: String::new(),
            body: String::new(),
            request_timeout: DEFAULT_SOCKET_TIMEOUT,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_verification(mut self, mode: VerificationMode) -> Self {
        self.verification_mode = mode;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_user_pass(mut self, user_pass: impl Into<String>) -> Self {
        self.user_pass = user_pass.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Full request URL (server url + endpoint path).
    pub fn url(&self) -> String {
        format!(
            "{}{}",
            self.server_url.trim_end_matches('/'),
            self.endpoint
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

/// Seam between the connectivity layer and the wire.
#[async_trait]
pub trait HttpPerformer: Send + Sync {
    /// Issues the request and reports failures as [`HttpError`]; the caller
    /// branches on the returned status for application-level outcomes.
    async fn co_perform(&self, params: &HttpRequestParams) -> Result<HttpResponse, HttpError>;

    /// Infallible variant: every transport failure is folded into a status
    /// code so callers branch only on the code. Timeouts synthesize 408,
    /// anything else a 500 with the reason in the body.
    async fn perform(&self, params: &HttpRequestParams) -> HttpResponse {
        match self.co_perform(params).await {
            Ok(response) => response,
            Err(HttpError::Timeout) => HttpResponse {
                status: HTTP_CODE_TIMEOUT,
                body: "Request timed out".to_string(),
            },
            Err(e) => HttpResponse {
                status: HTTP_CODE_INTERNAL_SERVER_ERROR,
                body: format!("Internal server error: {e}"),
            },
        }
    }
}
