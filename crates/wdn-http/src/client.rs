//! reqwest-backed [`HttpPerformer`].

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};

use crate::tls::chain_only_client_config;
use crate::{HttpError, HttpPerformer, HttpRequestParams, HttpResponse, Method, VerificationMode};

/// Production HTTP client. One underlying connection pool per verification
/// mode; the mode is picked per request from the params.
pub struct ReqwestPerformer {
    full: reqwest::Client,
    certificate: reqwest::Client,
    none: reqwest::Client,
}

impl ReqwestPerformer {
    pub fn new() -> Result<Self, HttpError> {
        let full = reqwest::Client::builder()
            .build()
            .map_err(|e| HttpError::Tls(e.to_string()))?;

        let certificate = reqwest::Client::builder()
            .use_preconfigured_tls(chain_only_client_config()?)
            .build()
            .map_err(|e| HttpError::Tls(e.to_string()))?;

        let none = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| HttpError::Tls(e.to_string()))?;

        Ok(Self {
            full,
            certificate,
            none,
        })
    }

    fn client(&self, mode: VerificationMode) -> &reqwest::Client {
        match mode {
            VerificationMode::Full => &self.full,
            VerificationMode::Certificate => &self.certificate,
            VerificationMode::None => &self.none,
        }
    }
}

#[async_trait]
impl HttpPerformer for ReqwestPerformer {
    async fn co_perform(&self, params: &HttpRequestParams) -> Result<HttpResponse, HttpError> {
        let url = params.url();
        let client = self.client(params.verification_mode);

        let mut request = match params.method {
            Method::Get => client.get(&url),
            Method::Post => client.post(&url),
        };

        request = request
            .header(ACCEPT, "application/json")
            .timeout(params.request_timeout);

        if !params.user_agent.is_empty() {
            request = request.header(USER_AGENT, &params.user_agent);
        }

        if !params.token.is_empty() {
            request = request.bearer_auth(&params.token);
        } else if !params.user_pass.is_empty() {
            request = request.header(AUTHORIZATION, format!("Basic {}", params.user_pass));
        }

        if !params.body.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(params.body.clone());
        }

        let response = request.send().await.map_err(classify_error)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        tracing::debug!(endpoint = %params.endpoint, status, "request completed");

        Ok(HttpResponse { status, body })
    }
}

fn classify_error(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout
    } else if e.is_builder() {
        HttpError::InvalidUrl(e.to_string())
    } else {
        HttpError::Network(e.to_string())
    }
}
