#![allow(dead_code)]

//! Scripted [`HttpPerformer`] for driving the communicator without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use wdn_http::{HttpError, HttpPerformer, HttpRequestParams, HttpResponse};

pub const AUTH: &str = "/api/v1/authentication";
pub const STATEFUL: &str = "/api/v1/events/stateful";
pub const STATELESS: &str = "/api/v1/events/stateless";
pub const COMMANDS: &str = "/api/v1/commands";

/// Responses are scripted per endpoint; an endpoint with an exhausted (or
/// absent) script answers 200 with an empty body. Every request is recorded.
pub struct ScriptedPerformer {
    responses: Mutex<HashMap<String, VecDeque<Result<HttpResponse, HttpError>>>>,
    requests: Mutex<Vec<HttpRequestParams>>,
}

impl ScriptedPerformer {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, endpoint: &str, response: Result<HttpResponse, HttpError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequestParams> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, endpoint: &str) -> Vec<HttpRequestParams> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpPerformer for ScriptedPerformer {
    async fn co_perform(&self, params: &HttpRequestParams) -> Result<HttpResponse, HttpError> {
        self.requests.lock().unwrap().push(params.clone());
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get_mut(&params.endpoint)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(HttpResponse {
                status: 200,
                body: String::new(),
            })
        })
    }
}

pub fn ok(body: &str) -> Result<HttpResponse, HttpError> {
    status(200, body)
}

pub fn status(code: u16, body: &str) -> Result<HttpResponse, HttpError> {
    Ok(HttpResponse {
        status: code,
        body: body.to_string(),
    })
}

/// Unsigned JWT carrying only an `exp` claim.
pub fn make_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#).as_bytes());
    format!("{header}.{payload}.signature")
}

/// Authentication response body wrapping `token` the way the manager does.
pub fn auth_body(token: &str) -> String {
    format!(r#"{{"data":{{"token":"{token}"}}}}"#)
}
