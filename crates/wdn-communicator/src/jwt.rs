//! Local JWT inspection. The agent only needs the `exp` claim to schedule
//! its pre-expiry refresh; signature verification is the manager's problem.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("token is not a JWT")]
    Malformed,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token does not contain an 'exp' claim")]
    MissingExp,
}

/// Extracts the `exp` claim (seconds since epoch) from an encoded JWT.
pub fn decode_exp(token: &str) -> Result<i64, JwtError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(JwtError::Malformed);
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1])?;
    let claims: serde_json::Value = serde_json::from_slice(&payload)?;
    claims
        .get("exp")
        .and_then(serde_json::Value::as_i64)
        .ok_or(JwtError::MissingExp)
}
