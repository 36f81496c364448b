//! Request/response facade over the wallet backend.
//!
//! [`RemoteGateway`] is the only seam through which session, ledger and QR
//! logic reach the network. It never retries and never swallows an error;
//! every non-2xx answer is mapped onto [`WalletError`] by [`classify_failure`].

use std::fmt;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::api::types::{
    GenerateQrRequest, GeneratedQr, LoginRequest, PayQrRequest, ProfileResponse, RegisterRequest,
    RegistrationReceipt, ServerReceipt, TopUpRequest, TransferRequest, UserSummary,
    WalletSnapshot,
};
use crate::errors::{WalletError, WalletResult};

pub mod http;
pub mod memory;

pub use http::HttpGateway;
pub use memory::InMemoryBackend;

#[async_trait]
pub trait RemoteGateway: Send + Sync + fmt::Debug {
    async fn register(&self, request: &RegisterRequest) -> WalletResult<RegistrationReceipt>;

    /// Exchange credentials for a bearer token.
    async fn login(&self, request: &LoginRequest) -> WalletResult<SecretString>;

    async fn profile(&self, credential: &SecretString) -> WalletResult<ProfileResponse>;

    async fn list_users(&self, credential: &SecretString) -> WalletResult<Vec<UserSummary>>;

    async fn top_up(
        &self,
        credential: &SecretString,
        request: &TopUpRequest,
    ) -> WalletResult<WalletSnapshot>;

    async fn transfer(
        &self,
        credential: &SecretString,
        request: &TransferRequest,
    ) -> WalletResult<ServerReceipt>;

    async fn generate_qr(
        &self,
        credential: &SecretString,
        request: &GenerateQrRequest,
    ) -> WalletResult<GeneratedQr>;

    async fn pay_qr(
        &self,
        credential: &SecretString,
        request: &PayQrRequest,
    ) -> WalletResult<ServerReceipt>;
}

/// Map a non-success HTTP status and its body onto the error taxonomy.
pub fn classify_failure(status: u16, body: &str) -> WalletError {
    let message = extract_message(body).unwrap_or_else(|| format!("HTTP status {}", status));
    match status {
        401 | 403 => WalletError::AuthError(message),
        404 => WalletError::NotFoundError(message),
        400..=499 => WalletError::ValidationError(message),
        _ => WalletError::ServerError { status, message },
    }
}

/// Pull a human-readable message out of an error body.
pub(crate) fn extract_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::String(message)) => Some(message),
        Ok(serde_json::Value::Object(fields)) => ["message", "error", "detail"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string),
        Ok(_) => None,
        Err(_) => Some(trimmed.chars().take(256).collect()),
    }
}

/// Login answers with a bare token, a JSON string, or `{"token": ...}`.
pub(crate) fn parse_token(body: &str) -> WalletResult<SecretString> {
    let trimmed = body.trim();
    let token = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::String(token)) => token,
        Ok(serde_json::Value::Object(fields)) => fields
            .get("token")
            .or_else(|| fields.get("accessToken"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                WalletError::InvalidResponse("Login response carries no token".to_string())
            })?,
        Ok(_) => {
            return Err(WalletError::InvalidResponse(
                "Unexpected login response".to_string(),
            ))
        }
        Err(_) => trimmed.to_string(),
    };

    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(WalletError::InvalidResponse(
            "Login response carries no usable token".to_string(),
        ));
    }
    Ok(SecretString::from(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            classify_failure(401, "Bad credentials"),
            WalletError::AuthError(msg) if msg == "Bad credentials"
        ));
        assert!(classify_failure(403, "").is_auth());
        assert!(matches!(
            classify_failure(400, r#"{"message":"Insufficient balance"}"#),
            WalletError::ValidationError(msg) if msg == "Insufficient balance"
        ));
        assert!(matches!(
            classify_failure(404, r#"{"error":"QR expired"}"#),
            WalletError::NotFoundError(msg) if msg == "QR expired"
        ));
        assert!(matches!(
            classify_failure(409, ""),
            WalletError::ValidationError(_)
        ));
        assert!(matches!(
            classify_failure(503, "\"maintenance\""),
            WalletError::ServerError { status: 503, message } if message == "maintenance"
        ));
    }

    #[test]
    fn token_shapes_are_accepted() {
        assert_eq!(parse_token("eyJ.abc.def\n").unwrap().expose_secret(), "eyJ.abc.def");
        assert_eq!(parse_token("\"eyJ.abc\"").unwrap().expose_secret(), "eyJ.abc");
        assert_eq!(
            parse_token(r#"{"token":"eyJ.xyz"}"#).unwrap().expose_secret(),
            "eyJ.xyz"
        );
        assert!(parse_token("").is_err());
        assert!(parse_token(r#"{"user":"x"}"#).is_err());
        assert!(parse_token("not a token").is_err());
    }
}
