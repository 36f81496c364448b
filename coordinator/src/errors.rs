use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletError {
    // Session errors
    AuthError(String),

    // Input errors
    ValidationError(String),
    NotFoundError(String),

    // Transport errors
    NetworkError(String),
    ServerError { status: u16, message: String },
    InvalidResponse(String),
    ChannelError(String),

    // Local errors
    StorageError(String),
    InvalidState(String),
    Cancelled,
}

impl WalletError {
    /// Session is invalid or the backend refused the caller's authority.
    pub fn is_auth(&self) -> bool {
        matches!(self, WalletError::AuthError(_))
    }

    /// Failures a caller may offer to retry manually.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WalletError::NetworkError(_)
                | WalletError::ServerError { .. }
                | WalletError::ChannelError(_)
        )
    }
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::AuthError(msg) => write!(f, "Authentication error: {}", msg),

            WalletError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            WalletError::NotFoundError(msg) => write!(f, "Not found: {}", msg),

            WalletError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            WalletError::ServerError { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            WalletError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            WalletError::ChannelError(msg) => write!(f, "Realtime channel error: {}", msg),

            WalletError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            WalletError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            WalletError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for WalletError {}

pub type WalletResult<T> = Result<T, WalletError>;

impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        WalletError::StorageError(error.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(error: serde_json::Error) -> Self {
        WalletError::InvalidResponse(format!("JSON error: {}", error))
    }
}

impl From<reqwest::Error> for WalletError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            WalletError::NetworkError(format!("Request timed out: {}", error))
        } else if error.is_decode() {
            WalletError::InvalidResponse(error.to_string())
        } else {
            WalletError::NetworkError(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WalletError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        WalletError::ChannelError(error.to_string())
    }
}
