use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::amount::Amount;

/// Backend user identifier; the server may emit numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserId::Numeric(id) => write!(f, "{}", id),
            UserId::Text(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId::Text(value.to_string())
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        UserId::Numeric(value)
    }
}

/// Server-issued QR payment request identifier, treated as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QrRequestId(String);

impl QrRequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QrRequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for QrRequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match UserId::deserialize(deserializer)? {
            UserId::Numeric(id) => Ok(QrRequestId(id.to_string())),
            UserId::Text(id) => Ok(QrRequestId(id)),
        }
    }
}

/// Lifecycle of a QR payment request as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QrStatus {
    Created,
    Scanned,
    Paid,
    Expired,
    Failed,
}

impl QrStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QrStatus::Paid | QrStatus::Expired | QrStatus::Failed)
    }

    /// Map a backend status label; unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "CREATED" | "PENDING" | "ACTIVE" => Some(QrStatus::Created),
            "SCANNED" => Some(QrStatus::Scanned),
            "PAID" | "SUCCESS" | "COMPLETED" | "SETTLED" => Some(QrStatus::Paid),
            "EXPIRED" => Some(QrStatus::Expired),
            "FAILED" | "CANCELLED" | "REJECTED" => Some(QrStatus::Failed),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for QrStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        QrStatus::parse(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown QR status '{}'", label)))
    }
}

fn expose<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(flag)) => flag,
        Some(serde_json::Value::String(text)) => !text.trim().is_empty(),
        Some(_) => true,
    })
}

fn default_role() -> String {
    "USER".to_string()
}

/// Authenticated user identity, replaced wholesale on every profile fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub active: bool,
    #[serde(
        default,
        rename = "kycDocument",
        alias = "kycVerified",
        deserialize_with = "present"
    )]
    pub kyc_verified: bool,
}

/// `GET /api/auth/profile`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub wallet_balance: Amount,
}

/// Entry of the peer directory returned by `GET /api/auth/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    #[serde(serialize_with = "expose")]
    pub password: SecretString,
    pub phone: String,
}

/// Registration may answer with the created user or a plain message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RegistrationReceipt {
    Created(UserSummary),
    Message(String),
}

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    #[serde(serialize_with = "expose")]
    pub password: SecretString,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopUpRequest {
    pub amount: Amount,
}

/// Any response carrying the caller's authoritative balance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub wallet_balance: Amount,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub receiver_id: UserId,
    pub amount: Amount,
    #[serde(serialize_with = "expose")]
    pub password: SecretString,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateQrRequest {
    pub amount: Amount,
}

/// `POST /api/qr/generate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQr {
    pub id: QrRequestId,
    #[serde(default)]
    pub qr_code_data: Option<String>,
    #[serde(default)]
    pub amount: Option<Amount>,
    #[serde(default)]
    pub status: Option<QrStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayQrRequest {
    pub qr_code_data: String,
    pub payer_id: UserId,
}

/// Result body of transfer and QR settlement calls.
///
/// The backend answers either with a JSON object or a bare message string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerReceipt {
    pub message: Option<String>,
    pub status: Option<String>,
    pub wallet_balance: Option<Amount>,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl<'de> Deserialize<'de> for ServerReceipt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(message) => ServerReceipt {
                message: Some(message),
                ..ServerReceipt::default()
            },
            serde_json::Value::Object(details) => {
                let text = |key: &str| {
                    details
                        .get(key)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                let message = text("message");
                let status = text("status");
                let wallet_balance = details
                    .get("walletBalance")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<Amount>(v).ok());
                ServerReceipt {
                    message,
                    status,
                    wallet_balance,
                    details,
                }
            }
            _ => ServerReceipt::default(),
        })
    }
}

/// Push payload published on `/topic/qr/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub request_id: QrRequestId,
    pub status: QrStatus,
    pub message: Option<String>,
    pub amount: Option<Amount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawStatusEvent {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "id", alias = "requestId")]
    pub qr_id: Option<QrRequestId>,
    #[serde(default)]
    pub amount: Option<Amount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_accepts_numeric_ids_and_kyc_presence() {
        let body = r#"{
            "id": 7,
            "name": "Asha",
            "email": "asha@example.com",
            "role": "USER",
            "active": true,
            "kycDocument": "passport.pdf",
            "walletBalance": 1200.5
        }"#;
        let profile: ProfileResponse = serde_json::from_str(body).unwrap();
        assert_eq!(profile.user.id, UserId::Numeric(7));
        assert!(profile.user.kyc_verified);
        assert!(profile.user.active);
        assert_eq!(profile.wallet_balance, "1200.5".parse().unwrap());
    }

    #[test]
    fn missing_kyc_document_means_pending() {
        let body = r#"{"id":"u1","name":"B","email":"b@example.com","kycDocument":null}"#;
        let profile: ProfileResponse = serde_json::from_str(body).unwrap();
        assert!(!profile.user.kyc_verified);
        assert_eq!(profile.user.role, "USER");
        assert_eq!(profile.wallet_balance, Amount::ZERO);
    }

    #[test]
    fn receipt_accepts_plain_message() {
        let receipt: ServerReceipt = serde_json::from_str("\"Transfer successful\"").unwrap();
        assert_eq!(receipt.message.as_deref(), Some("Transfer successful"));

        let receipt: ServerReceipt =
            serde_json::from_str(r#"{"status":"SUCCESS","walletBalance":40}"#).unwrap();
        assert_eq!(receipt.status.as_deref(), Some("SUCCESS"));
        assert_eq!(receipt.wallet_balance, Some(Amount::from(40u64)));
    }

    #[test]
    fn transfer_request_exposes_password_only_on_the_wire() {
        let request = TransferRequest {
            receiver_id: UserId::from("u2"),
            amount: Amount::from(100u64),
            password: SecretString::from("hunter22".to_string()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["receiverId"], "u2");
        assert_eq!(json["password"], "hunter22");
        assert!(!format!("{:?}", request).contains("hunter22"));
    }

    #[test]
    fn status_labels_map_to_terminal_states() {
        assert_eq!(QrStatus::parse("paid"), Some(QrStatus::Paid));
        assert!(QrStatus::parse("EXPIRED").unwrap().is_terminal());
        assert!(!QrStatus::Created.is_terminal());
        assert_eq!(QrStatus::parse("weird"), None);
    }
}
