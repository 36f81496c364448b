//! In-process wallet backend.
//!
//! Implements both [`RemoteGateway`] and [`PushTransport`] over shared state
//! so the coordinator can be driven end to end without a server. Settling a
//! QR request publishes the status payload on its topic, and the last payload
//! of every topic is replayed to connections opened afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::RemoteGateway;
use crate::amount::Amount;
use crate::api::types::{
    GenerateQrRequest, GeneratedQr, LoginRequest, PayQrRequest, ProfileResponse, QrRequestId,
    QrStatus, RegisterRequest, RegistrationReceipt, ServerReceipt, TopUpRequest,
    TransferRequest, User, UserId, UserSummary, WalletSnapshot,
};
use crate::errors::{WalletError, WalletResult};
use crate::realtime::{PushStream, PushTransport};

const QR_TOPIC_PREFIX: &str = "/topic/qr/";

struct Account {
    id: UserId,
    name: String,
    email: String,
    phone: Option<String>,
    password: SecretString,
    balance: Amount,
    kyc_verified: bool,
}

impl Account {
    fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

struct QrRecord {
    creator: UserId,
    amount: Amount,
    status: QrStatus,
}

#[derive(Default)]
struct BackendState {
    next_user_id: i64,
    next_qr_id: u64,
    accounts: Vec<Account>,
    tokens: HashMap<String, UserId>,
    qr_requests: HashMap<String, QrRecord>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    retained: HashMap<String, String>,
    push_connections_opened: usize,
    offline: bool,
    transfer_fee: Amount,
    transfer_receipts_omit_balance: bool,
}

impl BackendState {
    fn account(&self, id: &UserId) -> Option<&Account> {
        self.accounts.iter().find(|account| &account.id == id)
    }

    fn account_mut(&mut self, id: &UserId) -> Option<&mut Account> {
        self.accounts.iter_mut().find(|account| &account.id == id)
    }

    fn ensure_online(&self) -> WalletResult<()> {
        if self.offline {
            return Err(WalletError::NetworkError("backend unreachable".to_string()));
        }
        Ok(())
    }

    fn authenticate(&self, credential: &SecretString) -> WalletResult<UserId> {
        self.ensure_online()?;
        self.tokens
            .get(credential.expose_secret())
            .cloned()
            .ok_or_else(|| WalletError::AuthError("Invalid or expired token".to_string()))
    }

    fn move_funds(&mut self, from: &UserId, to: &UserId, amount: Amount) -> WalletResult<Amount> {
        let sender = self
            .account(from)
            .ok_or_else(|| WalletError::NotFoundError("Sender not found".to_string()))?;
        if sender.balance < amount {
            return Err(WalletError::ValidationError("Insufficient balance".to_string()));
        }
        let remaining = sender
            .balance
            .checked_sub(amount)
            .ok_or_else(|| WalletError::ValidationError("Amount out of range".to_string()))?;
        let receiver = self
            .account(to)
            .ok_or_else(|| WalletError::ValidationError("Receiver not found".to_string()))?;
        let credited = receiver
            .balance
            .checked_add(amount)
            .ok_or_else(|| WalletError::ValidationError("Amount out of range".to_string()))?;

        if let Some(receiver) = self.account_mut(to) {
            receiver.balance = credited;
        }
        if let Some(sender) = self.account_mut(from) {
            sender.balance = remaining;
        }
        Ok(remaining)
    }

    fn publish(&mut self, destination: &str, body: String) {
        if let Some(subscribers) = self.subscribers.get_mut(destination) {
            subscribers.retain(|subscriber| subscriber.send(body.clone()).is_ok());
        }
        self.retained.insert(destination.to_string(), body);
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBackend")
            .field("accounts", &state.accounts.len())
            .field("qr_requests", &state.qr_requests.len())
            .field("offline", &state.offline)
            .finish()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`InMemoryBackend::add_account`].
    pub fn with_account(self, name: &str, email: &str, password: &str, balance: Amount) -> Self {
        self.add_account(name, email, password, balance);
        self
    }

    pub fn add_account(&self, name: &str, email: &str, password: &str, balance: Amount) -> UserId {
        let mut state = self.state.lock();
        state.next_user_id += 1;
        let id = UserId::Numeric(state.next_user_id);
        state.accounts.push(Account {
            id: id.clone(),
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            password: SecretString::from(password.to_string()),
            balance,
            kyc_verified: true,
        });
        id
    }

    pub fn user_id(&self, email: &str) -> Option<UserId> {
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .find(|account| account.email.eq_ignore_ascii_case(email))
            .map(|account| account.id.clone())
    }

    pub fn balance_of(&self, email: &str) -> Option<Amount> {
        let state = self.state.lock();
        state
            .accounts
            .iter()
            .find(|account| account.email.eq_ignore_ascii_case(email))
            .map(|account| account.balance)
    }

    pub fn qr_status(&self, id: &QrRequestId) -> Option<QrStatus> {
        self.state
            .lock()
            .qr_requests
            .get(id.as_str())
            .map(|record| record.status)
    }

    /// Make every request fail as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Charge `fee` to the sender on every transfer, on top of the amount.
    pub fn set_transfer_fee(&self, fee: Amount) {
        self.state.lock().transfer_fee = fee;
    }

    /// Answer transfers with a bare success receipt, without `walletBalance`.
    pub fn omit_balance_from_transfer_receipts(&self, omit: bool) {
        self.state.lock().transfer_receipts_omit_balance = omit;
    }

    /// Invalidate every issued token.
    pub fn revoke_tokens(&self) {
        self.state.lock().tokens.clear();
    }

    pub fn expire_qr(&self, id: &QrRequestId) {
        let mut state = self.state.lock();
        let Some(record) = state.qr_requests.get_mut(id.as_str()) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.status = QrStatus::Expired;
        let body = serde_json::json!({
            "status": "EXPIRED",
            "qrId": id.as_str(),
            "message": "QR code expired",
        })
        .to_string();
        state.publish(&format!("{}{}", QR_TOPIC_PREFIX, id), body);
    }

    pub fn publish(&self, destination: &str, body: &str) {
        self.state.lock().publish(destination, body.to_string());
    }

    /// End every open push stream, as a dropped socket would.
    pub fn drop_push_connections(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn push_connections_opened(&self) -> usize {
        self.state.lock().push_connections_opened
    }
}

#[async_trait]
impl RemoteGateway for InMemoryBackend {
    async fn register(&self, request: &RegisterRequest) -> WalletResult<RegistrationReceipt> {
        let mut state = self.state.lock();
        state.ensure_online()?;
        if state
            .accounts
            .iter()
            .any(|account| account.email.eq_ignore_ascii_case(&request.email))
        {
            return Err(WalletError::ValidationError(
                "Email already registered".to_string(),
            ));
        }

        state.next_user_id += 1;
        let account = Account {
            id: UserId::Numeric(state.next_user_id),
            name: request.name.clone(),
            email: request.email.clone(),
            phone: Some(request.phone.clone()),
            password: SecretString::from(request.password.expose_secret().to_string()),
            balance: Amount::ZERO,
            kyc_verified: false,
        };
        let summary = account.summary();
        state.accounts.push(account);
        Ok(RegistrationReceipt::Created(summary))
    }

    async fn login(&self, request: &LoginRequest) -> WalletResult<SecretString> {
        let mut state = self.state.lock();
        state.ensure_online()?;
        let id = state
            .accounts
            .iter()
            .find(|account| {
                account.email.eq_ignore_ascii_case(&request.email)
                    && account.password.expose_secret() == request.password.expose_secret()
            })
            .map(|account| account.id.clone())
            .ok_or_else(|| WalletError::AuthError("Invalid email or password".to_string()))?;

        let token = format!("mem.{}", Uuid::new_v4().simple());
        state.tokens.insert(token.clone(), id);
        Ok(SecretString::from(token))
    }

    async fn profile(&self, credential: &SecretString) -> WalletResult<ProfileResponse> {
        let state = self.state.lock();
        let id = state.authenticate(credential)?;
        let account = state
            .account(&id)
            .ok_or_else(|| WalletError::NotFoundError("User not found".to_string()))?;
        Ok(ProfileResponse {
            user: User {
                id: account.id.clone(),
                name: account.name.clone(),
                email: account.email.clone(),
                phone: account.phone.clone(),
                role: "USER".to_string(),
                active: true,
                kyc_verified: account.kyc_verified,
            },
            wallet_balance: account.balance,
        })
    }

    async fn list_users(&self, credential: &SecretString) -> WalletResult<Vec<UserSummary>> {
        let state = self.state.lock();
        state.authenticate(credential)?;
        Ok(state.accounts.iter().map(Account::summary).collect())
    }

    async fn top_up(
        &self,
        credential: &SecretString,
        request: &TopUpRequest,
    ) -> WalletResult<WalletSnapshot> {
        let mut state = self.state.lock();
        let id = state.authenticate(credential)?;
        if !request.amount.is_positive() {
            return Err(WalletError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }
        let account = state
            .account_mut(&id)
            .ok_or_else(|| WalletError::NotFoundError("User not found".to_string()))?;
        account.balance = account
            .balance
            .checked_add(request.amount)
            .ok_or_else(|| WalletError::ValidationError("Amount out of range".to_string()))?;
        Ok(WalletSnapshot {
            wallet_balance: account.balance,
        })
    }

    async fn transfer(
        &self,
        credential: &SecretString,
        request: &TransferRequest,
    ) -> WalletResult<ServerReceipt> {
        let mut state = self.state.lock();
        let id = state.authenticate(credential)?;
        let sender = state
            .account(&id)
            .ok_or_else(|| WalletError::NotFoundError("User not found".to_string()))?;
        if sender.password.expose_secret() != request.password.expose_secret() {
            return Err(WalletError::AuthError("Incorrect password".to_string()));
        }
        if request.receiver_id == id {
            return Err(WalletError::ValidationError(
                "Cannot transfer to yourself".to_string(),
            ));
        }
        if !request.amount.is_positive() {
            return Err(WalletError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }

        let mut remaining = state.move_funds(&id, &request.receiver_id, request.amount)?;
        let fee = state.transfer_fee;
        if fee.is_positive() {
            remaining = remaining.saturating_debit(fee);
            if let Some(sender) = state.account_mut(&id) {
                sender.balance = remaining;
            }
        }
        Ok(ServerReceipt {
            message: Some("Transfer successful".to_string()),
            status: Some("SUCCESS".to_string()),
            wallet_balance: (!state.transfer_receipts_omit_balance).then_some(remaining),
            ..ServerReceipt::default()
        })
    }

    async fn generate_qr(
        &self,
        credential: &SecretString,
        request: &GenerateQrRequest,
    ) -> WalletResult<GeneratedQr> {
        let mut state = self.state.lock();
        let creator = state.authenticate(credential)?;
        if !request.amount.is_positive() {
            return Err(WalletError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }

        state.next_qr_id += 1;
        let id = state.next_qr_id.to_string();
        state.qr_requests.insert(
            id.clone(),
            QrRecord {
                creator,
                amount: request.amount,
                status: QrStatus::Created,
            },
        );
        Ok(GeneratedQr {
            id: QrRequestId::new(id.clone()),
            qr_code_data: Some(id),
            amount: Some(request.amount),
            status: Some(QrStatus::Created),
        })
    }

    async fn pay_qr(
        &self,
        credential: &SecretString,
        request: &PayQrRequest,
    ) -> WalletResult<ServerReceipt> {
        let mut state = self.state.lock();
        let payer = state.authenticate(credential)?;
        if request.payer_id != payer {
            return Err(WalletError::AuthError(
                "Payer does not match the session".to_string(),
            ));
        }

        let (creator, amount) = match state.qr_requests.get(&request.qr_code_data) {
            Some(record) if record.status == QrStatus::Paid => {
                return Err(WalletError::ValidationError(
                    "QR code already used".to_string(),
                ))
            }
            Some(record) if !record.status.is_terminal() => (record.creator.clone(), record.amount),
            _ => {
                return Err(WalletError::NotFoundError(
                    "QR code not found or expired".to_string(),
                ))
            }
        };
        if creator == payer {
            return Err(WalletError::ValidationError(
                "Cannot pay your own QR code".to_string(),
            ));
        }

        let remaining = state.move_funds(&payer, &creator, amount)?;
        if let Some(record) = state.qr_requests.get_mut(&request.qr_code_data) {
            record.status = QrStatus::Paid;
        }

        let body = serde_json::json!({
            "status": "PAID",
            "qrId": request.qr_code_data,
            "amount": amount,
            "message": format!("Payment of {} received", amount),
        })
        .to_string();
        state.publish(&format!("{}{}", QR_TOPIC_PREFIX, request.qr_code_data), body);

        Ok(ServerReceipt {
            message: Some("Payment successful".to_string()),
            status: Some("PAID".to_string()),
            wallet_balance: Some(remaining),
            ..ServerReceipt::default()
        })
    }
}

#[async_trait]
impl PushTransport for InMemoryBackend {
    async fn open(&self, destination: &str) -> WalletResult<PushStream> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(WalletError::ChannelError("backend unreachable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(last) = state.retained.get(destination) {
            let _ = tx.send(last.clone());
        }
        state
            .subscribers
            .entry(destination.to_string())
            .or_default()
            .push(tx);
        state.push_connections_opened += 1;

        let messages = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|body| (Ok::<_, WalletError>(body), rx))
        });
        Ok(Box::pin(messages))
    }
}
