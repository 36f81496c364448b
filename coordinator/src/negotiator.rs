//! QR payment negotiation.
//!
//! The payee and payer sides are independent state machines. Each carries an
//! epoch that is bumped whenever its flow is abandoned or restarted, so a
//! response belonging to an older flow is dropped instead of applied.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::amount::Amount;
use crate::api::types::{
    GenerateQrRequest, PayQrRequest, QrRequestId, QrStatus, ServerReceipt, StatusEvent, UserId,
};
use crate::errors::{WalletError, WalletResult};
use crate::events::{CoordinatorEvent, EventBus};
use crate::gateway::RemoteGateway;
use crate::notifications::NotificationFeed;
use crate::realtime::StatusChannel;
use crate::session::SessionStore;
use crate::validation::InputValidator;

#[derive(Debug, Clone, PartialEq)]
pub struct QrPaymentRequest {
    pub id: QrRequestId,
    pub amount: Amount,
    pub creator_user_id: UserId,
    pub status: QrStatus,
    /// Text the payee renders as the QR image.
    pub qr_code_data: String,
}

/// Display-only pair carried by older QR payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyQrPayload {
    pub target_user_id: UserId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedPayload {
    pub request_id: QrRequestId,
    /// Sent back verbatim when settling.
    pub qr_code_data: String,
    pub legacy: Option<LegacyQrPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayeeState {
    Idle,
    Generating { amount: Amount },
    AwaitingSettlement(QrPaymentRequest),
    Settled(QrPaymentRequest),
    Expired(QrPaymentRequest),
    Failed(QrPaymentRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayerState {
    Idle,
    Scanned(ScannedPayload),
    Confirming(ScannedPayload),
    Paid {
        payload: ScannedPayload,
        receipt: ServerReceipt,
    },
    Failed {
        payload: Option<ScannedPayload>,
        error: WalletError,
    },
}

struct Flow<S> {
    state: S,
    epoch: u64,
}

impl<S> Flow<S> {
    fn restart(&mut self, state: S) -> u64 {
        self.state = state;
        self.epoch += 1;
        self.epoch
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanFields {
    #[serde(default, alias = "id", alias = "requestId")]
    qr_id: Option<QrRequestId>,
    #[serde(default)]
    user_id: Option<UserId>,
    #[serde(default)]
    amount: Option<Amount>,
}

/// Interpret a decoded QR string. The whole string is the request
/// identifier unless it is a JSON object naming one.
pub fn parse_scan(validator: &InputValidator, raw: &str) -> WalletResult<ScannedPayload> {
    let text = validator.validate_scan(raw)?;
    if !text.starts_with('{') {
        return Ok(ScannedPayload {
            request_id: QrRequestId::new(text),
            qr_code_data: text.to_string(),
            legacy: None,
        });
    }

    let fields: ScanFields = serde_json::from_str(text)
        .map_err(|_| WalletError::ValidationError("Unrecognized QR code".to_string()))?;
    let legacy = match (fields.user_id, fields.amount) {
        (Some(target_user_id), Some(amount)) => Some(LegacyQrPayload {
            target_user_id,
            amount,
        }),
        _ => None,
    };
    let request_id = match (fields.qr_id, &legacy) {
        (Some(id), _) => id,
        (None, Some(_)) => QrRequestId::new(text),
        (None, None) => {
            return Err(WalletError::ValidationError(
                "Unrecognized QR code".to_string(),
            ))
        }
    };

    Ok(ScannedPayload {
        request_id,
        qr_code_data: text.to_string(),
        legacy,
    })
}

#[derive(Clone)]
pub struct QrNegotiator {
    gateway: Arc<dyn RemoteGateway>,
    session: SessionStore,
    channel: StatusChannel,
    validator: Arc<InputValidator>,
    notifications: NotificationFeed,
    events: EventBus,
    payee: Arc<Mutex<Flow<PayeeState>>>,
    payer: Arc<Mutex<Flow<PayerState>>>,
}

impl fmt::Debug for QrNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QrNegotiator")
            .field("payee", &self.payee.lock().state)
            .field("payer", &self.payer.lock().state)
            .finish()
    }
}

impl QrNegotiator {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        session: SessionStore,
        channel: StatusChannel,
        validator: Arc<InputValidator>,
        notifications: NotificationFeed,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            session,
            channel,
            validator,
            notifications,
            events,
            payee: Arc::new(Mutex::new(Flow {
                state: PayeeState::Idle,
                epoch: 0,
            })),
            payer: Arc::new(Mutex::new(Flow {
                state: PayerState::Idle,
                epoch: 0,
            })),
        }
    }

    pub fn payee_state(&self) -> PayeeState {
        self.payee.lock().state.clone()
    }

    pub fn payer_state(&self) -> PayerState {
        self.payer.lock().state.clone()
    }

    /// Mint a payment request and watch it until settlement.
    pub async fn generate(&self, amount: Amount) -> WalletResult<QrPaymentRequest> {
        self.validator.validate_amount(amount)?;
        let auth = self.session.authorize()?;
        let creator = self
            .session
            .user_id()
            .ok_or_else(|| WalletError::AuthError("Profile not loaded".to_string()))?;

        let epoch = {
            let mut payee = self.payee.lock();
            if matches!(payee.state, PayeeState::Generating { .. }) {
                return Err(WalletError::InvalidState(
                    "A QR request is already being generated".to_string(),
                ));
            }
            self.channel.unsubscribe();
            payee.restart(PayeeState::Generating { amount })
        };

        let result = self
            .gateway
            .generate_qr(&auth.credential, &GenerateQrRequest { amount })
            .await;
        let result = self.session.enforce(auth.epoch, result);

        let mut payee = self.payee.lock();
        if payee.epoch != epoch {
            log::debug!("Discarding QR generation for an abandoned flow");
            return Err(WalletError::Cancelled);
        }
        let generated = match result {
            Ok(generated) => generated,
            Err(e) => {
                log::warn!("QR generation failed: {}", e);
                payee.state = PayeeState::Idle;
                return Err(e);
            }
        };

        let request = QrPaymentRequest {
            qr_code_data: generated
                .qr_code_data
                .unwrap_or_else(|| generated.id.to_string()),
            id: generated.id,
            amount: generated.amount.unwrap_or(amount),
            creator_user_id: creator,
            status: QrStatus::Created,
        };
        payee.state = PayeeState::AwaitingSettlement(request.clone());

        let negotiator = self.clone();
        self.channel.subscribe(request.id.clone(), move |event| {
            tokio::spawn(async move { negotiator.apply_status(epoch, event).await });
        });
        log::info!("QR request {} created for {}", request.id, request.amount);
        Ok(request)
    }

    /// Abandon the payee flow; the server-side request is left to expire.
    pub fn cancel_request(&self) {
        let mut payee = self.payee.lock();
        self.channel.unsubscribe();
        if payee.state != PayeeState::Idle {
            log::debug!("Payee flow cancelled");
        }
        payee.restart(PayeeState::Idle);
    }

    /// Ingest a decoded QR string. No network call is made.
    pub fn scan(&self, raw: &str) -> WalletResult<ScannedPayload> {
        let parsed = parse_scan(&self.validator, raw);
        let mut payer = self.payer.lock();
        match parsed {
            Ok(payload) => {
                log::debug!("Scanned QR request {}", payload.request_id);
                payer.restart(PayerState::Scanned(payload.clone()));
                Ok(payload)
            }
            Err(e) => {
                payer.restart(PayerState::Failed {
                    payload: None,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Settle the scanned request under the caller's identity.
    pub async fn confirm_pay(&self, request_id: &QrRequestId) -> WalletResult<ServerReceipt> {
        let auth = self.session.authorize()?;
        let payer_id = self
            .session
            .user_id()
            .ok_or_else(|| WalletError::AuthError("Profile not loaded".to_string()))?;

        let (payload, epoch) = {
            let mut payer = self.payer.lock();
            let payload = match &payer.state {
                PayerState::Scanned(payload) if &payload.request_id == request_id => {
                    payload.clone()
                }
                PayerState::Scanned(_) => {
                    return Err(WalletError::ValidationError(
                        "Request does not match the scanned code".to_string(),
                    ))
                }
                _ => {
                    return Err(WalletError::InvalidState(
                        "No scanned QR code awaiting confirmation".to_string(),
                    ))
                }
            };
            payer.state = PayerState::Confirming(payload.clone());
            (payload, payer.epoch)
        };

        let request = PayQrRequest {
            qr_code_data: payload.qr_code_data.clone(),
            payer_id,
        };
        let result = self.gateway.pay_qr(&auth.credential, &request).await;
        let result = self.session.enforce(auth.epoch, result);

        let current = {
            let mut payer = self.payer.lock();
            let current = payer.epoch == epoch;
            if current {
                payer.state = match &result {
                    Ok(receipt) => PayerState::Paid {
                        payload: payload.clone(),
                        receipt: receipt.clone(),
                    },
                    Err(e) if e.is_transient() => PayerState::Scanned(payload.clone()),
                    Err(e) => PayerState::Failed {
                        payload: Some(payload.clone()),
                        error: e.clone(),
                    },
                };
            }
            current
        };

        // Settlement is not cancellable, so the balance is refreshed even for
        // an abandoned flow.
        if result.is_ok() {
            if let Err(e) = self.session.fetch_profile(None).await {
                log::warn!("Balance refresh after QR payment failed: {}", e);
            }
        }
        if !current {
            log::debug!("Discarding QR payment result for an abandoned flow");
            return Err(WalletError::Cancelled);
        }

        let receipt = result?;
        log::info!("QR request {} paid", payload.request_id);
        let message = receipt
            .message
            .clone()
            .unwrap_or_else(|| "Payment sent".to_string());
        self.notifications
            .push(Some(payload.request_id.clone()), QrStatus::Paid, message);
        self.events.emit(CoordinatorEvent::QrStatusChanged {
            request_id: payload.request_id,
            status: QrStatus::Paid,
        });
        Ok(receipt)
    }

    /// Abandon the payer flow; a pending confirmation is ignored on arrival.
    pub fn cancel_scan(&self) {
        self.payer.lock().restart(PayerState::Idle);
    }

    pub fn reset(&self) {
        self.cancel_request();
        self.cancel_scan();
    }

    async fn apply_status(&self, epoch: u64, event: StatusEvent) {
        let settled = {
            let mut payee = self.payee.lock();
            if payee.epoch != epoch {
                log::debug!("Ignoring status for abandoned QR request {}", event.request_id);
                return;
            }
            let mut request = match &payee.state {
                PayeeState::AwaitingSettlement(request) if request.id == event.request_id => {
                    request.clone()
                }
                _ => return,
            };
            request.status = event.status;
            payee.state = match event.status {
                QrStatus::Paid => PayeeState::Settled(request.clone()),
                QrStatus::Expired => PayeeState::Expired(request.clone()),
                _ => PayeeState::Failed(request.clone()),
            };
            request
        };

        log::info!("QR request {} is {:?}", settled.id, event.status);
        let message = event.message.unwrap_or_else(|| match event.status {
            QrStatus::Paid => format!("Payment of {} received", settled.amount),
            QrStatus::Expired => "QR code expired".to_string(),
            _ => "Payment failed".to_string(),
        });
        self.notifications
            .push(Some(settled.id.clone()), event.status, message);
        self.events.emit(CoordinatorEvent::QrStatusChanged {
            request_id: settled.id,
            status: event.status,
        });

        if event.status == QrStatus::Paid {
            if let Err(e) = self.session.fetch_profile(None).await {
                log::warn!("Balance refresh after settlement failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryBackend;
    use crate::ledger::BalanceBook;
    use crate::storage::MemoryTokenStore;
    use secrecy::SecretString;
    use std::time::Duration;

    struct Party {
        session: SessionStore,
        negotiator: QrNegotiator,
        balance: BalanceBook,
        notifications: NotificationFeed,
    }

    async fn party(backend: &InMemoryBackend, email: &str, password: &str) -> Party {
        let gateway: Arc<dyn RemoteGateway> = Arc::new(backend.clone());
        let events = EventBus::default();
        let balance = BalanceBook::new(events.clone());
        let validator = Arc::new(InputValidator::new().unwrap());
        let session = SessionStore::new(
            gateway.clone(),
            Arc::new(MemoryTokenStore::new()),
            balance.clone(),
            validator.clone(),
            events.clone(),
        );
        let channel = StatusChannel::new(
            Arc::new(backend.clone()),
            "/topic/qr/",
            Duration::from_millis(20),
        );
        let notifications = NotificationFeed::new(20);
        let negotiator = QrNegotiator::new(
            gateway,
            session.clone(),
            channel,
            validator,
            notifications.clone(),
            events,
        );
        session
            .login(email, SecretString::from(password.to_string()))
            .await
            .unwrap();
        Party {
            session,
            negotiator,
            balance,
            notifications,
        }
    }

    fn backend() -> InMemoryBackend {
        InMemoryBackend::new()
            .with_account("Payee", "payee@example.com", "payee-pass", Amount::ZERO)
            .with_account("Payer", "payer@example.com", "payer-pass", Amount::from(800u64))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn scan_payload_shapes() {
        let validator = InputValidator::new().unwrap();

        let opaque = parse_scan(&validator, " 42 ").unwrap();
        assert_eq!(opaque.request_id, QrRequestId::new("42"));
        assert_eq!(opaque.qr_code_data, "42");
        assert!(opaque.legacy.is_none());

        let legacy = parse_scan(&validator, r#"{"userId":7,"amount":150}"#).unwrap();
        let pair = legacy.legacy.unwrap();
        assert_eq!(pair.target_user_id, UserId::Numeric(7));
        assert_eq!(pair.amount, Amount::from(150u64));

        let tagged = parse_scan(&validator, r#"{"qrId":"abc","amount":1}"#).unwrap();
        assert_eq!(tagged.request_id, QrRequestId::new("abc"));

        assert!(parse_scan(&validator, r#"{"foo":1}"#).is_err());
        assert!(parse_scan(&validator, "{broken").is_err());
        assert!(parse_scan(&validator, "").is_err());
    }

    #[tokio::test]
    async fn payee_settles_when_payer_pays() {
        let backend = backend();
        let payee = party(&backend, "payee@example.com", "payee-pass").await;
        let payer = party(&backend, "payer@example.com", "payer-pass").await;

        let request = payee.negotiator.generate(Amount::from(500u64)).await.unwrap();
        assert!(matches!(
            payee.negotiator.payee_state(),
            PayeeState::AwaitingSettlement(_)
        ));

        let scanned = payer.negotiator.scan(&request.qr_code_data).unwrap();
        payer.negotiator.confirm_pay(&scanned.request_id).await.unwrap();
        assert!(matches!(payer.negotiator.payer_state(), PayerState::Paid { .. }));
        assert_eq!(payer.balance.snapshot().unwrap().amount, Amount::from(300u64));

        wait_for(|| matches!(payee.negotiator.payee_state(), PayeeState::Settled(_))).await;
        wait_for(|| payee.balance.snapshot().map(|s| s.amount) == Some(Amount::from(500u64)))
            .await;
        assert!(payee.notifications.list()[0].is_highlighted());
    }

    #[tokio::test]
    async fn failed_generation_returns_to_idle() {
        let backend = backend();
        let payee = party(&backend, "payee@example.com", "payee-pass").await;

        backend.set_offline(true);
        let err = payee.negotiator.generate(Amount::from(10u64)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(payee.negotiator.payee_state(), PayeeState::Idle);

        backend.set_offline(false);
        let err = payee.negotiator.generate(Amount::ZERO).await.unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));
    }

    #[tokio::test]
    async fn invalid_scan_fails_without_network() {
        let backend = backend();
        let payer = party(&backend, "payer@example.com", "payer-pass").await;

        let err = payer.negotiator.scan("   ").unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));
        assert!(matches!(
            payer.negotiator.payer_state(),
            PayerState::Failed { payload: None, .. }
        ));

        payer.negotiator.cancel_scan();
        assert_eq!(payer.negotiator.payer_state(), PayerState::Idle);
        assert!(matches!(
            payer.negotiator.confirm_pay(&QrRequestId::new("1")).await,
            Err(WalletError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn expired_request_cannot_be_paid() {
        let backend = backend();
        let payee = party(&backend, "payee@example.com", "payee-pass").await;
        let payer = party(&backend, "payer@example.com", "payer-pass").await;

        let request = payee.negotiator.generate(Amount::from(50u64)).await.unwrap();
        backend.expire_qr(&request.id);
        wait_for(|| matches!(payee.negotiator.payee_state(), PayeeState::Expired(_))).await;

        payer.negotiator.scan(&request.qr_code_data).unwrap();
        let err = payer.negotiator.confirm_pay(&request.id).await.unwrap_err();
        assert!(matches!(err, WalletError::NotFoundError(_)));
        assert!(matches!(payer.negotiator.payer_state(), PayerState::Failed { .. }));
        assert_eq!(backend.balance_of("payer@example.com"), Some(Amount::from(800u64)));
    }

    #[tokio::test]
    async fn transient_failure_keeps_scan_for_retry() {
        let backend = backend();
        let payee = party(&backend, "payee@example.com", "payee-pass").await;
        let payer = party(&backend, "payer@example.com", "payer-pass").await;

        let request = payee.negotiator.generate(Amount::from(20u64)).await.unwrap();
        payer.negotiator.scan(&request.qr_code_data).unwrap();

        backend.set_offline(true);
        let err = payer.negotiator.confirm_pay(&request.id).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(payer.negotiator.payer_state(), PayerState::Scanned(_)));
        assert_eq!(backend.qr_status(&request.id), Some(QrStatus::Created));

        backend.set_offline(false);
        payer.negotiator.confirm_pay(&request.id).await.unwrap();
        assert_eq!(backend.qr_status(&request.id), Some(QrStatus::Paid));
        assert!(payer.session.is_active());
    }

    #[tokio::test]
    async fn cancelled_request_ignores_later_settlement() {
        let backend = backend();
        let payee = party(&backend, "payee@example.com", "payee-pass").await;
        let payer = party(&backend, "payer@example.com", "payer-pass").await;

        let request = payee.negotiator.generate(Amount::from(30u64)).await.unwrap();
        payee.negotiator.cancel_request();
        assert_eq!(payee.negotiator.payee_state(), PayeeState::Idle);

        payer.negotiator.scan(&request.qr_code_data).unwrap();
        payer.negotiator.confirm_pay(&request.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(payee.negotiator.payee_state(), PayeeState::Idle);
        assert!(payee.notifications.is_empty());
    }
}
