use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::amount::Amount;
use crate::api::types::{
    QrRequestId, RegisterRequest, RegistrationReceipt, ServerReceipt, User, UserId, UserSummary,
};
use crate::config_store::{ConfigStore, CoordinatorConfig};
use crate::errors::{WalletError, WalletResult};
use crate::events::{CoordinatorEvent, EventBus};
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::ledger::{BalanceBook, BalanceSnapshot, TransferIntent, WalletLedger};
use crate::negotiator::{PayeeState, PayerState, QrNegotiator, QrPaymentRequest, ScannedPayload};
use crate::notifications::{Notification, NotificationFeed};
use crate::realtime::{PushTransport, StatusChannel, StompTransport};
use crate::session::SessionStore;
use crate::storage::{ClientPaths, FileTokenStore, TokenStore};
use crate::validation::InputValidator;

/// Composition root exposing session, wallet and QR operations.
///
/// Whenever the session ends, whether by `logout` or by a rejected
/// credential, both QR flows are reset and their subscription released.
#[derive(Debug)]
pub struct WalletCoordinator {
    config: CoordinatorConfig,
    config_store: Option<ConfigStore>,
    session: SessionStore,
    ledger: WalletLedger,
    negotiator: QrNegotiator,
    notifications: NotificationFeed,
    events: EventBus,
}

impl WalletCoordinator {
    /// Build the production stack rooted at `root_dir`.
    pub fn initialize(root_dir: impl AsRef<Path>) -> WalletResult<Self> {
        let environment =
            std::env::var("EWALLET_ENV").unwrap_or_else(|_| "development".to_string());
        let paths = ClientPaths::new(root_dir)?;
        paths.ensure_directories()?;

        let config_store = ConfigStore::from_paths(&paths);
        let mut config = config_store.load_or_default(environment)?;
        config.apply_env_overrides();
        log::info!(
            "Coordinator starting in {} against {}",
            config.environment,
            config.network.api_base_url
        );

        let gateway = Arc::new(HttpGateway::from_config(&config.network)?);
        let transport = Arc::new(StompTransport::from_config(&config.realtime));
        let tokens = Arc::new(FileTokenStore::from_paths(&paths));

        let mut coordinator = Self::from_parts(config, gateway, transport, tokens)?;
        coordinator.config_store = Some(config_store);
        Ok(coordinator)
    }

    /// Wire the coordinator over explicit collaborators.
    pub fn from_parts(
        config: CoordinatorConfig,
        gateway: Arc<dyn RemoteGateway>,
        transport: Arc<dyn PushTransport>,
        tokens: Arc<dyn TokenStore>,
    ) -> WalletResult<Self> {
        let events = EventBus::default();
        let validator = Arc::new(InputValidator::new()?);
        let balance = BalanceBook::new(events.clone());
        let notifications = NotificationFeed::new(config.notifications.capacity);

        let session = SessionStore::new(
            gateway.clone(),
            tokens,
            balance.clone(),
            validator.clone(),
            events.clone(),
        );
        let ledger = WalletLedger::new(
            gateway.clone(),
            session.clone(),
            balance,
            validator.clone(),
            events.clone(),
        );
        let channel = StatusChannel::from_config(transport, &config.realtime);
        let negotiator = QrNegotiator::new(
            gateway,
            session.clone(),
            channel,
            validator,
            notifications.clone(),
            events.clone(),
        );

        Ok(Self {
            config,
            config_store: None,
            session,
            ledger,
            negotiator,
            notifications,
            events,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.config.environment
    }

    /// Persist a configuration change. Network settings apply on next start.
    pub fn update_config<F>(&mut self, updater: F) -> WalletResult<CoordinatorConfig>
    where
        F: FnOnce(&mut CoordinatorConfig) -> WalletResult<()>,
    {
        let store = self.config_store.as_ref().ok_or_else(|| {
            WalletError::InvalidState("Coordinator has no configuration file".to_string())
        })?;
        let updated = store.update(self.config.environment.clone(), updater)?;
        self.config = updated.clone();
        Ok(updated)
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    // Session

    pub async fn register(&self, request: &RegisterRequest) -> WalletResult<RegistrationReceipt> {
        self.session.register(request).await
    }

    pub async fn login(&self, email: &str, password: SecretString) -> WalletResult<User> {
        // A previous session may have ended in the background without
        // passing through `logout`.
        self.end_session_flows();
        let result = self.session.login(email, password).await;
        self.after_call(result)
    }

    pub async fn resume(&self) -> WalletResult<bool> {
        let result = self.session.resume().await;
        self.after_call(result)
    }

    pub async fn fetch_profile(&self) -> WalletResult<User> {
        let result = self.session.fetch_profile(None).await;
        self.after_call(result)
    }

    pub fn logout(&self) {
        self.session.logout();
        self.end_session_flows();
    }

    pub fn current_user(&self) -> Option<User> {
        self.session.current_user()
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_active()
    }

    // Wallet

    pub fn balance(&self) -> Option<BalanceSnapshot> {
        self.ledger.balance()
    }

    pub fn peers(&self) -> Vec<UserSummary> {
        self.ledger.peers()
    }

    pub async fn refresh_balance(&self) -> WalletResult<BalanceSnapshot> {
        let result = self.ledger.refresh_balance().await;
        self.after_call(result)
    }

    pub async fn top_up(&self, amount: Amount) -> WalletResult<BalanceSnapshot> {
        let result = self.ledger.top_up(amount).await;
        self.after_call(result)
    }

    pub async fn transfer(
        &self,
        receiver_id: impl Into<UserId>,
        amount: Amount,
        password: SecretString,
    ) -> WalletResult<ServerReceipt> {
        let intent = TransferIntent::new(receiver_id, amount, password);
        let result = self.ledger.transfer(intent).await;
        self.after_call(result)
    }

    pub async fn fetch_peers(&self) -> WalletResult<Vec<UserSummary>> {
        let result = self.ledger.fetch_peers().await;
        self.after_call(result)
    }

    // QR payments

    pub async fn generate_qr(&self, amount: Amount) -> WalletResult<QrPaymentRequest> {
        let result = self.negotiator.generate(amount).await;
        self.after_call(result)
    }

    pub fn cancel_qr_request(&self) {
        self.negotiator.cancel_request();
    }

    pub fn scan_qr(&self, raw: &str) -> WalletResult<ScannedPayload> {
        self.negotiator.scan(raw)
    }

    pub async fn confirm_qr_payment(&self, request_id: &QrRequestId) -> WalletResult<ServerReceipt> {
        let result = self.negotiator.confirm_pay(request_id).await;
        self.after_call(result)
    }

    pub fn cancel_scan(&self) {
        self.negotiator.cancel_scan();
    }

    pub fn payee_state(&self) -> PayeeState {
        self.negotiator.payee_state()
    }

    pub fn payer_state(&self) -> PayerState {
        self.negotiator.payer_state()
    }

    // Notifications

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.list()
    }

    pub fn dismiss_notification(&self, id: Uuid) -> bool {
        self.notifications.dismiss(id)
    }

    pub fn clear_notifications(&self) {
        self.notifications.clear();
    }

    fn after_call<T>(&self, result: WalletResult<T>) -> WalletResult<T> {
        if let Err(e) = &result {
            if e.is_auth() && !self.session.is_active() {
                self.end_session_flows();
            }
        }
        result
    }

    fn end_session_flows(&self) {
        self.negotiator.reset();
        self.notifications.clear();
    }
}
