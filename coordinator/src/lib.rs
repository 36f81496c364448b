//! Client-side coordinator for the e-wallet backend: session handling,
//! cached balance and peers, and QR payment negotiation with realtime
//! settlement updates.

pub mod amount;
pub mod api;
pub mod config_store;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod negotiator;
pub mod notifications;
pub mod realtime;
pub mod session;
pub mod storage;
pub mod validation;

// Re-export common types
pub use amount::Amount;
pub use api::types::*;
pub use config_store::{
    ConfigStore, CoordinatorConfig, NetworkConfig, NotificationConfig, RealtimeConfig,
};
pub use coordinator::WalletCoordinator;
pub use errors::{WalletError, WalletResult};
pub use events::{CoordinatorEvent, EventBus};
pub use gateway::{HttpGateway, InMemoryBackend, RemoteGateway};
pub use ledger::{BalanceBook, BalanceSnapshot, TransferIntent, WalletLedger};
pub use negotiator::{
    LegacyQrPayload, PayeeState, PayerState, QrNegotiator, QrPaymentRequest, ScannedPayload,
};
pub use notifications::{Notification, NotificationFeed};
pub use realtime::{PushStream, PushTransport, StatusChannel, StompTransport};
pub use session::SessionStore;
pub use storage::{ClientPaths, FileTokenStore, MemoryTokenStore, TokenStore};
pub use validation::InputValidator;
