//! Cached wallet balance and peer directory.
//!
//! The backend owns the balance. Locally it is either authoritative (last
//! value the server reported) or provisional (an optimistic debit applied
//! after a transfer). Each local change bumps a generation counter and any
//! authoritative write overwrites provisional state unconditionally.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use secrecy::SecretString;
use serde::Serialize;

use crate::amount::Amount;
use crate::api::types::{ServerReceipt, TopUpRequest, TransferRequest, UserId, UserSummary};
use crate::errors::{WalletError, WalletResult};
use crate::events::{CoordinatorEvent, EventBus};
use crate::gateway::RemoteGateway;
use crate::session::SessionStore;
use crate::validation::InputValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub amount: Amount,
    pub provisional: bool,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct BalanceState {
    current: Option<(Amount, bool)>,
    generation: u64,
}

impl BalanceState {
    fn snapshot(&self) -> Option<BalanceSnapshot> {
        self.current.map(|(amount, provisional)| BalanceSnapshot {
            amount,
            provisional,
            generation: self.generation,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BalanceBook {
    state: Arc<RwLock<BalanceState>>,
    events: EventBus,
}

impl BalanceBook {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Arc::new(RwLock::new(BalanceState::default())),
            events,
        }
    }

    pub fn snapshot(&self) -> Option<BalanceSnapshot> {
        self.state.read().snapshot()
    }

    pub fn set_authoritative(&self, amount: Amount) -> BalanceSnapshot {
        let snapshot = {
            let mut state = self.state.write();
            state.current = Some((amount, false));
            state.generation += 1;
            BalanceSnapshot {
                amount,
                provisional: false,
                generation: state.generation,
            }
        };
        self.events
            .emit(CoordinatorEvent::BalanceChanged(Some(snapshot)));
        snapshot
    }

    /// Optimistically subtract `amount`. No-op when no balance is cached.
    pub fn apply_provisional_debit(&self, amount: Amount) -> Option<BalanceSnapshot> {
        let snapshot = {
            let mut state = self.state.write();
            let (current, _) = state.current?;
            state.current = Some((current.saturating_debit(amount), true));
            state.generation += 1;
            state.snapshot()
        };
        self.events.emit(CoordinatorEvent::BalanceChanged(snapshot));
        snapshot
    }

    pub fn clear(&self) {
        let cleared = {
            let mut state = self.state.write();
            let had_balance = state.current.take().is_some();
            state.generation += 1;
            had_balance
        };
        if cleared {
            self.events.emit(CoordinatorEvent::BalanceChanged(None));
        }
    }
}

/// A transfer to submit; consumed by [`WalletLedger::transfer`].
pub struct TransferIntent {
    pub receiver_id: UserId,
    pub amount: Amount,
    pub password: SecretString,
}

impl TransferIntent {
    pub fn new(receiver_id: impl Into<UserId>, amount: Amount, password: SecretString) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            amount,
            password,
        }
    }
}

impl fmt::Debug for TransferIntent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransferIntent")
            .field("receiver_id", &self.receiver_id)
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct PeerDirectory {
    epoch: u64,
    peers: Vec<UserSummary>,
}

#[derive(Clone)]
pub struct WalletLedger {
    gateway: Arc<dyn RemoteGateway>,
    session: SessionStore,
    balance: BalanceBook,
    peers: Arc<RwLock<PeerDirectory>>,
    validator: Arc<InputValidator>,
    events: EventBus,
}

impl fmt::Debug for WalletLedger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WalletLedger")
            .field("balance", &self.balance.snapshot())
            .field("peers", &self.peers.read().peers.len())
            .finish()
    }
}

impl WalletLedger {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        session: SessionStore,
        balance: BalanceBook,
        validator: Arc<InputValidator>,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            session,
            balance,
            peers: Arc::new(RwLock::new(PeerDirectory::default())),
            validator,
            events,
        }
    }

    pub fn balance(&self) -> Option<BalanceSnapshot> {
        self.balance.snapshot()
    }

    /// Peers fetched during the current session, excluding the caller.
    pub fn peers(&self) -> Vec<UserSummary> {
        // Session lock before the directory lock, same as `fetch_peers`.
        let epoch = self.session.epoch();
        let directory = self.peers.read();
        if directory.epoch != epoch {
            return Vec::new();
        }
        directory.peers.clone()
    }

    /// Authoritative re-fetch through the session profile.
    pub async fn refresh_balance(&self) -> WalletResult<BalanceSnapshot> {
        self.session.fetch_profile(None).await?;
        self.balance.snapshot().ok_or(WalletError::Cancelled)
    }

    pub async fn top_up(&self, amount: Amount) -> WalletResult<BalanceSnapshot> {
        self.validator.validate_amount(amount)?;
        let auth = self.session.authorize()?;

        let result = self
            .gateway
            .top_up(&auth.credential, &TopUpRequest { amount })
            .await;
        let wallet = self.session.enforce(auth.epoch, result)?;

        log::info!("Top-up of {} accepted", amount);
        self.session.if_current(auth.epoch, || {
            self.balance.set_authoritative(wallet.wallet_balance)
        })
    }

    /// Submit a transfer authorized by a re-entered password.
    ///
    /// A rejected password is reported as `AuthError` without ending the
    /// session.
    pub async fn transfer(&self, intent: TransferIntent) -> WalletResult<ServerReceipt> {
        let TransferIntent {
            receiver_id,
            amount,
            password,
        } = intent;

        self.validator.validate_amount(amount)?;
        self.validator.validate_password_entry(&password)?;
        if !self.peers().iter().any(|peer| peer.id == receiver_id) {
            return Err(WalletError::ValidationError(
                "Receiver is not a known user".to_string(),
            ));
        }
        if let Some(snapshot) = self.balance.snapshot() {
            if amount > snapshot.amount {
                return Err(WalletError::ValidationError(
                    "Insufficient balance".to_string(),
                ));
            }
        }

        let auth = self.session.authorize()?;
        let request = TransferRequest {
            receiver_id,
            amount,
            password,
        };
        let receipt = self.gateway.transfer(&auth.credential, &request).await?;
        drop(request);

        log::info!("Transfer of {} submitted", amount);
        self.session.if_current(auth.epoch, || match receipt.wallet_balance {
            Some(balance) => {
                self.balance.set_authoritative(balance);
            }
            None => {
                self.balance.apply_provisional_debit(amount);
            }
        })?;
        Ok(receipt)
    }

    /// Repopulate the peer directory, leaving out the caller.
    pub async fn fetch_peers(&self) -> WalletResult<Vec<UserSummary>> {
        let auth = self.session.authorize()?;
        let result = self.gateway.list_users(&auth.credential).await;
        let users = self.session.enforce(auth.epoch, result)?;

        let own_id = self.session.user_id();
        let peers: Vec<UserSummary> = users
            .into_iter()
            .filter(|user| Some(&user.id) != own_id.as_ref())
            .collect();

        self.session.if_current(auth.epoch, || {
            *self.peers.write() = PeerDirectory {
                epoch: auth.epoch,
                peers: peers.clone(),
            };
        })?;
        self.events
            .emit(CoordinatorEvent::PeersUpdated { count: peers.len() });
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryBackend;
    use crate::storage::MemoryTokenStore;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    struct Fixture {
        backend: InMemoryBackend,
        session: SessionStore,
        ledger: WalletLedger,
    }

    async fn logged_in() -> Fixture {
        let backend = InMemoryBackend::new()
            .with_account("Asha", "asha@example.com", "asha-pass", Amount::from(1000u64))
            .with_account("Ravi", "ravi@example.com", "ravi-pass", Amount::ZERO);
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
        let ledger = WalletLedger::new(gateway, session.clone(), balance, validator, events);

        session
            .login("asha@example.com", secret("asha-pass"))
            .await
            .unwrap();
        Fixture {
            backend,
            session,
            ledger,
        }
    }

    #[test]
    fn authoritative_write_clears_provisional_flag() {
        let book = BalanceBook::new(EventBus::default());
        assert!(book.apply_provisional_debit(Amount::from(1u64)).is_none());

        let first = book.set_authoritative(Amount::from(100u64));
        let debited = book.apply_provisional_debit(Amount::from(30u64)).unwrap();
        assert!(debited.provisional);
        assert_eq!(debited.amount, Amount::from(70u64));
        assert!(debited.generation > first.generation);

        let refreshed = book.set_authoritative(Amount::from(75u64));
        assert!(!refreshed.provisional);
        assert!(refreshed.generation > debited.generation);
    }

    #[tokio::test]
    async fn top_up_then_refresh_adds_amount() {
        let fx = logged_in().await;
        let before = fx.ledger.balance().unwrap().amount;

        fx.ledger.top_up(Amount::from(250u64)).await.unwrap();
        let after = fx.ledger.refresh_balance().await.unwrap();
        assert_eq!(after.amount, before.checked_add(Amount::from(250u64)).unwrap());
        assert!(!after.provisional);

        assert!(matches!(
            fx.ledger.top_up(Amount::ZERO).await,
            Err(WalletError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn transfer_debits_and_reconciles() {
        let fx = logged_in().await;
        let peers = fx.ledger.fetch_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        let ravi = peers[0].id.clone();

        fx.ledger
            .transfer(TransferIntent::new(ravi, Amount::from(100u64), secret("asha-pass")))
            .await
            .unwrap();
        assert_eq!(fx.ledger.balance().unwrap().amount, Amount::from(900u64));
        assert_eq!(fx.backend.balance_of("ravi@example.com"), Some(Amount::from(100u64)));

        let refreshed = fx.ledger.refresh_balance().await.unwrap();
        assert_eq!(refreshed.amount, Amount::from(900u64));
    }

    #[tokio::test]
    async fn transfer_without_server_balance_is_provisional_until_refresh() {
        let fx = logged_in().await;
        fx.backend.set_transfer_fee(Amount::from(5u64));
        fx.backend.omit_balance_from_transfer_receipts(true);
        let ravi = fx.ledger.fetch_peers().await.unwrap()[0].id.clone();
        let before = fx.ledger.balance().unwrap();

        let receipt = fx
            .ledger
            .transfer(TransferIntent::new(ravi, Amount::from(100u64), secret("asha-pass")))
            .await
            .unwrap();
        assert!(receipt.wallet_balance.is_none());

        let local = fx.ledger.balance().unwrap();
        assert!(local.provisional);
        assert_eq!(local.amount, Amount::from(900u64));
        assert!(local.generation > before.generation);

        let refreshed = fx.ledger.refresh_balance().await.unwrap();
        assert!(!refreshed.provisional);
        assert_eq!(refreshed.amount, Amount::from(895u64));
        assert!(refreshed.generation > local.generation);
        assert_eq!(fx.backend.balance_of("ravi@example.com"), Some(Amount::from(100u64)));
    }

    #[tokio::test]
    async fn transfer_rejections_leave_balance_unchanged() {
        let fx = logged_in().await;
        let ravi = fx.ledger.fetch_peers().await.unwrap()[0].id.clone();
        let before = fx.ledger.balance().unwrap();

        let err = fx
            .ledger
            .transfer(TransferIntent::new(ravi.clone(), Amount::from(5000u64), secret("asha-pass")))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));

        let err = fx
            .ledger
            .transfer(TransferIntent::new(ravi, Amount::from(100u64), secret("wrong")))
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(fx.session.is_active());

        let err = fx
            .ledger
            .transfer(TransferIntent::new("nobody", Amount::from(1u64), secret("asha-pass")))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));

        assert_eq!(fx.ledger.balance().unwrap(), before);
        assert_eq!(fx.backend.balance_of("asha@example.com"), Some(Amount::from(1000u64)));
    }

    #[tokio::test]
    async fn peer_reads_wait_behind_session_writers_without_deadlock() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let fx = logged_in().await;
        fx.ledger.fetch_peers().await.unwrap();
        let epoch = fx.session.epoch();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        // Holds the session read lock, then writes the directory once released.
        let writer = {
            let session = fx.session.clone();
            let ledger = fx.ledger.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                let _ = session.if_current(epoch, || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    ledger.peers.write().peers.clear();
                });
                done.send("directory write").unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let logout = {
            let session = fx.session.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                session.logout();
                done.send("logout").unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));

        let reader = {
            let ledger = fx.ledger.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                let _ = ledger.peers();
                done.send("peer read").unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        for _ in 0..3 {
            done_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("session and directory locks taken in conflicting order");
        }
        writer.join().unwrap();
        logout.join().unwrap();
        reader.join().unwrap();
        assert!(fx.ledger.peers().is_empty());
    }

    #[tokio::test]
    async fn peers_are_scoped_to_the_session() {
        let fx = logged_in().await;
        fx.ledger.fetch_peers().await.unwrap();
        assert!(!fx.ledger.peers().is_empty());

        fx.session.logout();
        assert!(fx.ledger.peers().is_empty());
        assert!(fx.ledger.fetch_peers().await.unwrap_err().is_auth());
    }
}
