use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;

use crate::api::types::{LoginRequest, RegisterRequest, RegistrationReceipt, User, UserId};
use crate::errors::{WalletError, WalletResult};
use crate::events::{CoordinatorEvent, EventBus};
use crate::gateway::RemoteGateway;
use crate::ledger::BalanceBook;
use crate::storage::TokenStore;
use crate::validation::InputValidator;

#[derive(Default)]
struct SessionState {
    credential: Option<SecretString>,
    user: Option<User>,
    epoch: u64,
}

/// Credential captured at the start of a call, with the session epoch it
/// belongs to.
pub(crate) struct Authorization {
    pub credential: SecretString,
    pub epoch: u64,
}

/// Owns the bearer credential and the authenticated user.
///
/// Every login, logout and credential install starts a new epoch. Results of
/// calls issued under an older epoch are discarded instead of applied.
#[derive(Clone)]
pub struct SessionStore {
    state: Arc<RwLock<SessionState>>,
    gateway: Arc<dyn RemoteGateway>,
    tokens: Arc<dyn TokenStore>,
    balance: BalanceBook,
    validator: Arc<InputValidator>,
    events: EventBus,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SessionStore")
            .field("active", &state.credential.is_some())
            .field("user", &state.user.as_ref().map(|user| &user.id))
            .field("epoch", &state.epoch)
            .finish()
    }
}

impl SessionStore {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        tokens: Arc<dyn TokenStore>,
        balance: BalanceBook,
        validator: Arc<InputValidator>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            gateway,
            tokens,
            balance,
            validator,
            events,
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> WalletResult<RegistrationReceipt> {
        self.validator.validate_name(&request.name)?;
        self.validator.validate_email(&request.email)?;
        self.validator.validate_phone(&request.phone)?;
        self.validator.validate_new_password(&request.password)?;

        let receipt = self.gateway.register(request).await?;
        log::info!("Registered new account");
        Ok(receipt)
    }

    /// Authenticate, persist the token and load the profile.
    pub async fn login(&self, email: &str, password: SecretString) -> WalletResult<User> {
        let email = email.trim();
        self.validator.validate_email(email)?;
        self.validator.validate_password_entry(&password)?;

        let request = LoginRequest {
            email: email.to_string(),
            password,
        };
        let token = self.gateway.login(&request).await?;
        drop(request);

        if let Err(e) = self.tokens.save(&token) {
            log::warn!("Session token could not be persisted: {}", e);
        }

        match self.fetch_profile(Some(&token)).await {
            Ok(user) => {
                log::info!("Logged in as user {}", user.id);
                Ok(user)
            }
            Err(WalletError::Cancelled) => Err(WalletError::Cancelled),
            Err(e) => {
                self.logout();
                Err(e)
            }
        }
    }

    /// Replace the user and seed the balance from the backend profile.
    ///
    /// With `Some(credential)` that credential is installed first and a new
    /// epoch begins. A rejected credential ends the session.
    pub async fn fetch_profile(&self, credential: Option<&SecretString>) -> WalletResult<User> {
        let auth = match credential {
            Some(credential) => self.install(credential),
            None => self.authorize()?,
        };

        let profile = match self.gateway.profile(&auth.credential).await {
            Ok(profile) => profile,
            Err(e) if e.is_auth() => {
                if self.is_current(auth.epoch) {
                    log::warn!("Profile request rejected, ending session");
                    self.logout();
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut state = self.state.write();
        if state.epoch != auth.epoch {
            log::debug!("Discarding profile for a superseded session");
            return Err(WalletError::Cancelled);
        }
        let started = state.user.is_none();
        state.user = Some(profile.user.clone());
        self.balance.set_authoritative(profile.wallet_balance);
        if started {
            self.events.emit(CoordinatorEvent::SessionStarted {
                user_id: profile.user.id.clone(),
            });
        }
        Ok(profile.user)
    }

    /// Restore a persisted session. Returns whether a session is now active.
    pub async fn resume(&self) -> WalletResult<bool> {
        let token = match self.tokens.load() {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(false),
            Err(e) => {
                log::warn!("Persisted session token unreadable: {}", e);
                return Ok(false);
            }
        };

        match self.fetch_profile(Some(&token)).await {
            Ok(user) => {
                log::info!("Resumed session for user {}", user.id);
                Ok(true)
            }
            Err(e) if e.is_auth() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clear credential, user, balance and the persisted token. Never fails.
    pub fn logout(&self) {
        let was_active = {
            let mut state = self.state.write();
            let was_active = state.credential.is_some();
            state.credential = None;
            state.user = None;
            state.epoch += 1;
            self.balance.clear();
            was_active
        };

        if let Err(e) = self.tokens.clear() {
            log::warn!("Persisted session token could not be removed: {}", e);
        }
        if was_active {
            log::info!("Session ended");
            self.events.emit(CoordinatorEvent::SessionEnded);
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.read().credential.is_some()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.read().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.read().user.as_ref().map(|user| user.id.clone())
    }

    pub fn credential(&self) -> Option<SecretString> {
        self.state
            .read()
            .credential
            .as_ref()
            .map(|credential| SecretString::from(credential.expose_secret().to_string()))
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub(crate) fn authorize(&self) -> WalletResult<Authorization> {
        let state = self.state.read();
        let credential = state
            .credential
            .as_ref()
            .ok_or_else(|| WalletError::AuthError("Not logged in".to_string()))?;
        Ok(Authorization {
            credential: SecretString::from(credential.expose_secret().to_string()),
            epoch: state.epoch,
        })
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.state.read().epoch == epoch
    }

    /// Run `apply` only if `epoch` is still the live session; logout waits
    /// for it to finish.
    pub(crate) fn if_current<R>(&self, epoch: u64, apply: impl FnOnce() -> R) -> WalletResult<R> {
        let state = self.state.read();
        if state.epoch != epoch {
            return Err(WalletError::Cancelled);
        }
        Ok(apply())
    }

    /// End the session when a call made under `epoch` was rejected for
    /// authentication.
    pub(crate) fn enforce<T>(&self, epoch: u64, result: WalletResult<T>) -> WalletResult<T> {
        if let Err(e) = &result {
            if e.is_auth() && self.is_current(epoch) {
                log::warn!("Credential rejected, ending session");
                self.logout();
            }
        }
        result
    }

    fn install(&self, credential: &SecretString) -> Authorization {
        let mut state = self.state.write();
        state.credential = Some(SecretString::from(credential.expose_secret().to_string()));
        state.user = None;
        state.epoch += 1;
        Authorization {
            credential: SecretString::from(credential.expose_secret().to_string()),
            epoch: state.epoch,
        }
    }
}
