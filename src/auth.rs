//! Session and PIN gate.
//!
//! Everything in front of the engine that deals with credentials: opening
//! accounts, logging in, resolving bearer tokens and checking PINs. PINs are
//! stored as argon2 hashes and never compared in plain text.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::Argon2;
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::Amount;
use crate::model::{Account, AccountNumber};
use crate::store::{AccountStore, StoreError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or PIN")]
    InvalidCredentials,

    #[error("no session")]
    Unauthenticated,

    #[error("session expired")]
    SessionExpired,

    #[error("session does not own account {0}")]
    Forbidden(AccountNumber),

    #[error("invalid PIN")]
    InvalidPin,

    #[error("{0} is already registered")]
    DuplicateAccount(String),

    #[error("invalid signup: {0}")]
    InvalidSignup(&'static str),

    #[error("failed to hash PIN: {0}")]
    Hashing(String),

    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists(what) => AuthError::DuplicateAccount(what),
            other => AuthError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Idle-independent lifetime of a login session.
    pub session_ttl_secs: u64,
    /// Opening balance of every new account, in minor units.
    pub initial_balance: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 30 * 60,
            initial_balance: 50_000,
        }
    }
}

/// Opaque bearer token handed out at login.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// tokens are credentials; keep them out of logs
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub pin: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signup {
    pub name: String,
    pub branch: String,
    pub account_number: AccountNumber,
    pub mobile_number: String,
    pub pin: String,
}

#[derive(Debug, Clone)]
struct Session {
    account_number: AccountNumber,
    expires_at: Instant,
}

#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Open a new account with the configured initial balance.
    async fn signup(&self, form: Signup) -> Result<Account, AuthError>;

    /// Check a username/PIN pair and open a session.
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, AuthError>;

    /// Account number bound to a live session.
    async fn session(&self, token: &SessionToken) -> Result<AccountNumber, AuthError>;

    /// Confirm the session owns `claimed` and `pin` is that account's PIN.
    async fn authorize(
        &self,
        token: &SessionToken,
        claimed: &str,
        pin: &str,
    ) -> Result<Account, AuthError>;

    /// Re-check the PIN of the session's own account.
    async fn verify_pin(&self, token: &SessionToken, pin: &str) -> Result<Account, AuthError> {
        let account_number = self.session(token).await?;
        self.authorize(token, &account_number, pin).await
    }
}

/// In-process sessions over an [`AccountStore`].
pub struct SessionGate {
    store: Arc<dyn AccountStore>,
    sessions: DashMap<SessionToken, Session>,
    config: AuthConfig,
}

/// Public API
impl SessionGate {
    pub fn new(store: Arc<dyn AccountStore>, config: AuthConfig) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            config,
        }
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        before - self.sessions.len()
    }
}

/// Private API
impl SessionGate {
    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.session_ttl_secs)
    }

    fn hash_pin(pin: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(pin.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Hashing(e.to_string()))
    }

    fn pin_matches(account: &Account, pin: &str) -> bool {
        PasswordHash::new(&account.pin_hash)
            .map(|hash| Argon2::default().verify_password(pin.as_bytes(), &hash).is_ok())
            .unwrap_or(false)
    }

    fn validate(form: &Signup) -> Result<(), AuthError> {
        if form.name.trim().is_empty() {
            return Err(AuthError::InvalidSignup("name is required"));
        }
        if form.account_number.trim().is_empty() {
            return Err(AuthError::InvalidSignup("account number is required"));
        }
        if form.mobile_number.trim().is_empty() {
            return Err(AuthError::InvalidSignup("mobile number is required"));
        }
        if form.pin.is_empty() || !form.pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::InvalidSignup("PIN must be digits"));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthGate for SessionGate {
    async fn signup(&self, form: Signup) -> Result<Account, AuthError> {
        Self::validate(&form)?;

        let account = Account {
            account_number: form.account_number.trim().to_string(),
            owner_name: form.name.trim().to_string(),
            branch: form.branch,
            mobile_number: form.mobile_number.trim().to_string(),
            pin_hash: Self::hash_pin(&form.pin)?,
            balance: Amount::new(self.config.initial_balance),
        };
        self.store.insert(account.clone()).await?;

        info!(
            account = %account.account_number,
            branch = %account.branch,
            balance = %account.balance,
            "account opened"
        );
        Ok(account)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, AuthError> {
        let candidates = self.store.find_by_owner(credentials.username.trim()).await?;
        let account = candidates
            .into_iter()
            .find(|account| Self::pin_matches(account, &credentials.pin))
            .ok_or(AuthError::InvalidCredentials)?;

        let token = SessionToken::generate();
        self.sessions.insert(
            token.clone(),
            Session {
                account_number: account.account_number.clone(),
                expires_at: Instant::now() + self.ttl(),
            },
        );
        info!(account = %account.account_number, "session opened");
        Ok(token)
    }

    async fn session(&self, token: &SessionToken) -> Result<AccountNumber, AuthError> {
        let session = self
            .sessions
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(AuthError::Unauthenticated)?;

        if session.expires_at <= Instant::now() {
            self.sessions.remove(token);
            debug!(account = %session.account_number, "session expired");
            return Err(AuthError::SessionExpired);
        }
        Ok(session.account_number)
    }

    async fn authorize(
        &self,
        token: &SessionToken,
        claimed: &str,
        pin: &str,
    ) -> Result<Account, AuthError> {
        let owner = self.session(token).await?;
        if owner != claimed {
            return Err(AuthError::Forbidden(claimed.to_string()));
        }

        let account = self.store.get(&owner).await.map_err(|e| match e {
            // account vanished under a live session
            StoreError::NotFound(_) => AuthError::Unauthenticated,
            other => AuthError::Storage(other),
        })?;
        if !Self::pin_matches(&account, pin) {
            return Err(AuthError::InvalidPin);
        }
        Ok(account)
    }
}
