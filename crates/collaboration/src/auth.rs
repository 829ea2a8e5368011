/// Signed-in identity tracking, credential checks and the account authenticator
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{CollaborationError, Result, UserId};

/// Trim and lowercase an email so it can be compared and used as a key
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// The signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: UserId,
    pub email: String,
}

impl Identity {
    pub fn new(uid: UserId, email: &str) -> Self {
        Self {
            uid,
            email: normalize_email(email),
        }
    }
}

/// Email and password as typed by the user
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Check the shape of the credentials before they reach the backend
    pub fn validate(&self, min_password_len: usize) -> Result<()> {
        let email = normalize_email(&self.email);
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => {
                return Err(CollaborationError::AuthFailed(format!(
                    "invalid email address {:?}",
                    self.email.trim()
                )))
            }
        }

        if self.password.chars().count() < min_password_len {
            return Err(CollaborationError::AuthFailed(format!(
                "password should be at least {min_password_len} characters"
            )));
        }
        Ok(())
    }
}

/// Opaque session token handed out on sign-in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken(pub String);

impl AuthToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Result of a successful sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedIn {
    pub identity: Identity,
    pub token: AuthToken,
}

/// Client-side view of who is signed in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// Auth has not been checked yet
    #[default]
    Unknown,
    SignedOut,
    SignedIn(Identity),
}

impl AuthState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::SignedIn(identity) => Some(identity),
            _ => None,
        }
    }
}

/// What a protected surface should do for the current auth state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow(Identity),
    /// Still waiting for the auth check; do not redirect yet
    Pending,
    RedirectToLogin,
}

/// Holds the signed-in identity and notifies observers when it changes
#[derive(Debug, Clone)]
pub struct AuthSession {
    state: Arc<watch::Sender<AuthState>>,
}

impl AuthSession {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AuthState::Unknown);
        Self { state: Arc::new(tx) }
    }

    pub fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity().cloned()
    }

    /// Receiver that yields every auth state change
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn require_user(&self) -> Result<Identity> {
        self.identity().ok_or(CollaborationError::Unauthenticated)
    }

    pub fn gate(&self) -> GateDecision {
        match self.current() {
            AuthState::SignedIn(identity) => GateDecision::Allow(identity),
            AuthState::Unknown => GateDecision::Pending,
            AuthState::SignedOut => GateDecision::RedirectToLogin,
        }
    }

    pub fn set_signed_in(&self, identity: Identity) {
        debug!("auth state: signed in as {}", identity.email);
        self.state.send_replace(AuthState::SignedIn(identity));
    }

    pub fn set_signed_out(&self) {
        debug!("auth state: signed out");
        self.state.send_replace(AuthState::SignedOut);
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign-up / sign-in surface shared by the local and remote clients
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Create an account and sign it in
    async fn sign_up(&self, credentials: Credentials) -> Result<SignedIn>;

    async fn sign_in(&self, credentials: Credentials) -> Result<SignedIn>;

    /// Restore a previous session from its token
    async fn resume(&self, token: AuthToken) -> Result<Identity>;

    async fn sign_out(&self) -> Result<()>;
}

/// A stored account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: UserId,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Persistence for accounts
pub trait AccountStore: Send + Sync {
    /// Insert a new account; fails if the email is taken
    fn insert_account(&self, account: Account) -> Result<()>;

    fn find_account(&self, email: &str) -> Result<Option<Account>>;
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Server-side account and session token authority
pub struct Authenticator {
    accounts: Arc<dyn AccountStore>,
    sessions: RwLock<HashMap<AuthToken, Identity>>,
    min_password_len: usize,
}

impl Authenticator {
    pub fn new(accounts: Arc<dyn AccountStore>, min_password_len: usize) -> Self {
        Self {
            accounts,
            sessions: RwLock::new(HashMap::new()),
            min_password_len,
        }
    }

    pub fn sign_up(&self, credentials: &Credentials) -> Result<SignedIn> {
        credentials.validate(self.min_password_len)?;
        let email = normalize_email(&credentials.email);

        if self.accounts.find_account(&email)?.is_some() {
            return Err(CollaborationError::AuthFailed(format!(
                "an account already exists for {email}"
            )));
        }

        let salt = uuid::Uuid::new_v4().simple().to_string();
        let account = Account {
            uid: UserId::new(),
            email: email.clone(),
            password_hash: hash_password(&salt, &credentials.password),
            salt,
            created_at: chrono::Utc::now(),
        };
        let identity = Identity::new(account.uid, &account.email);
        self.accounts.insert_account(account)?;

        info!("Created account for {}", email);
        Ok(self.open_session(identity))
    }

    pub fn sign_in(&self, credentials: &Credentials) -> Result<SignedIn> {
        let email = normalize_email(&credentials.email);
        let invalid = || CollaborationError::AuthFailed("invalid email or password".to_string());

        let account = self.accounts.find_account(&email)?.ok_or_else(invalid)?;
        if hash_password(&account.salt, &credentials.password) != account.password_hash {
            warn!("Rejected sign-in for {}", email);
            return Err(invalid());
        }

        info!("User {} signed in", email);
        Ok(self.open_session(Identity::new(account.uid, &account.email)))
    }

    pub fn resume(&self, token: &AuthToken) -> Result<Identity> {
        self.sessions
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| CollaborationError::AuthFailed("session expired".to_string()))
    }

    pub fn sign_out(&self, token: &AuthToken) {
        if let Some(identity) = self.sessions.write().remove(token) {
            info!("User {} signed out", identity.email);
        }
    }

    fn open_session(&self, identity: Identity) -> SignedIn {
        let token = AuthToken::generate();
        self.sessions.write().insert(token.clone(), identity.clone());
        SignedIn { identity, token }
    }
}
