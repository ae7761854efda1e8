//! Gatehouse Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout Gatehouse:
//! - Credential domain models (users, issued tokens, blacklist entries, invitations)
//! - The authentication error taxonomy
//! - Collaborator traits for every storage concern
//! - Configuration management
//! - Storage backends (PostgreSQL and in-process)

pub mod clock;
pub mod config;
pub mod memory;
pub mod password;
pub mod schema;
pub mod secrets;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, AuthConfig, ConfigError, DatabaseConfig, InvitationConfig, LoggingConfig,
    RateLimitConfig, ServerConfig, MAX_INVITATION_TTL_DAYS, MAX_RATE_LIMIT_SECS,
};
pub use memory::InMemoryStore;
pub use secrets::{SecretProvider, StaticSecrets};
pub use store::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a user row in the relational store
pub type UserId = i64;

// ============================================================================
// Error Types
// ============================================================================

/// Who already consumed an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsedBy {
    /// The caller redeemed it earlier (idempotent retry)
    Caller,
    /// A different user redeemed it
    Other,
}

impl fmt::Display for UsedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsedBy::Caller => write!(f, "by caller"),
            UsedBy::Other => write!(f, "by another user"),
        }
    }
}

/// Error taxonomy for token lifecycle and invitation operations
///
/// Callers branch on the variant; none of these are retried automatically.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed token")]
    TokenMalformed,

    #[error("Invalid token signature")]
    TokenInvalidSignature,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token is missing required claims: {0}")]
    TokenMissingClaims(String),

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Token version is stale")]
    TokenVersionStale,

    #[error("Token type mismatch, expected {expected}")]
    TokenTypeMismatch { expected: TokenType },

    #[error("Token issuer or audience mismatch")]
    TokenAudienceMismatch,

    #[error("Token subject does not exist")]
    UnknownSubject,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Too many attempts, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invitation not found")]
    InvitationNotFound,

    #[error("Invitation already used {by}")]
    InvitationUsed { by: UsedBy },

    #[error("Invitation has expired")]
    InvitationExpired,

    #[error("Token issuance failed: {0}")]
    Issuance(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AuthError {
    /// True for every failure that means "this token cannot be trusted"
    pub fn is_token_failure(&self) -> bool {
        matches!(
            self,
            AuthError::TokenMalformed
                | AuthError::TokenInvalidSignature
                | AuthError::TokenExpired
                | AuthError::TokenMissingClaims(_)
                | AuthError::TokenRevoked
                | AuthError::TokenVersionStale
                | AuthError::TokenTypeMismatch { .. }
                | AuthError::TokenAudienceMismatch
                | AuthError::UnknownSubject
        )
    }

    /// Short machine-readable kind, used for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::TokenMalformed => "token_malformed",
            AuthError::TokenInvalidSignature => "token_invalid_signature",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenMissingClaims(_) => "token_missing_claims",
            AuthError::TokenRevoked => "token_revoked",
            AuthError::TokenVersionStale => "token_version_stale",
            AuthError::TokenTypeMismatch { .. } => "token_type_mismatch",
            AuthError::TokenAudienceMismatch => "token_audience_mismatch",
            AuthError::UnknownSubject => "unknown_subject",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::InvitationNotFound => "invitation_not_found",
            AuthError::InvitationUsed { .. } => "invitation_used",
            AuthError::InvitationExpired => "invitation_expired",
            AuthError::Issuance(_) => "issuance_error",
            AuthError::Store(_) => "store_error",
            AuthError::Config(_) => "config_error",
            AuthError::Validation(_) => "validation_error",
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Store(err.to_string())
    }
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

// ============================================================================
// Users
// ============================================================================

/// Role carried in token claims
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "admin" | "administrator" => Ok(Role::Admin),
            "client" => Ok(Role::Client),
            other => Err(AuthError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// User account as seen by the token subsystem
///
/// The user repository owns this entity. Token issuance only reads it and
/// only ever writes `token_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Row id; `None` until the repository has persisted the user
    pub id: Option<UserId>,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub verified: bool,
    /// Monotonic counter; bumping it invalidates every token issued before
    pub token_version: i64,
    /// Customer record this account belongs to, when it came from an invitation
    pub customer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Data needed to create a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub verified: bool,
    pub customer_id: Option<i64>,
}

// ============================================================================
// Tokens
// ============================================================================

/// Token kind discriminator (`type` claim)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a token was invalidated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    TokenRotation,
    Security,
    PasswordChange,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::TokenRotation => "token_rotation",
            RevocationReason::Security => "security",
            RevocationReason::PasswordChange => "password_change",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "logout" => Ok(RevocationReason::Logout),
            "token_rotation" => Ok(RevocationReason::TokenRotation),
            "security" => Ok(RevocationReason::Security),
            "password_change" => Ok(RevocationReason::PasswordChange),
            other => Err(AuthError::Validation(format!(
                "unknown revocation reason: {other}"
            ))),
        }
    }
}

/// Persisted metadata for the token pair most recently issued to a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssuedToken {
    pub user_id: UserId,
    /// SHA-256 of the access token
    pub token_hash: String,
    pub token_jti: Option<String>,
    pub refresh_token_hash: Option<String>,
    pub refresh_jti: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Arguments to [`TokenStore::upsert`]
#[derive(Debug, Clone)]
pub struct NewIssuedToken {
    pub user_id: UserId,
    pub token_hash: String,
    pub token_jti: String,
    pub refresh_token_hash: Option<String>,
    pub refresh_jti: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Explicit revocation ledger entry keyed by `jti`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlacklistEntry {
    pub token_id: String,
    pub user_id: UserId,
    /// Expiry of the token being blacklisted, drives retention
    pub original_exp: DateTime<Utc>,
    pub blacklisted_at: DateTime<Utc>,
    pub reason: RevocationReason,
}

// ============================================================================
// Invitations
// ============================================================================

/// Single-use registration invitation
///
/// Whether it has been used is derived from `used_at` alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invitation {
    pub token: String,
    pub email: String,
    pub customer_id: i64,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by_user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Derived invitation state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvitationState {
    Pending,
    Used,
    Expired,
}

impl Invitation {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Expiry wins over use: an invitation past its deadline is expired
    pub fn state_at(&self, now: DateTime<Utc>) -> InvitationState {
        if self.is_expired_at(now) {
            InvitationState::Expired
        } else if self.is_used() {
            InvitationState::Used
        } else {
            InvitationState::Pending
        }
    }
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Action a rate-limit counter is kept for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Login,
    Refresh,
    Register,
    InvitationCheck,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::Refresh => "refresh",
            RateLimitAction::Register => "register",
            RateLimitAction::InvitationCheck => "invitation_check",
        }
    }
}

/// Counter key: one per (ip, action)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub ip: String,
    pub action: RateLimitAction,
}

impl RateLimitKey {
    pub fn new(ip: impl Into<String>, action: RateLimitAction) -> Self {
        Self {
            ip: ip.into(),
            action,
        }
    }
}

/// Current counter state for a key
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptState {
    pub attempts: u32,
    pub window_started_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// User storage consulted by the token subsystem
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: UserId) -> Result<Option<User>>;

    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn get_token_version(&self, id: UserId) -> Result<Option<i64>>;

    /// Increment the user's token version and return the new value.
    ///
    /// Fails with [`AuthError::UnknownSubject`] if the user does not exist.
    async fn bump_token_version(&self, id: UserId) -> Result<i64>;

    async fn create(&self, user: NewUser) -> Result<User>;

    fn verify_password(&self, plain: &str, hash: &str) -> bool {
        match password::verify_password(plain, hash) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(error = %e, "stored password hash could not be verified");
                false
            }
        }
    }
}

/// Persistence for issued-token metadata, one row per user
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert or replace the row for `record.user_id`; clears revocation
    async fn upsert(&self, record: NewIssuedToken) -> Result<()>;

    /// Stamp `last_used_at` on the row holding this access or refresh hash
    async fn mark_used(&self, token_hash: &str) -> Result<()>;

    /// Revoke the row holding this hash. Already revoked is a no-op.
    async fn revoke(&self, token_hash: &str, reason: RevocationReason) -> Result<()>;

    /// Revoke every non-revoked row of the user, returning the count
    async fn revoke_all(&self, user_id: UserId, reason: RevocationReason) -> Result<u64>;

    /// True only for an existing, non-revoked row whose matching expiry is
    /// in the future (or any expiry when `allow_expired` is set)
    async fn is_active(&self, token_hash: &str, allow_expired: bool) -> Result<bool>;

    /// Non-revoked rows of the user
    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<IssuedToken>>;
}

/// Storage behind the blacklist
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// Insert if absent. Returns `true` when this call created the entry.
    async fn insert(&self, entry: &BlacklistEntry) -> Result<bool>;

    async fn contains(&self, token_id: &str) -> Result<bool>;

    /// Delete entries whose `original_exp` is before `cutoff`
    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Invitation storage including the compare-and-set redemption primitive
#[async_trait]
pub trait InvitationRepository: Send + Sync {
    /// Insert a new invitation. Returns `false` if the token already exists.
    async fn insert(&self, invitation: &Invitation) -> Result<bool>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>>;

    /// Conditional update: claim the invitation for `user_id` only if it is
    /// still unused and not expired at `now`. Returns affected rows (0 or 1).
    async fn mark_used_if_unused(
        &self,
        token: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Attempt counters for rate limiting
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Reserve one attempt in a single atomic step.
    ///
    /// A key locked past `now` is returned unchanged. A window that started
    /// at or before `window_start`, or an expired lock, restarts the count at
    /// 1 from `now`. Otherwise the count is incremented, and once it exceeds
    /// `max_attempts` the key is locked until `lock_until`.
    ///
    /// # Returns
    ///
    /// The counter after this reservation. Concurrent callers each observe a
    /// distinct count.
    async fn try_acquire(
        &self,
        key: &RateLimitKey,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AttemptState>;

    /// Give back a reservation whose attempt should not count
    async fn release(&self, key: &RateLimitKey) -> Result<()>;

    async fn reset(&self, key: &RateLimitKey) -> Result<()>;
}
