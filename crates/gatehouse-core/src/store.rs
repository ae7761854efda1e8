//! PostgreSQL storage backend
//!
//! Implements every storage trait on one pool. Table names carry the
//! configured prefix, which is validated before it reaches any SQL.
//!
//! Author: hephaex@gmail.com

use crate::clock::{Clock, SystemClock};
use crate::config::{validate_table_prefix, DatabaseConfig};
use crate::{
    AttemptState, AuthError, BlacklistEntry, BlacklistStore, InvitationRepository, IssuedToken,
    Invitation, NewIssuedToken, NewUser, RateLimitKey, RateLimitStore, Result, RevocationReason,
    Role, TokenStore, User, UserId, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;

/// Physical table names for a given prefix
#[derive(Debug, Clone)]
pub struct TableNames {
    pub users: String,
    pub issued_tokens: String,
    pub token_blacklist: String,
    pub invitations: String,
    pub rate_limits: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Result<Self> {
        validate_table_prefix(prefix)?;
        Ok(Self {
            users: format!("{prefix}users"),
            issued_tokens: format!("{prefix}issued_tokens"),
            token_blacklist: format!("{prefix}token_blacklist"),
            invitations: format!("{prefix}invitations"),
            rate_limits: format!("{prefix}rate_limits"),
        })
    }
}

/// Storage backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tables: TableNames,
    clock: Arc<dyn Clock>,
}

impl PgStore {
    pub fn new(pool: PgPool, prefix: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            pool,
            tables: TableNames::new(prefix)?,
            clock,
        })
    }

    /// Open a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.postgres_pool_size)
            .connect(&config.postgres_url)
            .await?;
        tracing::info!(
            pool_size = config.postgres_pool_size,
            prefix = %config.table_prefix,
            "Connected to PostgreSQL"
        );
        Self::new(pool, &config.table_prefix, Arc::new(SystemClock))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    password_hash: String,
    role: String,
    verified: bool,
    token_version: i64,
    customer_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = AuthError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: Some(row.id),
            email: row.email,
            password_hash: row.password_hash,
            role: row.role.parse::<Role>()?,
            verified: row.verified,
            token_version: row.token_version,
            customer_id: row.customer_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IssuedTokenRow {
    user_id: i64,
    token_hash: String,
    token_jti: Option<String>,
    refresh_token_hash: Option<String>,
    refresh_jti: Option<String>,
    expires_at: DateTime<Utc>,
    refresh_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    revoked: bool,
    revoked_at: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<IssuedTokenRow> for IssuedToken {
    fn from(row: IssuedTokenRow) -> Self {
        IssuedToken {
            user_id: row.user_id,
            token_hash: row.token_hash,
            token_jti: row.token_jti,
            refresh_token_hash: row.refresh_token_hash,
            refresh_jti: row.refresh_jti,
            expires_at: row.expires_at,
            refresh_expires_at: row.refresh_expires_at,
            created_at: row.created_at,
            revoked: row.revoked,
            revoked_at: row.revoked_at,
            revoked_reason: row.revoked_reason,
            last_used_at: row.last_used_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    token: String,
    email: String,
    customer_id: i64,
    used_at: Option<DateTime<Utc>>,
    used_by_user_id: Option<i64>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<InvitationRow> for Invitation {
    fn from(row: InvitationRow) -> Self {
        Invitation {
            token: row.token,
            email: row.email,
            customer_id: row.customer_id,
            used_at: row.used_at,
            used_by_user_id: row.used_by_user_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    attempts: i32,
    window_started_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

impl From<AttemptRow> for AttemptState {
    fn from(row: AttemptRow) -> Self {
        AttemptState {
            attempts: row.attempts.max(0) as u32,
            window_started_at: row.window_started_at,
            locked_until: row.locked_until,
        }
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, role, verified, token_version, customer_id, created_at";

const TOKEN_COLUMNS: &str = "user_id, token_hash, token_jti, refresh_token_hash, refresh_jti, \
     expires_at, refresh_expires_at, created_at, revoked, revoked_at, revoked_reason, last_used_at";

const INVITATION_COLUMNS: &str =
    "token, email, customer_id, used_at, used_by_user_id, created_at, expires_at";

// ============================================================================
// Users
// ============================================================================

#[async_trait]
impl UserRepository for PgStore {
    async fn get_by_id(&self, id: UserId) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE id = $1",
            self.tables.users
        );
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE lower(email) = lower($1)",
            self.tables.users
        );
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn get_token_version(&self, id: UserId) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT token_version FROM {} WHERE id = $1",
            self.tables.users
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn bump_token_version(&self, id: UserId) -> Result<i64> {
        let sql = format!(
            "UPDATE {} SET token_version = token_version + 1 WHERE id = $1 RETURNING token_version",
            self.tables.users
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UnknownSubject)
    }

    async fn create(&self, user: NewUser) -> Result<User> {
        let sql = format!(
            "INSERT INTO {} (email, password_hash, role, verified, token_version, customer_id, created_at) \
             VALUES ($1, $2, $3, $4, 0, $5, $6) \
             ON CONFLICT (email) DO NOTHING \
             RETURNING {USER_COLUMNS}",
            self.tables.users
        );
        sqlx::query_as::<_, UserRow>(&sql)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .bind(user.verified)
            .bind(user.customer_id)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AuthError::Validation("email already registered".to_string()))
            .and_then(User::try_from)
    }
}

// ============================================================================
// Issued tokens
// ============================================================================

#[async_trait]
impl TokenStore for PgStore {
    async fn upsert(&self, record: NewIssuedToken) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, token_hash, token_jti, refresh_token_hash, refresh_jti, \
                             expires_at, refresh_expires_at, created_at, revoked, last_used_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $8) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 token_hash = EXCLUDED.token_hash, \
                 token_jti = EXCLUDED.token_jti, \
                 refresh_token_hash = EXCLUDED.refresh_token_hash, \
                 refresh_jti = EXCLUDED.refresh_jti, \
                 expires_at = EXCLUDED.expires_at, \
                 refresh_expires_at = EXCLUDED.refresh_expires_at, \
                 created_at = EXCLUDED.created_at, \
                 revoked = FALSE, \
                 revoked_at = NULL, \
                 revoked_reason = NULL, \
                 last_used_at = EXCLUDED.last_used_at",
            self.tables.issued_tokens
        );
        sqlx::query(&sql)
            .bind(record.user_id)
            .bind(&record.token_hash)
            .bind(&record.token_jti)
            .bind(&record.refresh_token_hash)
            .bind(&record.refresh_jti)
            .bind(record.expires_at)
            .bind(record.refresh_expires_at)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_used(&self, token_hash: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_used_at = $2 \
             WHERE token_hash = $1 OR refresh_token_hash = $1",
            self.tables.issued_tokens
        );
        sqlx::query(&sql)
            .bind(token_hash)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke(&self, token_hash: &str, reason: RevocationReason) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET revoked = TRUE, revoked_at = $2, revoked_reason = $3 \
             WHERE (token_hash = $1 OR refresh_token_hash = $1) AND revoked = FALSE",
            self.tables.issued_tokens
        );
        sqlx::query(&sql)
            .bind(token_hash)
            .bind(self.clock.now())
            .bind(reason.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revoke_all(&self, user_id: UserId, reason: RevocationReason) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET revoked = TRUE, revoked_at = $2, revoked_reason = $3 \
             WHERE user_id = $1 AND revoked = FALSE",
            self.tables.issued_tokens
        );
        let result = sqlx::query(&sql)
            .bind(user_id)
            .bind(self.clock.now())
            .bind(reason.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn is_active(&self, token_hash: &str, allow_expired: bool) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS ( \
                 SELECT 1 FROM {} WHERE revoked = FALSE AND ( \
                     (token_hash = $1 AND ($2 OR expires_at > $3)) \
                     OR (refresh_token_hash = $1 AND ($2 OR refresh_expires_at > $3)) \
                 ) \
             )",
            self.tables.issued_tokens
        );
        Ok(sqlx::query_scalar::<_, bool>(&sql)
            .bind(token_hash)
            .bind(allow_expired)
            .bind(self.clock.now())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<IssuedToken>> {
        let sql = format!(
            "SELECT {TOKEN_COLUMNS} FROM {} WHERE user_id = $1 AND revoked = FALSE",
            self.tables.issued_tokens
        );
        let rows = sqlx::query_as::<_, IssuedTokenRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(IssuedToken::from).collect())
    }
}

// ============================================================================
// Blacklist
// ============================================================================

#[async_trait]
impl BlacklistStore for PgStore {
    async fn insert(&self, entry: &BlacklistEntry) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} (token_id, user_id, original_exp, blacklisted_at, reason) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (token_id) DO NOTHING",
            self.tables.token_blacklist
        );
        let result = sqlx::query(&sql)
            .bind(&entry.token_id)
            .bind(entry.user_id)
            .bind(entry.original_exp)
            .bind(entry.blacklisted_at)
            .bind(entry.reason.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn contains(&self, token_id: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE token_id = $1)",
            self.tables.token_blacklist
        );
        Ok(sqlx::query_scalar::<_, bool>(&sql)
            .bind(token_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE original_exp < $1",
            self.tables.token_blacklist
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Invitations
// ============================================================================

#[async_trait]
impl InvitationRepository for PgStore {
    async fn insert(&self, invitation: &Invitation) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} ({INVITATION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (token) DO NOTHING",
            self.tables.invitations
        );
        let result = sqlx::query(&sql)
            .bind(&invitation.token)
            .bind(&invitation.email)
            .bind(invitation.customer_id)
            .bind(invitation.used_at)
            .bind(invitation.used_by_user_id)
            .bind(invitation.created_at)
            .bind(invitation.expires_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        let sql = format!(
            "SELECT {INVITATION_COLUMNS} FROM {} WHERE token = $1",
            self.tables.invitations
        );
        Ok(sqlx::query_as::<_, InvitationRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(Invitation::from))
    }

    async fn mark_used_if_unused(
        &self,
        token: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET used_at = $3, used_by_user_id = $2 \
             WHERE token = $1 AND used_at IS NULL AND expires_at >= $3",
            self.tables.invitations
        );
        let result = sqlx::query(&sql)
            .bind(token)
            .bind(user_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Rate limits
// ============================================================================

#[async_trait]
impl RateLimitStore for PgStore {
    async fn try_acquire(
        &self,
        key: &RateLimitKey,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AttemptState> {
        // SET expressions all read the pre-update row
        let sql = format!(
            "INSERT INTO {} AS rl (ip, action, attempts, window_started_at, locked_until) \
             VALUES ($1, $2, 1, $3, CASE WHEN 1 > $5 THEN $6 END) \
             ON CONFLICT (ip, action) DO UPDATE SET \
                 attempts = CASE \
                     WHEN rl.locked_until > $3 THEN rl.attempts \
                     WHEN rl.window_started_at <= $4 OR rl.locked_until IS NOT NULL THEN 1 \
                     ELSE rl.attempts + 1 END, \
                 window_started_at = CASE \
                     WHEN rl.locked_until > $3 THEN rl.window_started_at \
                     WHEN rl.window_started_at <= $4 OR rl.locked_until IS NOT NULL THEN $3 \
                     ELSE rl.window_started_at END, \
                 locked_until = CASE \
                     WHEN rl.locked_until > $3 THEN rl.locked_until \
                     WHEN rl.window_started_at <= $4 OR rl.locked_until IS NOT NULL \
                         THEN CASE WHEN 1 > $5 THEN $6 END \
                     WHEN rl.attempts + 1 > $5 THEN $6 \
                     ELSE NULL END \
             RETURNING attempts, window_started_at, locked_until",
            self.tables.rate_limits
        );
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let row = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(&key.ip)
            .bind(key.action.as_str())
            .bind(now)
            .bind(window_start)
            .bind(max_attempts)
            .bind(lock_until)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn release(&self, key: &RateLimitKey) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET attempts = GREATEST(attempts - 1, 0) \
             WHERE ip = $1 AND action = $2 AND locked_until IS NULL",
            self.tables.rate_limits
        );
        sqlx::query(&sql)
            .bind(&key.ip)
            .bind(key.action.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE ip = $1 AND action = $2",
            self.tables.rate_limits
        );
        sqlx::query(&sql)
            .bind(&key.ip)
            .bind(key.action.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_carry_prefix() {
        let tables = TableNames::new("wp_").unwrap();
        assert_eq!(tables.users, "wp_users");
        assert_eq!(tables.issued_tokens, "wp_issued_tokens");
        assert_eq!(tables.rate_limits, "wp_rate_limits");
    }

    #[test]
    fn test_unsafe_prefix_is_rejected() {
        assert!(matches!(
            TableNames::new("x\"; DROP TABLE users; --"),
            Err(AuthError::Config(_))
        ));
    }
}
