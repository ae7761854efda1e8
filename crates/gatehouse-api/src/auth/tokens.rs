//! Token Service: issuance, validation, rotation and mass invalidation
//!
//! Per token: `issued -> active -> (expired | revoked | rotated-out)`; every
//! terminal state is one-way.
//!
//! Author: hephaex@gmail.com

use super::blacklist::Blacklist;
use super::jwt::{hash_token, ExpiryMode, TokenPayload, TokenSigner};
use crate::audit::{audit_log, AuditEvent};
use chrono::{DateTime, Utc};
use gatehouse_core::{
    AuthConfig, AuthError, NewIssuedToken, Result, RevocationReason, TokenStore, TokenType, User,
    UserId, UserRepository,
};
use std::sync::Arc;

/// Signed access/refresh pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_claims: TokenPayload,
}

/// What `invalidate_all` managed to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    pub user_id: UserId,
    pub new_token_version: i64,
    /// Blacklist entries created by the sweep
    pub blacklisted: u64,
    /// Token Store rows revoked
    pub revoked_rows: u64,
}

pub struct TokenService {
    signer: Arc<TokenSigner>,
    users: Arc<dyn UserRepository>,
    store: Arc<dyn TokenStore>,
    blacklist: Arc<Blacklist>,
    track_sessions: bool,
    invalidate_on_refresh_reuse: bool,
}

impl TokenService {
    pub fn new(
        config: &AuthConfig,
        signer: Arc<TokenSigner>,
        users: Arc<dyn UserRepository>,
        store: Arc<dyn TokenStore>,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        Self {
            signer,
            users,
            store,
            blacklist,
            track_sessions: config.track_sessions,
            invalidate_on_refresh_reuse: config.invalidate_on_refresh_reuse,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Sign a fresh pair for `user` and record it in the Token Store.
    ///
    /// A store failure is fatal: no token leaves this function unrecorded.
    ///
    /// # Arguments
    ///
    /// * `user` - Persisted account; its `token_version` is embedded in both tokens
    ///
    /// # Returns
    ///
    /// * `Ok(TokenPair)` - Signed tokens with their decoded claims
    /// * `Err(AuthError::Issuance)` - Missing user id or signing failure
    /// * `Err(AuthError::Store)` - The Token Store upsert failed
    pub async fn issue_pair(&self, user: &User) -> Result<TokenPair> {
        let user_id = user
            .id
            .ok_or_else(|| AuthError::Issuance("user has no id".to_string()))?;

        let access = self.signer.payload_for(user, TokenType::Access)?;
        let refresh = self.signer.payload_for(user, TokenType::Refresh)?;
        let access_token = self.signer.sign(&access)?;
        let refresh_token = self.signer.sign(&refresh)?;

        self.store
            .upsert(NewIssuedToken {
                user_id,
                token_hash: hash_token(&access_token),
                token_jti: access.jti.clone(),
                refresh_token_hash: Some(hash_token(&refresh_token)),
                refresh_jti: Some(refresh.jti.clone()),
                expires_at: access.expires_at(),
                refresh_expires_at: Some(refresh.expires_at()),
            })
            .await
            .map_err(|e| {
                tracing::error!(user_id, error = %e, "Failed to record issued tokens");
                e
            })?;

        tracing::debug!(user_id, access_jti = %access.jti, "Issued token pair");
        Ok(TokenPair {
            access_token,
            refresh_token,
            access_expires_at: access.expires_at(),
            refresh_expires_at: refresh.expires_at(),
            access_claims: access,
        })
    }

    async fn check_version(&self, payload: &TokenPayload) -> Result<UserId> {
        let user_id = payload.user_id()?;
        let current = self
            .users
            .get_token_version(user_id)
            .await?
            .ok_or(AuthError::UnknownSubject)?;
        if current != payload.token_version {
            return Err(AuthError::TokenVersionStale);
        }
        Ok(user_id)
    }

    /// Full check of an access token. Read-only.
    ///
    /// Order: signature and expiry, type, token version, blacklist, then the
    /// Token Store when sessions are tracked.
    ///
    /// # Arguments
    ///
    /// * `token` - Compact JWT from the `Authorization` header
    ///
    /// # Returns
    ///
    /// * `Ok(TokenPayload)` - Claims of a token that is still live
    /// * `Err(AuthError)` - The first failed check; `is_token_failure` holds
    ///   for everything except storage errors
    pub async fn validate_access(&self, token: &str) -> Result<TokenPayload> {
        let payload = self
            .signer
            .verify(token, TokenType::Access, ExpiryMode::Enforce)?;
        self.check_version(&payload).await?;

        if self.blacklist.contains(&payload.jti).await? {
            return Err(AuthError::TokenRevoked);
        }
        if self.track_sessions && !self.store.is_active(&hash_token(token), false).await? {
            return Err(AuthError::TokenRevoked);
        }
        Ok(payload)
    }

    /// Stamp `last_used_at` after a successful validation. Best effort.
    pub async fn record_use(&self, token: &str) {
        if let Err(e) = self.store.mark_used(&hash_token(token)).await {
            tracing::warn!(error = %e, "Failed to record token use");
        }
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// The old token is blacklisted before the new pair is minted. Only the
    /// caller whose blacklist insert creates the entry proceeds; any other
    /// presentation of the same token is reuse and fails with `TokenRevoked`.
    /// If issuance fails after the claim the caller must log in again.
    ///
    /// # Arguments
    ///
    /// * `refresh_token` - Compact JWT of type `refresh`
    ///
    /// # Returns
    ///
    /// * `Ok(TokenPair)` - The replacement pair
    /// * `Err(AuthError::TokenRevoked)` - The token was already rotated or revoked
    /// * `Err(AuthError::TokenVersionStale)` - Issued before the last invalidation
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair> {
        let payload = self
            .signer
            .verify(refresh_token, TokenType::Refresh, ExpiryMode::Enforce)?;
        let user_id = payload.user_id()?;
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or(AuthError::UnknownSubject)?;
        if user.token_version != payload.token_version {
            return Err(AuthError::TokenVersionStale);
        }

        let claimed = self
            .blacklist
            .add(
                &payload.jti,
                user_id,
                payload.expires_at(),
                RevocationReason::TokenRotation,
            )
            .await?;
        if !claimed {
            self.on_refresh_reuse(user_id, &payload.jti).await;
            return Err(AuthError::TokenRevoked);
        }

        if self.track_sessions && !self.store.is_active(&hash_token(refresh_token), false).await? {
            return Err(AuthError::TokenRevoked);
        }

        self.issue_pair(&user).await
    }

    async fn on_refresh_reuse(&self, user_id: UserId, jti: &str) {
        tracing::warn!(user_id, jti, "Rotated-out refresh token presented again");

        let mut sessions_invalidated = false;
        if self.invalidate_on_refresh_reuse {
            match self.invalidate_all(user_id, RevocationReason::Security).await {
                Ok(_) => sessions_invalidated = true,
                Err(e) => {
                    tracing::error!(user_id, error = %e, "Failed to invalidate sessions after refresh reuse")
                }
            }
        }

        audit_log(&AuditEvent::RefreshTokenReuse {
            user_id,
            jti: jti.to_string(),
            sessions_invalidated,
        });
    }

    /// Invalidate every token of the user.
    ///
    /// The version bump takes effect immediately and is the only fatal step.
    /// The blacklist sweep and Token Store revocation follow and only log on
    /// failure. Safe to re-run after a partial failure.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Account whose tokens are invalidated
    /// * `reason` - Recorded on every blacklist entry and revoked row
    ///
    /// # Returns
    ///
    /// * `Ok(InvalidationReport)` - New version and sweep counts
    /// * `Err(AuthError::UnknownSubject)` - No such user
    pub async fn invalidate_all(
        &self,
        user_id: UserId,
        reason: RevocationReason,
    ) -> Result<InvalidationReport> {
        let new_token_version = self.users.bump_token_version(user_id).await?;

        let blacklisted = match self.blacklist.add_all_active_for_user(user_id, reason).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Blacklist sweep failed; version bump still applies");
                0
            }
        };

        let revoked_rows = match self.store.revoke_all(user_id, reason).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to revoke Token Store rows");
                0
            }
        };

        audit_log(&AuditEvent::SessionsInvalidated {
            user_id,
            reason: reason.as_str().to_string(),
            new_token_version,
        });

        Ok(InvalidationReport {
            user_id,
            new_token_version,
            blacklisted,
            revoked_rows,
        })
    }

    /// End one session: the presented access token and, when given and
    /// owned by the same subject, its refresh token.
    pub async fn logout_session(
        &self,
        claims: &TokenPayload,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<()> {
        let user_id = claims.user_id()?;
        self.blacklist
            .add(&claims.jti, user_id, claims.expires_at(), RevocationReason::Logout)
            .await?;
        self.store
            .revoke(&hash_token(access_token), RevocationReason::Logout)
            .await?;

        let Some(refresh_token) = refresh_token else {
            return Ok(());
        };
        match self
            .signer
            .verify(refresh_token, TokenType::Refresh, ExpiryMode::AllowExpired)
        {
            Ok(refresh) if refresh.sub == claims.sub => {
                self.blacklist
                    .add(&refresh.jti, user_id, refresh.expires_at(), RevocationReason::Logout)
                    .await?;
                self.store
                    .revoke(&hash_token(refresh_token), RevocationReason::Logout)
                    .await?;
            }
            Ok(_) => {
                tracing::warn!(user_id, "Refresh token at logout belongs to another subject");
            }
            Err(e) => {
                tracing::debug!(user_id, error = %e, "Ignoring unusable refresh token at logout");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatehouse_core::{Clock, InMemoryStore, ManualClock, Role, StaticSecrets};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        service: TokenService,
        user: User,
    }

    async fn fixture(config: AuthConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let signer = Arc::new(TokenSigner::new(
            &config,
            Arc::new(StaticSecrets::new(Some("access"), Some("refresh"))),
            clock.clone(),
        ));
        let blacklist = Arc::new(Blacklist::new(store.clone(), store.clone(), clock.clone()));
        let service = TokenService::new(&config, signer, store.clone(), store.clone(), blacklist);
        let user = store
            .insert_user(User {
                id: Some(42),
                email: "client@example.com".to_string(),
                password_hash: String::new(),
                role: Role::Client,
                verified: true,
                token_version: 0,
                customer_id: Some(7),
                created_at: clock.now(),
            })
            .await;
        Fixture {
            clock,
            store,
            service,
            user,
        }
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();

        let claims = f.service.validate_access(&pair.access_token).await.unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.role, Role::Client);

        let row = f.store.token_row(42).await.unwrap();
        assert_eq!(row.token_hash, hash_token(&pair.access_token));
        assert_eq!(row.token_jti.as_deref(), Some(claims.jti.as_str()));
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_as_access() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();
        assert!(f.service.validate_access(&pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_replaces_session() {
        let f = fixture(AuthConfig::default()).await;
        let first = f.service.issue_pair(&f.user).await.unwrap();
        let second = f.service.rotate(&first.refresh_token).await.unwrap();

        // The old access token no longer matches the live row
        assert!(matches!(
            f.service.validate_access(&first.access_token).await,
            Err(AuthError::TokenRevoked)
        ));
        assert!(f.service.validate_access(&second.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_reuse_without_session_tracking() {
        let config = AuthConfig {
            track_sessions: false,
            ..Default::default()
        };
        let f = fixture(config).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();

        f.service.rotate(&pair.refresh_token).await.unwrap();
        assert!(matches!(
            f.service.rotate(&pair.refresh_token).await,
            Err(AuthError::TokenRevoked)
        ));
        // Default response leaves the version alone
        assert_eq!(f.store.get_token_version(42).await.unwrap(), Some(0));
        assert!(f.service.validate_access(&pair.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_reuse_can_invalidate_everything() {
        let config = AuthConfig {
            invalidate_on_refresh_reuse: true,
            ..Default::default()
        };
        let f = fixture(config).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();
        let rotated = f.service.rotate(&pair.refresh_token).await.unwrap();

        assert!(f.service.rotate(&pair.refresh_token).await.is_err());
        assert!(matches!(
            f.service.validate_access(&rotated.access_token).await,
            Err(AuthError::TokenVersionStale)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();

        let report = f
            .service
            .invalidate_all(42, RevocationReason::PasswordChange)
            .await
            .unwrap();
        assert_eq!(report.new_token_version, 1);
        assert_eq!(report.blacklisted, 2);
        assert_eq!(report.revoked_rows, 1);

        assert!(matches!(
            f.service.validate_access(&pair.access_token).await,
            Err(AuthError::TokenVersionStale)
        ));
        assert!(matches!(
            f.service.rotate(&pair.refresh_token).await,
            Err(AuthError::TokenVersionStale)
        ));

        // Retrying is harmless
        let again = f
            .service
            .invalidate_all(42, RevocationReason::PasswordChange)
            .await
            .unwrap();
        assert_eq!(again.new_token_version, 2);
        assert_eq!(again.blacklisted, 0);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_user() {
        let f = fixture(AuthConfig::default()).await;
        assert!(matches!(
            f.service.invalidate_all(999, RevocationReason::Security).await,
            Err(AuthError::UnknownSubject)
        ));
    }

    #[tokio::test]
    async fn test_expiry() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();
        f.clock.advance(Duration::minutes(30));
        assert!(matches!(
            f.service.validate_access(&pair.access_token).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_logout_session() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();
        let claims = f.service.validate_access(&pair.access_token).await.unwrap();

        f.service
            .logout_session(&claims, &pair.access_token, Some(&pair.refresh_token))
            .await
            .unwrap();

        assert!(matches!(
            f.service.validate_access(&pair.access_token).await,
            Err(AuthError::TokenRevoked)
        ));
        assert!(matches!(
            f.service.rotate(&pair.refresh_token).await,
            Err(AuthError::TokenRevoked)
        ));
        let row = f.store.token_row(42).await.unwrap();
        assert!(row.revoked);
        assert_eq!(row.revoked_reason.as_deref(), Some("logout"));
    }

    #[tokio::test]
    async fn test_record_use_stamps_row() {
        let f = fixture(AuthConfig::default()).await;
        let pair = f.service.issue_pair(&f.user).await.unwrap();
        f.clock.advance(Duration::minutes(5));
        f.service.record_use(&pair.access_token).await;

        let row = f.store.token_row(42).await.unwrap();
        assert_eq!(row.last_used_at, Some(f.clock.now()));
    }
}
