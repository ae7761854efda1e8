//! Revocation ledger keyed by `jti`
//!
//! Inserts are idempotent: a duplicate `jti` is a successful no-op, and
//! [`Blacklist::add`] reports whether this call was the one that created the
//! entry. Rotation relies on that to detect reuse.

use chrono::{DateTime, Duration, Utc};
use gatehouse_core::{
    AuthError, BlacklistEntry, BlacklistStore, Clock, Result, RevocationReason, TokenStore,
    UserId,
};
use std::sync::Arc;

pub struct Blacklist {
    store: Arc<dyn BlacklistStore>,
    tokens: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl Blacklist {
    pub fn new(
        store: Arc<dyn BlacklistStore>,
        tokens: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            tokens,
            clock,
        }
    }

    /// Returns `true` if the entry was created by this call
    pub async fn add(
        &self,
        jti: &str,
        user_id: UserId,
        original_exp: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<bool> {
        let entry = BlacklistEntry {
            token_id: jti.to_string(),
            user_id,
            original_exp,
            blacklisted_at: self.clock.now(),
            reason,
        };
        let created = self.store.insert(&entry).await?;
        if created {
            tracing::debug!(user_id, jti, reason = %reason, "Token blacklisted");
        }
        Ok(created)
    }

    pub async fn contains(&self, jti: &str) -> Result<bool> {
        self.store.contains(jti).await
    }

    /// Blacklist every `jti` recorded in the user's live Token Store rows.
    ///
    /// Returns the number of entries this call created. Tokens that were
    /// never persisted are not reachable here; the version bump covers them.
    pub async fn add_all_active_for_user(
        &self,
        user_id: UserId,
        reason: RevocationReason,
    ) -> Result<u64> {
        let mut added = 0;
        for row in self.tokens.active_for_user(user_id).await? {
            if let Some(jti) = row.token_jti.as_deref() {
                if self.add(jti, user_id, row.expires_at, reason).await? {
                    added += 1;
                }
            }
            if let (Some(jti), Some(exp)) = (row.refresh_jti.as_deref(), row.refresh_expires_at) {
                if self.add(jti, user_id, exp, reason).await? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Drop entries whose token expired more than `days` ago
    ///
    /// # Arguments
    ///
    /// * `days` - Retention after the token's own expiry; negative counts as 0
    ///
    /// # Returns
    ///
    /// * `Ok(u64)` - Number of entries removed
    /// * `Err(AuthError::Validation)` - `days` does not fit a timestamp
    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Duration::try_days(days.max(0))
            .and_then(|retention| self.clock.now().checked_sub_signed(retention))
            .ok_or_else(|| AuthError::Validation(format!("days out of range: {days}")))?;
        let removed = self.store.purge_expired_before(cutoff).await?;
        tracing::info!(days, removed, "Purged blacklist entries");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::{InMemoryStore, ManualClock, NewIssuedToken};

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryStore>, Blacklist) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let blacklist = Blacklist::new(store.clone(), store.clone(), clock.clone());
        (clock, store, blacklist)
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let (clock, _, blacklist) = setup();
        let exp = clock.now() + Duration::days(7);

        assert!(blacklist
            .add("jti-1", 1, exp, RevocationReason::Logout)
            .await
            .unwrap());
        assert!(!blacklist
            .add("jti-1", 1, exp, RevocationReason::Security)
            .await
            .unwrap());
        assert!(blacklist.contains("jti-1").await.unwrap());
        assert!(!blacklist.contains("jti-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_user_rows() {
        let (clock, store, blacklist) = setup();
        let now = clock.now();
        store
            .upsert(NewIssuedToken {
                user_id: 7,
                token_hash: "a".to_string(),
                token_jti: "access-jti".to_string(),
                refresh_token_hash: Some("r".to_string()),
                refresh_jti: Some("refresh-jti".to_string()),
                expires_at: now + Duration::minutes(30),
                refresh_expires_at: Some(now + Duration::days(7)),
            })
            .await
            .unwrap();

        let added = blacklist
            .add_all_active_for_user(7, RevocationReason::PasswordChange)
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert!(blacklist.contains("access-jti").await.unwrap());
        assert!(blacklist.contains("refresh-jti").await.unwrap());

        // Retry is safe
        let added = blacklist
            .add_all_active_for_user(7, RevocationReason::PasswordChange)
            .await
            .unwrap();
        assert_eq!(added, 0);
    }

    #[tokio::test]
    async fn test_purge_uses_original_exp() {
        let (clock, store, blacklist) = setup();
        let now = clock.now();
        blacklist
            .add("old", 1, now - Duration::days(40), RevocationReason::Logout)
            .await
            .unwrap();
        blacklist
            .add("recent", 1, now - Duration::days(2), RevocationReason::Logout)
            .await
            .unwrap();

        assert_eq!(blacklist.purge_older_than(30).await.unwrap(), 1);
        assert_eq!(store.blacklist_len().await, 1);
        assert!(blacklist.contains("recent").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_rejects_unrepresentable_retention() {
        let (_, store, blacklist) = setup();
        blacklist
            .add("kept", 1, Utc::now(), RevocationReason::Logout)
            .await
            .unwrap();

        assert!(matches!(
            blacklist.purge_older_than(i64::MAX).await,
            Err(AuthError::Validation(_))
        ));
        assert_eq!(store.blacklist_len().await, 1);
    }
}
