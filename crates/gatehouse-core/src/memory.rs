//! In-process storage backend
//!
//! Used by tests and the `test-utils` router. Each map sits behind its own
//! lock; conditional updates happen under the write guard so they stay atomic.

use crate::clock::Clock;
use crate::{
    AttemptState, AuthError, BlacklistEntry, BlacklistStore, InvitationRepository, IssuedToken,
    Invitation, NewIssuedToken, NewUser, RateLimitKey, RateLimitStore, Result, RevocationReason,
    TokenStore, User, UserId, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    next_user_id: AtomicI64,
    users: RwLock<HashMap<UserId, User>>,
    tokens: RwLock<HashMap<UserId, IssuedToken>>,
    blacklist: RwLock<HashMap<String, BlacklistEntry>>,
    invitations: RwLock<HashMap<String, Invitation>>,
    attempts: RwLock<HashMap<RateLimitKey, AttemptState>>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_user_id: AtomicI64::new(1),
            users: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
            invitations: RwLock::new(HashMap::new()),
            attempts: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a user with a fixed id, replacing any existing one
    pub async fn insert_user(&self, user: User) -> User {
        let id = match user.id {
            Some(id) => {
                self.next_user_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_user_id.fetch_add(1, Ordering::SeqCst),
        };
        let user = User {
            id: Some(id),
            ..user
        };
        self.users.write().await.insert(id, user.clone());
        user
    }

    /// Snapshot of the token row for a user, revoked or not
    pub async fn token_row(&self, user_id: UserId) -> Option<IssuedToken> {
        self.tokens.read().await.get(&user_id).cloned()
    }

    pub async fn blacklist_len(&self) -> usize {
        self.blacklist.read().await.len()
    }
}

// ============================================================================
// Users
// ============================================================================

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn get_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn get_token_version(&self, id: UserId) -> Result<Option<i64>> {
        Ok(self.users.read().await.get(&id).map(|u| u.token_version))
    }

    async fn bump_token_version(&self, id: UserId) -> Result<i64> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&id).ok_or(AuthError::UnknownSubject)?;
        user.token_version += 1;
        Ok(user.token_version)
    }

    async fn create(&self, new: NewUser) -> Result<User> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&new.email))
        {
            return Err(AuthError::Validation("email already registered".to_string()));
        }
        let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
        let user = User {
            id: Some(id),
            email: new.email,
            password_hash: new.password_hash,
            role: new.role,
            verified: new.verified,
            token_version: 0,
            customer_id: new.customer_id,
            created_at: self.clock.now(),
        };
        users.insert(id, user.clone());
        Ok(user)
    }
}

// ============================================================================
// Issued tokens
// ============================================================================

fn holds_hash(row: &IssuedToken, hash: &str) -> bool {
    row.token_hash == hash || row.refresh_token_hash.as_deref() == Some(hash)
}

fn revoke_row(row: &mut IssuedToken, reason: RevocationReason, now: DateTime<Utc>) -> bool {
    if row.revoked {
        return false;
    }
    row.revoked = true;
    row.revoked_at = Some(now);
    row.revoked_reason = Some(reason.as_str().to_string());
    true
}

#[async_trait]
impl TokenStore for InMemoryStore {
    async fn upsert(&self, record: NewIssuedToken) -> Result<()> {
        let now = self.clock.now();
        let row = IssuedToken {
            user_id: record.user_id,
            token_hash: record.token_hash,
            token_jti: Some(record.token_jti),
            refresh_token_hash: record.refresh_token_hash,
            refresh_jti: record.refresh_jti,
            expires_at: record.expires_at,
            refresh_expires_at: record.refresh_expires_at,
            created_at: now,
            revoked: false,
            revoked_at: None,
            revoked_reason: None,
            last_used_at: Some(now),
        };
        self.tokens.write().await.insert(row.user_id, row);
        Ok(())
    }

    async fn mark_used(&self, token_hash: &str) -> Result<()> {
        let now = self.clock.now();
        for row in self.tokens.write().await.values_mut() {
            if holds_hash(row, token_hash) {
                row.last_used_at = Some(now);
            }
        }
        Ok(())
    }

    async fn revoke(&self, token_hash: &str, reason: RevocationReason) -> Result<()> {
        let now = self.clock.now();
        for row in self.tokens.write().await.values_mut() {
            if holds_hash(row, token_hash) {
                revoke_row(row, reason, now);
            }
        }
        Ok(())
    }

    async fn revoke_all(&self, user_id: UserId, reason: RevocationReason) -> Result<u64> {
        let now = self.clock.now();
        let revoked = self
            .tokens
            .write()
            .await
            .get_mut(&user_id)
            .map(|row| revoke_row(row, reason, now))
            .unwrap_or(false);
        Ok(u64::from(revoked))
    }

    async fn is_active(&self, token_hash: &str, allow_expired: bool) -> Result<bool> {
        let now = self.clock.now();
        let tokens = self.tokens.read().await;
        Ok(tokens.values().any(|row| {
            if row.revoked {
                return false;
            }
            if row.token_hash == token_hash {
                return allow_expired || row.expires_at > now;
            }
            if row.refresh_token_hash.as_deref() == Some(token_hash) {
                return allow_expired || row.refresh_expires_at.is_some_and(|exp| exp > now);
            }
            false
        }))
    }

    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<IssuedToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .get(&user_id)
            .filter(|row| !row.revoked)
            .cloned()
            .into_iter()
            .collect())
    }
}

// ============================================================================
// Blacklist
// ============================================================================

#[async_trait]
impl BlacklistStore for InMemoryStore {
    async fn insert(&self, entry: &BlacklistEntry) -> Result<bool> {
        let mut blacklist = self.blacklist.write().await;
        if blacklist.contains_key(&entry.token_id) {
            return Ok(false);
        }
        blacklist.insert(entry.token_id.clone(), entry.clone());
        Ok(true)
    }

    async fn contains(&self, token_id: &str) -> Result<bool> {
        Ok(self.blacklist.read().await.contains_key(token_id))
    }

    async fn purge_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut blacklist = self.blacklist.write().await;
        let before = blacklist.len();
        blacklist.retain(|_, entry| entry.original_exp >= cutoff);
        Ok((before - blacklist.len()) as u64)
    }
}

// ============================================================================
// Invitations
// ============================================================================

#[async_trait]
impl InvitationRepository for InMemoryStore {
    async fn insert(&self, invitation: &Invitation) -> Result<bool> {
        let mut invitations = self.invitations.write().await;
        if invitations.contains_key(&invitation.token) {
            return Ok(false);
        }
        invitations.insert(invitation.token.clone(), invitation.clone());
        Ok(true)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>> {
        Ok(self.invitations.read().await.get(token).cloned())
    }

    async fn mark_used_if_unused(
        &self,
        token: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut invitations = self.invitations.write().await;
        match invitations.get_mut(token) {
            Some(inv) if !inv.is_used() && !inv.is_expired_at(now) => {
                inv.used_at = Some(now);
                inv.used_by_user_id = Some(user_id);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

// ============================================================================
// Rate limits
// ============================================================================

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn try_acquire(
        &self,
        key: &RateLimitKey,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AttemptState> {
        let mut attempts = self.attempts.write().await;
        let state = attempts.entry(key.clone()).or_insert(AttemptState {
            attempts: 0,
            window_started_at: now,
            locked_until: None,
        });
        if state.locked_until.is_some_and(|until| until > now) {
            return Ok(state.clone());
        }
        if state.window_started_at <= window_start || state.locked_until.is_some() {
            state.attempts = 0;
            state.window_started_at = now;
            state.locked_until = None;
        }
        state.attempts += 1;
        if state.attempts > max_attempts {
            state.locked_until = Some(lock_until);
        }
        Ok(state.clone())
    }

    async fn release(&self, key: &RateLimitKey) -> Result<()> {
        if let Some(state) = self.attempts.write().await.get_mut(key) {
            if state.locked_until.is_none() {
                state.attempts = state.attempts.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn reset(&self, key: &RateLimitKey) -> Result<()> {
        self.attempts.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::{RateLimitAction, Role};
    use chrono::Duration;

    fn store() -> (Arc<ManualClock>, InMemoryStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryStore::new(clock.clone());
        (clock, store)
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password_hash: "x".to_string(),
            role: Role::Client,
            verified: true,
            customer_id: None,
        }
    }

    #[tokio::test]
    async fn test_bump_token_version() {
        let (_, store) = store();
        let user = store.create(new_user("a@example.com")).await.unwrap();
        let id = user.id.unwrap();

        assert_eq!(store.bump_token_version(id).await.unwrap(), 1);
        assert_eq!(store.get_token_version(id).await.unwrap(), Some(1));
        assert!(matches!(
            store.bump_token_version(999).await,
            Err(AuthError::UnknownSubject)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let (_, store) = store();
        store.create(new_user("a@example.com")).await.unwrap();
        assert!(store.create(new_user("A@example.com")).await.is_err());
    }

    #[tokio::test]
    async fn test_token_row_lifecycle() {
        let (clock, store) = store();
        let now = clock.now();
        store
            .upsert(NewIssuedToken {
                user_id: 1,
                token_hash: "acc".to_string(),
                token_jti: "j1".to_string(),
                refresh_token_hash: Some("ref".to_string()),
                refresh_jti: Some("j2".to_string()),
                expires_at: now + Duration::minutes(30),
                refresh_expires_at: Some(now + Duration::days(7)),
            })
            .await
            .unwrap();

        assert!(store.is_active("acc", false).await.unwrap());
        assert!(store.is_active("ref", false).await.unwrap());
        assert!(!store.is_active("other", false).await.unwrap());

        clock.advance(Duration::minutes(31));
        assert!(!store.is_active("acc", false).await.unwrap());
        assert!(store.is_active("acc", true).await.unwrap());
        assert!(store.is_active("ref", false).await.unwrap());

        store.revoke("ref", RevocationReason::Logout).await.unwrap();
        assert!(!store.is_active("ref", false).await.unwrap());
        // Revoking twice is a no-op
        store.revoke("ref", RevocationReason::Security).await.unwrap();
        let row = store.token_row(1).await.unwrap();
        assert_eq!(row.revoked_reason.as_deref(), Some("logout"));
        assert_eq!(store.revoke_all(1, RevocationReason::Security).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blacklist_insert_is_first_writer_wins() {
        let (clock, store) = store();
        let entry = BlacklistEntry {
            token_id: "jti-1".to_string(),
            user_id: 1,
            original_exp: clock.now() + Duration::days(7),
            blacklisted_at: clock.now(),
            reason: RevocationReason::TokenRotation,
        };
        assert!(BlacklistStore::insert(&store, &entry).await.unwrap());
        assert!(!BlacklistStore::insert(&store, &entry).await.unwrap());
        assert!(BlacklistStore::contains(&store, "jti-1").await.unwrap());

        let purged = store
            .purge_expired_before(clock.now() + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.blacklist_len().await, 0);
    }

    #[test]
    fn test_invitation_claim_honours_deadline() {
        let (clock, store) = store();
        let now = clock.now();
        let invitation = Invitation {
            token: "ab".repeat(32),
            email: "jane@example.com".to_string(),
            customer_id: 9,
            used_at: None,
            used_by_user_id: None,
            created_at: now,
            expires_at: now + Duration::days(1),
        };

        tokio_test::block_on(async {
            assert!(InvitationRepository::insert(&store, &invitation).await.unwrap());
            assert!(!InvitationRepository::insert(&store, &invitation).await.unwrap());

            let late = invitation.expires_at + Duration::seconds(1);
            assert_eq!(store.mark_used_if_unused(&invitation.token, 7, late).await.unwrap(), 0);

            let at_deadline = invitation.expires_at;
            assert_eq!(store.mark_used_if_unused(&invitation.token, 7, at_deadline).await.unwrap(), 1);
            assert_eq!(store.mark_used_if_unused(&invitation.token, 8, at_deadline).await.unwrap(), 0);

            let stored = store.find_by_token(&invitation.token).await.unwrap().unwrap();
            assert_eq!(stored.used_by_user_id, Some(7));
        });
    }

    #[tokio::test]
    async fn test_attempt_window_resets() {
        let (clock, store) = store();
        let key = RateLimitKey::new("10.0.0.1", RateLimitAction::Login);
        let window = Duration::minutes(15);

        for expected in 1..=3 {
            let now = clock.now();
            let state = store
                .try_acquire(&key, now, now - window, 5, now + window)
                .await
                .unwrap();
            assert_eq!(state.attempts, expected);
            assert!(state.locked_until.is_none());
        }

        clock.advance(Duration::minutes(16));
        let now = clock.now();
        let state = store
            .try_acquire(&key, now, now - window, 5, now + window)
            .await
            .unwrap();
        assert_eq!(state.attempts, 1);
        assert_eq!(state.window_started_at, now);
    }

    #[tokio::test]
    async fn test_acquire_locks_past_limit() {
        let (clock, store) = store();
        let key = RateLimitKey::new("10.0.0.1", RateLimitAction::Refresh);
        let now = clock.now();
        let window_start = now - Duration::minutes(15);
        let until = now + Duration::minutes(5);

        for _ in 0..2 {
            store.try_acquire(&key, now, window_start, 2, until).await.unwrap();
        }
        let state = store.try_acquire(&key, now, window_start, 2, until).await.unwrap();
        assert_eq!(state.attempts, 3);
        assert_eq!(state.locked_until, Some(until));

        // Locked keys are not counted further and cannot be released
        let state = store.try_acquire(&key, now, window_start, 2, until).await.unwrap();
        assert_eq!(state.attempts, 3);
        store.release(&key).await.unwrap();

        clock.advance(Duration::minutes(6));
        let now = clock.now();
        let state = store
            .try_acquire(&key, now, now - Duration::minutes(15), 2, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(state.attempts, 1);
        assert!(state.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_release_returns_reservation() {
        let (clock, store) = store();
        let key = RateLimitKey::new("10.0.0.1", RateLimitAction::InvitationCheck);
        let now = clock.now();
        let window_start = now - Duration::minutes(15);

        store.try_acquire(&key, now, window_start, 5, now).await.unwrap();
        store.try_acquire(&key, now, window_start, 5, now).await.unwrap();
        store.release(&key).await.unwrap();

        let state = store.try_acquire(&key, now, window_start, 5, now).await.unwrap();
        assert_eq!(state.attempts, 2);
    }
}
