//! Application state management
//!
//! Author: hephaex@gmail.com

use crate::auth::{AuthService, Blacklist, InvitationService, RateLimiter, TokenService, TokenSigner};
use gatehouse_core::password::PasswordConfig;
use gatehouse_core::{
    AppConfig, BlacklistStore, Clock, InvitationRepository, PgStore, RateLimitStore,
    SecretProvider, TokenStore, UserRepository,
};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Storage handles for every collaborator
#[derive(Clone)]
pub struct Backends {
    pub users: Arc<dyn UserRepository>,
    pub token_store: Arc<dyn TokenStore>,
    pub blacklist_store: Arc<dyn BlacklistStore>,
    pub invitations: Arc<dyn InvitationRepository>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    /// Present for the PostgreSQL backend; used by the readiness probe
    pub pool: Option<PgPool>,
}

impl Backends {
    /// One store serving every concern
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: UserRepository
            + TokenStore
            + BlacklistStore
            + InvitationRepository
            + RateLimitStore
            + 'static,
    {
        Self {
            users: store.clone(),
            token_store: store.clone(),
            blacklist_store: store.clone(),
            invitations: store.clone(),
            rate_limits: store,
            pool: None,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let pool = store.pool().clone();
        Self {
            pool: Some(pool),
            ..Self::shared(Arc::new(store))
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Server start time
    pub start_time: Instant,
    /// Ready status
    pub is_ready: AtomicBool,
    pub clock: Arc<dyn Clock>,
    pub users: Arc<dyn UserRepository>,
    pub blacklist: Arc<Blacklist>,
    pub tokens: Arc<TokenService>,
    pub invitations: Arc<InvitationService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: AuthService,
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Wire every service from configuration and storage
    pub fn new(
        config: AppConfig,
        backends: Backends,
        secrets: Arc<dyn SecretProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let signer = Arc::new(TokenSigner::new(&config.auth, secrets, clock.clone()));
        let blacklist = Arc::new(Blacklist::new(
            backends.blacklist_store.clone(),
            backends.token_store.clone(),
            clock.clone(),
        ));
        let tokens = Arc::new(TokenService::new(
            &config.auth,
            signer,
            backends.users.clone(),
            backends.token_store.clone(),
            blacklist.clone(),
        ));
        let invitations = Arc::new(InvitationService::new(
            &config.invitations,
            backends.invitations.clone(),
            clock.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            backends.rate_limits.clone(),
            clock.clone(),
        ));
        let auth = AuthService::new(
            backends.users.clone(),
            tokens.clone(),
            invitations.clone(),
            rate_limiter.clone(),
            clock.clone(),
        );

        Self {
            config,
            start_time: Instant::now(),
            is_ready: AtomicBool::new(true),
            clock,
            users: backends.users,
            blacklist,
            tokens,
            invitations,
            rate_limiter,
            auth,
            pool: backends.pool,
        }
    }

    /// Argon2 parameters for accounts created at registration
    pub fn with_password_config(mut self, password: PasswordConfig) -> Self {
        self.auth = self.auth.with_password_config(password);
        self
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if service is ready
    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::SeqCst)
    }

    /// Set ready status
    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::SeqCst);
    }
}
