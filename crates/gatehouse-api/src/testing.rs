//! Test support: a fully wired app over the in-process store
//!
//! Enabled by the `test-utils` feature. Seeds one admin and one client
//! account and drives time with a [`ManualClock`].

use crate::create_router;
use crate::state::{AppState, Backends};
use axum::Router;
use chrono::Utc;
use gatehouse_core::password::{hash_password_with_config, PasswordConfig};
use gatehouse_core::{AppConfig, InMemoryStore, ManualClock, Role, StaticSecrets, User};
use std::sync::Arc;

pub const TEST_ADMIN_ID: i64 = 1;
pub const TEST_ADMIN_EMAIL: &str = "admin@example.com";
pub const TEST_ADMIN_PASSWORD: &str = "Adm1n!Passw0rd";

pub const TEST_CLIENT_ID: i64 = 42;
pub const TEST_CLIENT_EMAIL: &str = "client@example.com";
pub const TEST_CLIENT_PASSWORD: &str = "Cl1ent!Passw0rd";
pub const TEST_CLIENT_CUSTOMER_ID: i64 = 7;

/// Cheap Argon2 parameters so suites stay fast
pub fn light_password_config() -> PasswordConfig {
    PasswordConfig {
        memory_cost: 8 * 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

/// Defaults plus test secrets and plain-HTTP cookies
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.access_secret = Some("test-access-secret".to_string());
    config.auth.refresh_secret = Some("test-refresh-secret".to_string());
    config.auth.secure_cookies = false;
    config
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    /// Fresh router over the same state, for another `oneshot`
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

async fn seed_user(
    store: &InMemoryStore,
    id: i64,
    email: &str,
    password: &str,
    role: Role,
    customer_id: Option<i64>,
) {
    let password_hash = hash_password_with_config(password, &light_password_config())
        .expect("hash seed password");
    store
        .insert_user(User {
            id: Some(id),
            email: email.to_string(),
            password_hash,
            role,
            verified: true,
            token_version: 0,
            customer_id,
            created_at: Utc::now(),
        })
        .await;
}

pub async fn spawn_test_app_with(config: AppConfig) -> TestApp {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(InMemoryStore::new(clock.clone()));

    seed_user(
        &store,
        TEST_ADMIN_ID,
        TEST_ADMIN_EMAIL,
        TEST_ADMIN_PASSWORD,
        Role::Admin,
        None,
    )
    .await;
    seed_user(
        &store,
        TEST_CLIENT_ID,
        TEST_CLIENT_EMAIL,
        TEST_CLIENT_PASSWORD,
        Role::Client,
        Some(TEST_CLIENT_CUSTOMER_ID),
    )
    .await;

    let secrets = Arc::new(StaticSecrets::from_config(&config.auth));
    let state = Arc::new(
        AppState::new(config, Backends::shared(store.clone()), secrets, clock.clone())
            .with_password_config(light_password_config()),
    );

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
        clock,
    }
}

pub async fn spawn_test_app() -> TestApp {
    spawn_test_app_with(test_config()).await
}

/// Router backed by the in-process store with seeded accounts
pub async fn create_router_for_testing() -> Router {
    spawn_test_app().await.router
}
