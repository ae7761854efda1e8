//! API route definitions
//!
//! Author: hephaex@gmail.com

use crate::auth::middleware::{auth_middleware, require_admin};
use crate::handlers::{admin, auth, invitations};
use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Create API v1 routes
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Public routes (no authentication required)
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/refresh", post(auth::refresh_handler))
        .route("/auth/register", post(auth::register_handler))
        .route("/invitations/:token", get(invitations::check_invitation))
        .route("/invitations/:token/probe", get(invitations::probe_invitation));

    // Protected routes (authentication required)
    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/me", get(auth::me_handler))
        .route(
            "/invitations/:token/redeem",
            post(invitations::redeem_invitation),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Admin routes; authentication runs before the role check
    let admin_routes = Router::new()
        .route("/admin/invitations", post(admin::create_invitation))
        .route("/admin/users/:id/invalidate", post(admin::invalidate_user))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
}
