//! Gatehouse API - token lifecycle and invitation redemption over HTTP
//!
//! Provides the token services (signing, blacklist, rotation, mass
//! invalidation), the invitation service, rate limiting, and the axum
//! router exposing them.

pub mod audit;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

#[cfg(feature = "test-utils")]
pub mod testing;

use crate::state::AppState;
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI document served at `/api-docs/openapi.json`
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::health::readiness_check,
        handlers::auth::login_handler,
        handlers::auth::refresh_handler,
        handlers::auth::register_handler,
        handlers::auth::logout_handler,
        handlers::auth::me_handler,
        handlers::invitations::check_invitation,
        handlers::invitations::probe_invitation,
        handlers::invitations::redeem_invitation,
        handlers::admin::create_invitation,
        handlers::admin::invalidate_user,
    ),
    components(schemas(
        error::ApiError,
        handlers::health::HealthResponse,
        handlers::health::ReadinessResponse,
        auth::LoginRequest,
        auth::RefreshRequest,
        auth::RegisterRequest,
        auth::LogoutRequest,
        auth::LogoutScope,
        auth::LogoutResponse,
        auth::AuthResponse,
        auth::UserInfo,
        auth::MeResponse,
        auth::CreateInvitationRequest,
        auth::InvitationResponse,
        auth::InvitationCheckResponse,
        auth::ProbeResponse,
        auth::RedeemRequest,
        auth::RedeemResponse,
        auth::InvalidateRequest,
        auth::InvalidationResponse,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Liveness and readiness"),
        (name = "auth", description = "Login, refresh, registration and logout"),
        (name = "invitations", description = "Invitation check and redemption"),
        (name = "admin", description = "Administrative operations"),
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    // Credentials are only allowed with an explicit origin list
    base.allow_origin(AllowOrigin::list(allowed))
        .allow_credentials(true)
}

/// Build the full application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs.max(1));
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::prometheus_metrics))
        .nest("/api/v1", routes::api_routes(state.clone()))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(axum::middleware::from_fn(middleware::metrics_middleware))
        .layer(axum::middleware::from_fn(
            middleware::security_headers_middleware,
        ))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_auth_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/auth/login"));
        assert!(doc.paths.paths.contains_key("/api/v1/invitations/{token}/redeem"));
        assert!(doc.paths.paths.contains_key("/api/v1/admin/users/{id}/invalidate"));
    }

    #[test]
    fn test_cors_layer_accepts_any_origin_list() {
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&["https://app.example.com".to_string()]);
    }
}
