/// Authentication middleware for protecting routes
///
/// Extracts the Bearer token, runs the full access-token validation and, on
/// success, adds the authenticated user to request extensions.
use super::jwt::TokenPayload;
use crate::audit::{audit_log, extract_ip_address, AuditEvent};
use crate::error::AppError;
use crate::middleware::metrics::record_auth_outcome;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use gatehouse_core::{Role, UserId};
use std::sync::Arc;

/// Authenticated user extracted from a validated access token
///
/// Handlers take it as `Extension<AuthenticatedUser>`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub email: Option<String>,
    pub role: Role,
    pub jti: String,
    pub token_version: i64,
    pub expires_at: DateTime<Utc>,
    pub claims: TokenPayload,
    /// Raw bearer token, needed to revoke the session row at logout
    pub token: String,
}

impl AuthenticatedUser {
    pub fn from_claims(claims: TokenPayload, token: String) -> Result<Self, AppError> {
        let user_id = claims.user_id().map_err(|_| AppError::InvalidToken)?;
        Ok(Self {
            user_id,
            email: claims.email.clone(),
            role: claims.role,
            jti: claims.jti.clone(),
            token_version: claims.token_version,
            expires_at: claims.expires_at(),
            claims,
            token,
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act on anyone; clients only on themselves
    pub fn can_act_for(&self, user_id: UserId) -> bool {
        self.is_admin() || self.user_id == user_id
    }
}

pub(crate) fn bearer_token(request: &Request<Body>) -> Result<&str, AppError> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AppError::Unauthorized)?
        .to_str()
        .map_err(|_| AppError::Unauthorized)?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::Unauthorized)
}

/// Authentication middleware that requires a valid access token
///
/// ```ignore
/// let protected = Router::new()
///     .route("/auth/me", get(me_handler))
///     .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));
/// ```
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let ip_address = extract_ip_address(request.headers());
    let token = bearer_token(&request)?.to_string();

    let claims = match state.tokens.validate_access(&token).await {
        Ok(claims) => claims,
        Err(e) if e.is_token_failure() => {
            audit_log(&AuditEvent::InvalidToken {
                ip_address,
                reason: e.kind().to_string(),
            });
            record_auth_outcome("validate", e.kind());
            return Err(e.into());
        }
        Err(e) => {
            // Fail closed when the stores cannot answer
            tracing::error!(error = %e, "Access token validation could not complete");
            record_auth_outcome("validate", e.kind());
            return Err(AppError::Unauthorized);
        }
    };

    state.tokens.record_use(&token).await;

    let user = AuthenticatedUser::from_claims(claims, token)?;
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// Role check for admin-only routes; must run after [`auth_middleware`]
pub async fn require_admin(request: Request<Body>, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .ok_or(AppError::Unauthorized)?;

    if !user.is_admin() {
        audit_log(&AuditEvent::AccessDenied {
            user_id: Some(user.user_id),
            resource: request.uri().path().to_string(),
            required_role: Some(Role::Admin.to_string()),
            ip_address: extract_ip_address(request.headers()),
        });
        return Err(AppError::Forbidden("admin role required".to_string()));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::TokenType;

    fn claims(sub: &str, role: Role) -> TokenPayload {
        TokenPayload {
            iss: "gatehouse".to_string(),
            aud: "gatehouse-clients".to_string(),
            iat: 1_700_000_000,
            exp: 1_700_001_800,
            jti: "jti-1".to_string(),
            sub: sub.to_string(),
            email: Some("client@example.com".to_string()),
            role,
            token_version: 3,
            token_type: Some(TokenType::Access),
        }
    }

    #[test]
    fn test_authenticated_user_from_claims() {
        let user =
            AuthenticatedUser::from_claims(claims("42", Role::Client), "tok".to_string()).unwrap();
        assert_eq!(user.user_id, 42);
        assert_eq!(user.token_version, 3);
        assert_eq!(user.jti, "jti-1");
        assert!(!user.is_admin());
        assert!(user.can_act_for(42));
        assert!(!user.can_act_for(43));
    }

    #[test]
    fn test_admin_can_act_for_anyone() {
        let admin =
            AuthenticatedUser::from_claims(claims("1", Role::Admin), "tok".to_string()).unwrap();
        assert!(admin.can_act_for(42));
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        assert!(AuthenticatedUser::from_claims(claims("abc", Role::Client), String::new()).is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let request = Request::builder()
            .header(header::AUTHORIZATION, "Bearer abc.def.ghi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request).unwrap(), "abc.def.ghi");

        let request = Request::builder()
            .header(header::AUTHORIZATION, "Basic Zm9vOmJhcg==")
            .body(Body::empty())
            .unwrap();
        assert!(bearer_token(&request).is_err());

        let request = Request::builder().body(Body::empty()).unwrap();
        assert!(bearer_token(&request).is_err());
    }
}
