//! Request and response bodies for the auth and invitation endpoints

use super::jwt::TokenPayload;
use super::tokens::{InvalidationReport, TokenPair};
use chrono::{DateTime, Utc};
use gatehouse_core::{Invitation, Role, User, UserId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// User login request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

/// Token refresh request
///
/// The refresh token may instead arrive in the refresh cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Invitation-gated registration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 256))]
    pub invitation_token: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 1024))]
    pub password: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogoutScope {
    /// Every session of the user
    #[default]
    All,
    /// Only the presented token pair
    Session,
}

impl LogoutScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutScope::All => "all",
            LogoutScope::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LogoutRequest {
    #[serde(default)]
    pub scope: Option<LogoutScope>,
    pub refresh_token: Option<String>,
}

/// Public view of a user
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserInfo {
    pub id: UserId,
    pub email: String,
    #[schema(value_type = String)]
    pub role: Role,
    pub customer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl UserInfo {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id.unwrap_or_default(),
            email: user.email.clone(),
            role: user.role,
            customer_id: user.customer_id,
            created_at: user.created_at,
        }
    }
}

/// Authentication response with tokens
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

impl AuthResponse {
    pub fn new(pair: &TokenPair, user: &User, now: DateTime<Utc>) -> Self {
        Self {
            access_token: pair.access_token.clone(),
            refresh_token: pair.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: (pair.access_expires_at - now).num_seconds().max(0),
            refresh_expires_at: pair.refresh_expires_at,
            user: UserInfo::from_user(user),
        }
    }
}

/// Claims of the current access token
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    pub user_id: UserId,
    pub email: Option<String>,
    pub role: String,
    pub token_version: i64,
    pub expires_at: DateTime<Utc>,
}

impl From<&TokenPayload> for MeResponse {
    fn from(claims: &TokenPayload) -> Self {
        Self {
            user_id: claims.user_id().unwrap_or_default(),
            email: claims.email.clone(),
            role: claims.role.to_string(),
            token_version: claims.token_version,
            expires_at: claims.expires_at(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    pub scope: LogoutScope,
    pub message: String,
}

// ============================================================================
// Invitations
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct CreateInvitationRequest {
    #[validate(email)]
    pub email: String,
    #[validate(range(min = 1))]
    pub customer_id: i64,
    /// Defaults to the configured TTL
    #[validate(range(min = 1, max = 365))]
    pub ttl_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvitationResponse {
    pub token: String,
    pub email: String,
    pub customer_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Invitation> for InvitationResponse {
    fn from(inv: Invitation) -> Self {
        Self {
            token: inv.token,
            email: inv.email,
            customer_id: inv.customer_id,
            created_at: inv.created_at,
            expires_at: inv.expires_at,
        }
    }
}

/// A valid invitation; every other outcome is an error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvitationCheckResponse {
    pub valid: bool,
    pub email: String,
    pub customer_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProbeResponse {
    pub exists: bool,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemResponse {
    pub redeemed: bool,
    /// True when the same user had already redeemed it
    pub already_redeemed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct InvalidateRequest {
    /// `security` (default) or `password_change`
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvalidationResponse {
    pub user_id: UserId,
    pub new_token_version: i64,
    pub blacklisted: u64,
    pub revoked_rows: u64,
}

impl From<InvalidationReport> for InvalidationResponse {
    fn from(report: InvalidationReport) -> Self {
        Self {
            user_id: report.user_id,
            new_token_version: report.new_token_version,
            blacklisted: report.blacklisted,
            revoked_rows: report.revoked_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_validation() {
        let ok = LoginRequest {
            email: "client@example.com".to_string(),
            password: "x".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad = LoginRequest {
            email: "not-an-email".to_string(),
            password: String::new(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_logout_scope_defaults_to_all() {
        let req: LogoutRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.scope.unwrap_or_default(), LogoutScope::All);

        let req: LogoutRequest = serde_json::from_str(r#"{"scope":"session"}"#).unwrap();
        assert_eq!(req.scope, Some(LogoutScope::Session));
    }

    #[test]
    fn test_create_invitation_ttl_bounds() {
        let req = CreateInvitationRequest {
            email: "jane@example.com".to_string(),
            customer_id: 7,
            ttl_days: Some(0),
        };
        assert!(req.validate().is_err());
    }
}
