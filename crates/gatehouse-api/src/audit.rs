//! Security audit logging for token and invitation events
//!
//! Every event is emitted at INFO level with the `audit` target and the
//! event serialized as JSON, so it can be routed separately from
//! application logs.
//!
//! ```ignore
//! use gatehouse_api::audit::{audit_log, AuditEvent};
//!
//! audit_log(&AuditEvent::LoginSuccess {
//!     user_id: 42,
//!     email: "client@example.com".to_string(),
//!     ip_address: Some("192.168.1.1".to_string()),
//!     user_agent: None,
//! });
//! ```
//!
//! Author: hephaex@gmail.com

use chrono::{DateTime, Utc};
use gatehouse_core::UserId;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Security audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    LoginSuccess {
        user_id: UserId,
        email: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    LoginFailure {
        email: String,
        reason: String,
        ip_address: Option<String>,
        user_agent: Option<String>,
    },

    /// Refresh token exchanged for a new pair
    TokenRefresh {
        user_id: UserId,
        ip_address: Option<String>,
    },

    /// A rotated-out refresh token was presented again
    RefreshTokenReuse {
        user_id: UserId,
        jti: String,
        sessions_invalidated: bool,
    },

    Logout {
        user_id: UserId,
        /// `session` or `all`
        scope: String,
        ip_address: Option<String>,
    },

    /// Token version bumped for every session of a user
    SessionsInvalidated {
        user_id: UserId,
        reason: String,
        new_token_version: i64,
    },

    RegistrationSuccess {
        user_id: UserId,
        email: String,
        customer_id: i64,
        ip_address: Option<String>,
    },

    RegistrationFailure {
        email: String,
        reason: String,
        ip_address: Option<String>,
    },

    InvitationCreated {
        email: String,
        customer_id: i64,
        expires_at: DateTime<Utc>,
    },

    InvitationRedeemed {
        user_id: UserId,
    },

    /// Authenticated but lacking the required role or ownership
    AccessDenied {
        user_id: Option<UserId>,
        resource: String,
        required_role: Option<String>,
        ip_address: Option<String>,
    },

    /// Invalid, expired or revoked token presented
    InvalidToken {
        ip_address: Option<String>,
        reason: String,
    },

    RateLimitLockout {
        ip_address: String,
        action: String,
        locked_until: DateTime<Utc>,
    },
}

impl AuditEvent {
    fn message(&self) -> &'static str {
        match self {
            AuditEvent::LoginSuccess { .. } => "Login successful",
            AuditEvent::LoginFailure { .. } => "Login failed",
            AuditEvent::TokenRefresh { .. } => "Token refresh",
            AuditEvent::RefreshTokenReuse { .. } => "Refresh token reuse detected",
            AuditEvent::Logout { .. } => "User logout",
            AuditEvent::SessionsInvalidated { .. } => "All sessions invalidated",
            AuditEvent::RegistrationSuccess { .. } => "Registration successful",
            AuditEvent::RegistrationFailure { .. } => "Registration failed",
            AuditEvent::InvitationCreated { .. } => "Invitation created",
            AuditEvent::InvitationRedeemed { .. } => "Invitation redeemed",
            AuditEvent::AccessDenied { .. } => "Access denied",
            AuditEvent::InvalidToken { .. } => "Invalid token",
            AuditEvent::RateLimitLockout { .. } => "Rate limit lockout",
        }
    }

    fn user_id(&self) -> Option<UserId> {
        match self {
            AuditEvent::LoginSuccess { user_id, .. }
            | AuditEvent::TokenRefresh { user_id, .. }
            | AuditEvent::RefreshTokenReuse { user_id, .. }
            | AuditEvent::Logout { user_id, .. }
            | AuditEvent::SessionsInvalidated { user_id, .. }
            | AuditEvent::RegistrationSuccess { user_id, .. }
            | AuditEvent::InvitationRedeemed { user_id } => Some(*user_id),
            AuditEvent::AccessDenied { user_id, .. } => *user_id,
            _ => None,
        }
    }
}

/// Log a security audit event with the `audit` target
pub fn audit_log(event: &AuditEvent) {
    let event_json = serde_json::to_string(event)
        .unwrap_or_else(|e| format!("{{\"error\":\"Failed to serialize audit event: {e}\"}}"));

    info!(
        target: "audit",
        timestamp = %Utc::now(),
        event = %event_json,
        user_id = ?event.user_id(),
        "{}",
        event.message()
    );
}

/// Client address from X-Forwarded-For (first hop) or X-Real-IP
pub fn extract_ip_address(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn extract_user_agent(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = AuditEvent::RefreshTokenReuse {
            user_id: 42,
            jti: "abc".to_string(),
            sessions_invalidated: false,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"refresh_token_reuse\""));
        assert!(json.contains("\"user_id\":42"));
        assert_eq!(event.user_id(), Some(42));
    }

    #[test]
    fn test_audit_log_does_not_panic() {
        audit_log(&AuditEvent::LoginFailure {
            email: "client@example.com".to_string(),
            reason: "invalid_credentials".to_string(),
            ip_address: Some("192.168.1.1".to_string()),
            user_agent: None,
        });
        audit_log(&AuditEvent::RateLimitLockout {
            ip_address: "192.168.1.1".to_string(),
            action: "login".to_string(),
            locked_until: Utc::now(),
        });
    }

    #[test]
    fn test_extract_ip_from_x_forwarded_for() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.1, 198.51.100.1".parse().unwrap(),
        );
        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_extract_ip_from_x_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.1".parse().unwrap());
        assert_eq!(extract_ip_address(&headers), Some("203.0.113.1".to_string()));
    }

    #[test]
    fn test_missing_headers() {
        let headers = axum::http::HeaderMap::new();
        assert_eq!(extract_ip_address(&headers), None);
        assert_eq!(extract_user_agent(&headers), None);
    }
}
