//! API error handling
//!
//! Author: hephaex@gmail.com

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gatehouse_core::AuthError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Authentication required")
    }

    pub fn forbidden() -> Self {
        Self::new("FORBIDDEN", "Access denied")
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL_ERROR", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    NotFound { code: &'static str, message: String },
    /// Resource existed but can no longer be used
    Gone { code: &'static str, message: String },
    BadRequest(String),
    Validation(String),
    Unauthorized,
    InvalidToken,
    TokenExpired,
    InvalidCredentials,
    Forbidden(String),
    RateLimited { retry_after_secs: u64 },
    Internal(String),
    Database(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Gone { .. } => StatusCode::GONE,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized
            | AppError::InvalidToken
            | AppError::TokenExpired
            | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut retry_after = None;

        let error = match self {
            AppError::NotFound { code, message } | AppError::Gone { code, message } => {
                ApiError::new(code, message)
            }
            AppError::BadRequest(msg) => ApiError::bad_request(msg),
            AppError::Validation(msg) => ApiError::new("VALIDATION_ERROR", msg),
            AppError::Unauthorized => ApiError::unauthorized(),
            AppError::InvalidToken => ApiError::new("INVALID_TOKEN", "Invalid or expired token"),
            AppError::TokenExpired => ApiError::new("TOKEN_EXPIRED", "Token has expired"),
            AppError::InvalidCredentials => {
                ApiError::new("INVALID_CREDENTIALS", "Invalid email or password")
            }
            AppError::Forbidden(msg) => ApiError::forbidden().with_details(msg),
            AppError::RateLimited { retry_after_secs } => {
                retry_after = Some(retry_after_secs);
                ApiError::new("RATE_LIMITED", "Too many attempts, try again later")
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::internal_error()
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ApiError::new("DATABASE_ERROR", "Database operation failed")
            }
        };

        let mut response = (status, Json(error)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenExpired => AppError::TokenExpired,
            AuthError::TokenMalformed
            | AuthError::TokenInvalidSignature
            | AuthError::TokenMissingClaims(_)
            | AuthError::TokenRevoked
            | AuthError::TokenVersionStale
            | AuthError::TokenTypeMismatch { .. }
            | AuthError::TokenAudienceMismatch
            | AuthError::UnknownSubject => AppError::InvalidToken,
            AuthError::InvalidCredentials => AppError::InvalidCredentials,
            AuthError::RateLimited { retry_after_secs } => AppError::RateLimited { retry_after_secs },
            AuthError::InvitationNotFound => AppError::NotFound {
                code: "INVITATION_NOT_FOUND",
                message: "Invitation not found".to_string(),
            },
            AuthError::InvitationUsed { .. } => AppError::Gone {
                code: "INVITATION_USED",
                message: "Invitation has already been used".to_string(),
            },
            AuthError::InvitationExpired => AppError::Gone {
                code: "INVITATION_EXPIRED",
                message: "Invitation has expired".to_string(),
            },
            AuthError::Validation(msg) => AppError::Validation(msg),
            AuthError::Store(msg) => AppError::Database(msg),
            e @ (AuthError::Config(_) | AuthError::Issuance(_)) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
