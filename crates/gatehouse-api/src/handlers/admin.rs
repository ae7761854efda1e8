//! Admin-only handlers
//!
//! Author: hephaex@gmail.com

use crate::auth::{
    CreateInvitationRequest, InvalidateRequest, InvalidationResponse, InvitationResponse,
};
use crate::error::AppError;
use crate::handlers::auth::optional_json;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use gatehouse_core::{AuthError, RevocationReason, UserId};
use std::sync::Arc;
use validator::Validate;

/// Create an invitation for a prospective customer
#[utoipa::path(
    post,
    path = "/api/v1/admin/invitations",
    tag = "admin",
    request_body = CreateInvitationRequest,
    responses(
        (status = 201, description = "Invitation created", body = InvitationResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 403, description = "Admin role required", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_invitation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateInvitationRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;
    let invitation = state
        .invitations
        .create(&request.email, request.customer_id, request.ttl_days)
        .await?;
    Ok((StatusCode::CREATED, Json(InvitationResponse::from(invitation))))
}

/// Invalidate every session of a user
///
/// Bumps the user's token version, blacklists their recorded tokens and
/// revokes their Token Store rows.
#[utoipa::path(
    post,
    path = "/api/v1/admin/users/{id}/invalidate",
    tag = "admin",
    params(("id" = i64, Path, description = "User id")),
    request_body = InvalidateRequest,
    responses(
        (status = 200, description = "Sessions invalidated", body = InvalidationResponse),
        (status = 404, description = "Unknown user", body = crate::error::ApiError),
        (status = 403, description = "Admin role required", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn invalidate_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let request: InvalidateRequest = optional_json(&body)?;
    let reason = match request.reason.as_deref() {
        None => RevocationReason::Security,
        Some(raw) => match raw.parse::<RevocationReason>()? {
            r @ (RevocationReason::Security | RevocationReason::PasswordChange) => r,
            other => {
                return Err(AppError::Validation(format!(
                    "reason {other} cannot be used for admin invalidation"
                )))
            }
        },
    };

    let report = state
        .tokens
        .invalidate_all(user_id, reason)
        .await
        .map_err(|e| match e {
            AuthError::UnknownSubject => AppError::NotFound {
                code: "USER_NOT_FOUND",
                message: format!("User {user_id} not found"),
            },
            other => other.into(),
        })?;
    tracing::info!(user_id, reason = %reason, "Admin invalidated user sessions");
    Ok(Json(InvalidationResponse::from(report)))
}
