//! Invitation handlers
//!
//! Author: hephaex@gmail.com

use crate::audit::{audit_log, AuditEvent};
use crate::auth::{
    AuthenticatedUser, ClientInfo, InvitationCheckResponse, ProbeResponse, Redemption,
    RedeemRequest, RedeemResponse,
};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Extension, Json,
};
use gatehouse_core::{AuthError, RateLimitAction};
use std::sync::Arc;

/// Validate an invitation before showing the registration form
///
/// Unknown tokens count against the caller's `invitation_check` budget.
#[utoipa::path(
    get,
    path = "/api/v1/invitations/{token}",
    tag = "invitations",
    params(("token" = String, Path, description = "Invitation token")),
    responses(
        (status = 200, description = "Invitation is valid", body = InvitationCheckResponse),
        (status = 404, description = "Unknown invitation", body = crate::error::ApiError),
        (status = 410, description = "Invitation used or expired", body = crate::error::ApiError),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn check_invitation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let ip = client.rate_key();
    state
        .rate_limiter
        .acquire(ip, RateLimitAction::InvitationCheck)
        .await?;

    let outcome = state.invitations.check(&token).await;
    let outcome = outcome.and_then(|outcome| outcome.into_result());
    if !matches!(outcome, Err(AuthError::InvitationNotFound)) {
        state
            .rate_limiter
            .release(ip, RateLimitAction::InvitationCheck)
            .await;
    }
    let (customer_id, email) = outcome?;

    Ok(Json(InvitationCheckResponse {
        valid: true,
        email,
        customer_id,
    }))
}

/// Existence and used flag only
#[utoipa::path(
    get,
    path = "/api/v1/invitations/{token}/probe",
    tag = "invitations",
    params(("token" = String, Path, description = "Invitation token")),
    responses(
        (status = 200, description = "Probe result", body = ProbeResponse),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn probe_invitation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let ip = client.rate_key();
    state
        .rate_limiter
        .acquire(ip, RateLimitAction::InvitationCheck)
        .await?;

    let probe = state.invitations.probe(&token).await;
    if !matches!(probe, Ok(ref probe) if !probe.exists) {
        state
            .rate_limiter
            .release(ip, RateLimitAction::InvitationCheck)
            .await;
    }
    let probe = probe?;

    Ok(Json(ProbeResponse {
        exists: probe.exists,
        used: probe.used,
    }))
}

/// Claim an invitation for a user
///
/// Clients may only redeem for themselves. Repeating a successful
/// redemption for the same user succeeds again.
#[utoipa::path(
    post,
    path = "/api/v1/invitations/{token}/redeem",
    tag = "invitations",
    params(("token" = String, Path, description = "Invitation token")),
    request_body = RedeemRequest,
    responses(
        (status = 200, description = "Invitation redeemed", body = RedeemResponse),
        (status = 403, description = "Redeeming for another user", body = crate::error::ApiError),
        (status = 404, description = "Unknown invitation", body = crate::error::ApiError),
        (status = 410, description = "Invitation used or expired", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn redeem_invitation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(request): Json<RedeemRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !user.can_act_for(request.user_id) {
        audit_log(&AuditEvent::AccessDenied {
            user_id: Some(user.user_id),
            resource: "invitation_redeem".to_string(),
            required_role: None,
            ip_address: ClientInfo::from_headers(&headers).ip_address,
        });
        return Err(AppError::Forbidden(
            "cannot redeem an invitation for another user".to_string(),
        ));
    }

    let redemption = state.invitations.redeem(&token, request.user_id).await?;
    Ok(Json(RedeemResponse {
        redeemed: true,
        already_redeemed: redemption == Redemption::AlreadyRedeemedByCaller,
    }))
}
