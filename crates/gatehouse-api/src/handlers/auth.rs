//! Authentication API handlers
//!
//! Login, refresh, registration and logout. The refresh token is returned
//! in the body and also set as an HTTP-only cookie scoped to the auth routes.
//!
//! Author: hephaex@gmail.com

use crate::auth::{
    AuthResponse, AuthenticatedUser, ClientInfo, LoginRequest, LogoutRequest, LogoutResponse,
    MeResponse, RefreshRequest, RegisterRequest,
};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use gatehouse_core::AuthConfig;
use serde::de::DeserializeOwned;
use std::sync::Arc;

const COOKIE_PATH: &str = "/api/v1/auth";

fn cookie_header(config: &AuthConfig, value: &str, max_age_secs: i64) -> Option<HeaderValue> {
    let secure = if config.secure_cookies { "; Secure" } else { "" };
    let cookie = format!(
        "{}={value}; HttpOnly; SameSite=Strict; Path={COOKIE_PATH}; Max-Age={max_age_secs}{secure}",
        config.refresh_cookie_name
    );
    HeaderValue::from_str(&cookie).ok()
}

/// Value of the named cookie from the `Cookie` header
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Optional JSON body; an empty body is `T::default()`
pub(crate) fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))
}

fn auth_response(state: &AppState, status: StatusCode, body: AuthResponse) -> Response {
    let max_age = (body.refresh_expires_at - state.clock.now())
        .num_seconds()
        .max(0);
    let cookie = cookie_header(&state.config.auth, &body.refresh_token, max_age);

    let mut response = (status, Json(body)).into_response();
    if let Some(cookie) = cookie {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

/// Login with email and password
///
/// Unknown email, wrong password and unverified account all answer
/// `INVALID_CREDENTIALS`. Repeated failures from one address are locked out.
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials", body = crate::error::ApiError),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let response = state.auth.login(request, &client).await?;
    Ok(auth_response(&state, StatusCode::OK, response))
}

/// Exchange a refresh token for a new pair
///
/// The refresh token is read from the JSON body, or from the refresh cookie
/// when the body does not carry one. The presented token is rotated out.
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New tokens issued", body = AuthResponse),
        (status = 400, description = "No refresh token supplied", body = crate::error::ApiError),
        (status = 401, description = "Invalid, expired or reused refresh token", body = crate::error::ApiError),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: RefreshRequest = optional_json(&body)?;
    let token = request
        .refresh_token
        .filter(|t| !t.is_empty())
        .or_else(|| cookie_value(&headers, &state.config.auth.refresh_cookie_name))
        .ok_or_else(|| AppError::BadRequest("refresh token is required".to_string()))?;

    let client = ClientInfo::from_headers(&headers);
    let response = state.auth.refresh(&token, &client).await?;
    Ok(auth_response(&state, StatusCode::OK, response))
}

/// Register with an invitation
///
/// The email must match the invitation. The new account is a verified
/// client bound to the invitation's customer.
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created and logged in", body = AuthResponse),
        (status = 400, description = "Invalid input", body = crate::error::ApiError),
        (status = 404, description = "Unknown invitation", body = crate::error::ApiError),
        (status = 410, description = "Invitation used or expired", body = crate::error::ApiError),
        (status = 429, description = "Too many attempts", body = crate::error::ApiError),
    )
)]
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, AppError> {
    let client = ClientInfo::from_headers(&headers);
    let response = state.auth.register(request, &client).await?;
    Ok(auth_response(&state, StatusCode::CREATED, response))
}

/// Logout
///
/// `scope: "all"` (default) invalidates every session of the user;
/// `scope: "session"` ends only the presented pair.
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Logged out", body = LogoutResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: LogoutRequest = optional_json(&body)?;
    let scope = request.scope.unwrap_or_default();
    let refresh_token = request
        .refresh_token
        .or_else(|| cookie_value(&headers, &state.config.auth.refresh_cookie_name));

    let client = ClientInfo::from_headers(&headers);
    state
        .auth
        .logout(
            &user.claims,
            &user.token,
            scope,
            refresh_token.as_deref(),
            &client,
        )
        .await?;

    let mut response = Json(LogoutResponse {
        scope,
        message: "Logged out".to_string(),
    })
    .into_response();
    if let Some(cookie) = cookie_header(&state.config.auth, "", 0) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    Ok(response)
}

/// Claims of the current access token
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current user", body = MeResponse),
        (status = 401, description = "Unauthorized", body = crate::error::ApiError),
    ),
    security(("bearer_auth" = []))
)]
pub async fn me_handler(Extension(user): Extension<AuthenticatedUser>) -> impl IntoResponse {
    Json(MeResponse::from(&user.claims))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; gh_refresh=abc.def.ghi; other=1"),
        );
        assert_eq!(
            cookie_value(&headers, "gh_refresh").as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_header_attributes() {
        let config = AuthConfig::default();
        let cookie = cookie_header(&config, "tok", 60).unwrap();
        let cookie = cookie.to_str().unwrap();
        assert!(cookie.starts_with("gh_refresh=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Path=/api/v1/auth"));
        assert!(cookie.contains("Max-Age=60"));
        assert!(cookie.ends_with("; Secure"));

        let insecure = AuthConfig {
            secure_cookies: false,
            ..Default::default()
        };
        let cookie = cookie_header(&insecure, "tok", 60).unwrap();
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn test_optional_json() {
        let empty: RefreshRequest = optional_json(&Bytes::new()).unwrap();
        assert!(empty.refresh_token.is_none());

        let parsed: RefreshRequest =
            optional_json(&Bytes::from_static(br#"{"refresh_token":"x"}"#)).unwrap();
        assert_eq!(parsed.refresh_token.as_deref(), Some("x"));

        assert!(optional_json::<RefreshRequest>(&Bytes::from_static(b"{")).is_err());
    }
}
