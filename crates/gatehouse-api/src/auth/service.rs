//! Authentication service layer
//!
//! Composes the Token Service, Invitation Service and Rate Limiter into the
//! login, refresh, registration and logout flows served over HTTP.
//!
//! Author: hephaex@gmail.com

use super::invitation::InvitationService;
use super::jwt::TokenPayload;
use super::models::{AuthResponse, LoginRequest, LogoutScope, RegisterRequest};
use super::rate_limit::RateLimiter;
use super::tokens::TokenService;
use crate::audit::{audit_log, extract_ip_address, extract_user_agent, AuditEvent};
use crate::middleware::metrics::record_auth_outcome;
use gatehouse_core::password::{
    hash_password_with_config, validate_password_strength, PasswordConfig,
};
use gatehouse_core::{
    AuthError, Clock, NewUser, RateLimitAction, RevocationReason, Role, User, UserRepository,
    Result,
};
use std::sync::Arc;
use validator::Validate;

/// Caller details used for rate limiting and audit
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        Self {
            ip_address: extract_ip_address(headers),
            user_agent: extract_user_agent(headers),
        }
    }

    /// Rate-limit key; unidentifiable clients share one bucket
    pub fn rate_key(&self) -> &str {
        self.ip_address.as_deref().unwrap_or("unknown")
    }
}

/// Authentication service
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    tokens: Arc<TokenService>,
    invitations: Arc<InvitationService>,
    rate_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    password: PasswordConfig,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tokens: Arc<TokenService>,
        invitations: Arc<InvitationService>,
        rate_limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            tokens,
            invitations,
            rate_limiter,
            clock,
            password: PasswordConfig::default(),
        }
    }

    /// Override the Argon2 cost parameters used for new accounts
    pub fn with_password_config(mut self, password: PasswordConfig) -> Self {
        self.password = password;
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Email/password login
    ///
    /// Unknown email, wrong password and unverified account are
    /// indistinguishable to the caller. Each attempt is charged to the
    /// caller's `login` budget before the password is checked.
    ///
    /// # Arguments
    ///
    /// * `request` - Submitted credentials
    /// * `client` - Caller address and user agent
    ///
    /// # Returns
    ///
    /// * `Ok(AuthResponse)` - A fresh token pair
    /// * `Err(AuthError::InvalidCredentials)` - Any credential failure
    /// * `Err(AuthError::RateLimited)` - The caller's `login` budget is spent
    pub async fn login(&self, request: LoginRequest, client: &ClientInfo) -> Result<AuthResponse> {
        let ip = client.rate_key();
        self.rate_limiter.acquire(ip, RateLimitAction::Login).await?;

        if request.validate().is_err() {
            return self.login_failed(&request.email, "malformed_request", client);
        }

        let user = match self.users.get_by_email(request.email.trim()).await {
            Ok(Some(user)) => user,
            Ok(None) => return self.login_failed(&request.email, "unknown_email", client),
            Err(e) => {
                self.rate_limiter.release(ip, RateLimitAction::Login).await;
                return Err(e);
            }
        };
        if !self.users.verify_password(&request.password, &user.password_hash) {
            return self.login_failed(&request.email, "wrong_password", client);
        }
        if !user.verified {
            return self.login_failed(&request.email, "unverified", client);
        }

        self.rate_limiter.reset(ip, RateLimitAction::Login).await;
        let pair = self.tokens.issue_pair(&user).await?;

        audit_log(&AuditEvent::LoginSuccess {
            user_id: pair.access_claims.user_id()?,
            email: user.email.clone(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });
        record_auth_outcome("login", "success");
        Ok(AuthResponse::new(&pair, &user, self.clock.now()))
    }

    /// The reserved attempt stays spent
    fn login_failed<T>(&self, email: &str, reason: &str, client: &ClientInfo) -> Result<T> {
        audit_log(&AuditEvent::LoginFailure {
            email: email.to_string(),
            reason: reason.to_string(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        });
        record_auth_outcome("login", "failure");
        Err(AuthError::InvalidCredentials)
    }

    /// Rotate a refresh token into a new pair
    ///
    /// Rejected tokens spend the caller's `refresh` budget; storage
    /// failures give the reservation back.
    pub async fn refresh(&self, refresh_token: &str, client: &ClientInfo) -> Result<AuthResponse> {
        let ip = client.rate_key();
        self.rate_limiter.acquire(ip, RateLimitAction::Refresh).await?;

        let pair = match self.tokens.rotate(refresh_token).await {
            Ok(pair) => pair,
            Err(e) if e.is_token_failure() => {
                audit_log(&AuditEvent::InvalidToken {
                    ip_address: client.ip_address.clone(),
                    reason: e.kind().to_string(),
                });
                record_auth_outcome("refresh", e.kind());
                return Err(e);
            }
            Err(e) => {
                self.rate_limiter.release(ip, RateLimitAction::Refresh).await;
                return Err(e);
            }
        };
        self.rate_limiter.reset(ip, RateLimitAction::Refresh).await;

        let user_id = pair.access_claims.user_id()?;
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or(AuthError::UnknownSubject)?;

        audit_log(&AuditEvent::TokenRefresh {
            user_id,
            ip_address: client.ip_address.clone(),
        });
        record_auth_outcome("refresh", "success");
        Ok(AuthResponse::new(&pair, &user, self.clock.now()))
    }

    /// Invitation-gated self-registration
    ///
    /// The account is created before the invitation is redeemed. If another
    /// request redeems the invitation in between, the new account is left
    /// without a session and the failure is logged.
    ///
    /// Only invitation failures (unknown, used, expired) spend the caller's
    /// `register` budget; any other outcome gives the reservation back.
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: &ClientInfo,
    ) -> Result<AuthResponse> {
        let ip = client.rate_key();
        self.rate_limiter.acquire(ip, RateLimitAction::Register).await?;

        match self.register_inner(&request).await {
            Ok((user, response)) => {
                self.rate_limiter.reset(ip, RateLimitAction::Register).await;
                audit_log(&AuditEvent::RegistrationSuccess {
                    user_id: user.id.unwrap_or_default(),
                    email: user.email.clone(),
                    customer_id: user.customer_id.unwrap_or_default(),
                    ip_address: client.ip_address.clone(),
                });
                record_auth_outcome("register", "success");
                Ok(response)
            }
            Err(e) => {
                if !matches!(
                    e,
                    AuthError::InvitationNotFound
                        | AuthError::InvitationUsed { .. }
                        | AuthError::InvitationExpired
                ) {
                    self.rate_limiter.release(ip, RateLimitAction::Register).await;
                }
                audit_log(&AuditEvent::RegistrationFailure {
                    email: request.email.clone(),
                    reason: e.kind().to_string(),
                    ip_address: client.ip_address.clone(),
                });
                record_auth_outcome("register", e.kind());
                Err(e)
            }
        }
    }

    async fn register_inner(&self, request: &RegisterRequest) -> Result<(User, AuthResponse)> {
        request
            .validate()
            .map_err(|e| AuthError::Validation(e.to_string()))?;

        let (customer_id, invited_email) = self
            .invitations
            .check(&request.invitation_token)
            .await?
            .into_result()?;
        if !invited_email.eq_ignore_ascii_case(request.email.trim()) {
            return Err(AuthError::Validation(
                "email does not match the invitation".to_string(),
            ));
        }
        validate_password_strength(&request.password).map_err(AuthError::Validation)?;

        if self.users.get_by_email(&invited_email).await?.is_some() {
            return Err(AuthError::Validation("email is already registered".to_string()));
        }

        let password_hash = hash_password_with_config(&request.password, &self.password)
            .map_err(|e| AuthError::Issuance(e.to_string()))?;
        let user = self
            .users
            .create(NewUser {
                email: invited_email,
                password_hash,
                role: Role::Client,
                verified: true,
                customer_id: Some(customer_id),
            })
            .await?;
        let user_id = user
            .id
            .ok_or_else(|| AuthError::Store("created user has no id".to_string()))?;

        if let Err(e) = self
            .invitations
            .redeem(&request.invitation_token, user_id)
            .await
        {
            tracing::error!(
                user_id,
                error = %e,
                "Invitation redemption failed after account creation"
            );
            return Err(e);
        }

        let pair = self.tokens.issue_pair(&user).await?;
        let response = AuthResponse::new(&pair, &user, self.clock.now());
        Ok((user, response))
    }

    /// End the caller's session, or every session of the caller
    pub async fn logout(
        &self,
        claims: &TokenPayload,
        access_token: &str,
        scope: LogoutScope,
        refresh_token: Option<&str>,
        client: &ClientInfo,
    ) -> Result<()> {
        let user_id = claims.user_id()?;
        match scope {
            LogoutScope::All => {
                self.tokens
                    .invalidate_all(user_id, RevocationReason::Logout)
                    .await?;
            }
            LogoutScope::Session => {
                self.tokens
                    .logout_session(claims, access_token, refresh_token)
                    .await?;
            }
        }

        audit_log(&AuditEvent::Logout {
            user_id,
            scope: scope.as_str().to_string(),
            ip_address: client.ip_address.clone(),
        });
        record_auth_outcome("logout", scope.as_str());
        Ok(())
    }
}
