//! Invitation Service
//!
//! An invitation is `pending` until redeemed exactly once (`used`) or until
//! its deadline passes (`expired`). Redemption is a single conditional update
//! in the repository; concurrent redeemers are told apart by re-reading the
//! row afterwards.

use crate::audit::{audit_log, AuditEvent};
use chrono::Duration;
use gatehouse_core::{
    AuthError, Clock, Invitation, InvitationConfig, InvitationRepository, InvitationState, Result,
    UsedBy, UserId, MAX_INVITATION_TTL_DAYS,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use validator::ValidateEmail;

const MAX_INSERT_ATTEMPTS: usize = 3;

/// Result of a full invitation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Valid { customer_id: i64, email: String },
    Used,
    Expired,
    NotFound,
}

impl CheckOutcome {
    /// Turn every non-valid outcome into its error
    pub fn into_result(self) -> Result<(i64, String)> {
        match self {
            CheckOutcome::Valid { customer_id, email } => Ok((customer_id, email)),
            CheckOutcome::Used => Err(AuthError::InvitationUsed { by: UsedBy::Other }),
            CheckOutcome::Expired => Err(AuthError::InvitationExpired),
            CheckOutcome::NotFound => Err(AuthError::InvitationNotFound),
        }
    }
}

/// Lightweight existence check for UI gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub exists: bool,
    pub used: bool,
}

/// Successful redemption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    Redeemed,
    /// Same user redeemed it before; treated as success
    AlreadyRedeemedByCaller,
}

pub struct InvitationService {
    repo: Arc<dyn InvitationRepository>,
    clock: Arc<dyn Clock>,
    default_ttl_days: i64,
    token_bytes: usize,
}

impl InvitationService {
    pub fn new(
        config: &InvitationConfig,
        repo: Arc<dyn InvitationRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            clock,
            default_ttl_days: config.default_ttl_days,
            token_bytes: config.token_bytes.max(16),
        }
    }

    fn generate_token(&self) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Create a pending invitation
    ///
    /// # Arguments
    ///
    /// * `email` - Address the invitation is issued to
    /// * `customer_id` - Customer the registered account will belong to
    /// * `ttl_days` - Lifetime in days; defaults to the configured value
    ///
    /// # Returns
    ///
    /// * `Ok(Invitation)` - The stored invitation, including its secret token
    /// * `Err(AuthError::Validation)` - Bad email or a TTL outside 1..=365 days
    /// * `Err(AuthError::Issuance)` - No unique token after repeated collisions
    pub async fn create(
        &self,
        email: &str,
        customer_id: i64,
        ttl_days: Option<i64>,
    ) -> Result<Invitation> {
        let email = email.trim();
        if !email.to_string().validate_email() {
            return Err(AuthError::Validation(format!("invalid email address: {email}")));
        }
        let ttl_days = ttl_days.unwrap_or(self.default_ttl_days);
        if !(1..=MAX_INVITATION_TTL_DAYS).contains(&ttl_days) {
            return Err(AuthError::Validation(format!(
                "ttl_days must be between 1 and {MAX_INVITATION_TTL_DAYS}"
            )));
        }

        let now = self.clock.now();
        let expires_at = Duration::try_days(ttl_days)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| AuthError::Validation(format!("ttl_days out of range: {ttl_days}")))?;
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let invitation = Invitation {
                token: self.generate_token(),
                email: email.to_string(),
                customer_id,
                used_at: None,
                used_by_user_id: None,
                created_at: now,
                expires_at,
            };
            if self.repo.insert(&invitation).await? {
                audit_log(&AuditEvent::InvitationCreated {
                    email: invitation.email.clone(),
                    customer_id,
                    expires_at: invitation.expires_at,
                });
                return Ok(invitation);
            }
            tracing::warn!(attempt, "Invitation token collision, regenerating");
        }
        Err(AuthError::Issuance(
            "could not generate a unique invitation token".to_string(),
        ))
    }

    /// Existence and used flag only. Never mutates.
    pub async fn probe(&self, token: &str) -> Result<ProbeResult> {
        Ok(match self.repo.find_by_token(token).await? {
            Some(inv) => ProbeResult {
                exists: true,
                used: inv.is_used(),
            },
            None => ProbeResult {
                exists: false,
                used: false,
            },
        })
    }

    /// Full validation. Expiry is evaluated before use.
    pub async fn check(&self, token: &str) -> Result<CheckOutcome> {
        let Some(inv) = self.repo.find_by_token(token).await? else {
            return Ok(CheckOutcome::NotFound);
        };
        Ok(match inv.state_at(self.clock.now()) {
            InvitationState::Expired => CheckOutcome::Expired,
            InvitationState::Used => CheckOutcome::Used,
            InvitationState::Pending => CheckOutcome::Valid {
                customer_id: inv.customer_id,
                email: inv.email,
            },
        })
    }

    /// Claim the invitation for `user_id`.
    ///
    /// Exactly one concurrent caller gets `Redeemed`. A repeat by the same
    /// user is `AlreadyRedeemedByCaller`; anyone else gets
    /// `InvitationUsed { by: Other }`.
    ///
    /// # Arguments
    ///
    /// * `token` - Invitation token
    /// * `user_id` - Account claiming the invitation
    ///
    /// # Returns
    ///
    /// * `Ok(Redemption)` - Claimed now, or earlier by the same user
    /// * `Err(AuthError::InvitationNotFound)` - Unknown token
    /// * `Err(AuthError::InvitationExpired)` - Past `expires_at`
    /// * `Err(AuthError::InvitationUsed)` - Claimed by another user
    pub async fn redeem(&self, token: &str, user_id: UserId) -> Result<Redemption> {
        let now = self.clock.now();
        if self.repo.mark_used_if_unused(token, user_id, now).await? == 1 {
            tracing::info!(user_id, "Invitation redeemed");
            audit_log(&AuditEvent::InvitationRedeemed { user_id });
            return Ok(Redemption::Redeemed);
        }

        let inv = self
            .repo
            .find_by_token(token)
            .await?
            .ok_or(AuthError::InvitationNotFound)?;

        match inv.used_by_user_id {
            Some(by) if by == user_id => Ok(Redemption::AlreadyRedeemedByCaller),
            Some(_) => Err(AuthError::InvitationUsed { by: UsedBy::Other }),
            None if inv.is_used() => Err(AuthError::InvitationUsed { by: UsedBy::Other }),
            None if inv.is_expired_at(now) => Err(AuthError::InvitationExpired),
            None => Err(AuthError::Store(
                "conditional invitation update matched no row".to_string(),
            )),
        }
    }
}
