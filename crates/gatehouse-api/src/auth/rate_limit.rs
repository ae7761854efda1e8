//! Per-IP, per-action attempt counter with lockout
//!
//! Every attempt reserves a slot before any work is done. The reservation
//! is a single atomic increment-and-compare in the store, so concurrent
//! callers each see a distinct count and at most `max_attempts` of them are
//! let through per window. The first caller past the limit locks the key for
//! `lockout_secs`.
//!
//! Callers settle each reservation in one of three ways:
//! - a failure keeps the slot spent
//! - a success calls [`RateLimiter::reset`]
//! - an outcome that should not count calls [`RateLimiter::release`]

use crate::audit::{audit_log, AuditEvent};
use chrono::{DateTime, Duration, Utc};
use gatehouse_core::{
    AttemptState, AuthError, Clock, RateLimitAction, RateLimitConfig, RateLimitKey,
    RateLimitStore, Result, MAX_RATE_LIMIT_SECS,
};
use std::sync::Arc;

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
}

fn retry_after(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

fn bounded_seconds(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(1, MAX_RATE_LIMIT_SECS))
}

impl RateLimiter {
    /// Create a limiter over `store`
    ///
    /// # Arguments
    ///
    /// * `config` - Attempt budget, counting window and lockout length
    /// * `store` - Shared counter storage; all instances must use the same one
    /// * `clock` - Time source for windows and lockouts
    pub fn new(
        config: &RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            max_attempts: config.max_attempts.max(1),
            window: bounded_seconds(config.window_secs),
            lockout: bounded_seconds(config.lockout_secs),
        }
    }

    /// Reserve one attempt for `ip` and `action`
    ///
    /// Must be called before the guarded work runs.
    ///
    /// # Arguments
    ///
    /// * `ip` - Caller address, or the shared `unknown` bucket
    /// * `action` - Which budget the attempt is charged to
    ///
    /// # Returns
    ///
    /// * `Ok(AttemptState)` - The counter including this attempt
    /// * `Err(AuthError::RateLimited)` - The key is locked or this attempt is
    ///   over the limit; carries the seconds until the lockout ends
    pub async fn acquire(&self, ip: &str, action: RateLimitAction) -> Result<AttemptState> {
        let key = RateLimitKey::new(ip, action);
        let now = self.clock.now();
        let window_start = now
            .checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let lock_until = now
            .checked_add_signed(self.lockout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let state = self
            .store
            .try_acquire(&key, now, window_start, self.max_attempts, lock_until)
            .await?;

        let Some(until) = state.locked_until.filter(|until| *until > now) else {
            return Ok(state);
        };
        // Only the caller that placed the lock sees it end at its own deadline.
        // Storage may truncate timestamps to microseconds.
        let placed_here = lock_until - until < Duration::milliseconds(1);
        if state.attempts == self.max_attempts.saturating_add(1) && placed_here {
            tracing::warn!(ip, action = action.as_str(), attempts = state.attempts, "Rate limit lockout");
            audit_log(&AuditEvent::RateLimitLockout {
                ip_address: ip.to_string(),
                action: action.as_str().to_string(),
                locked_until: until,
            });
        }
        Err(AuthError::RateLimited {
            retry_after_secs: retry_after(now, until),
        })
    }

    /// Return a reservation whose attempt should not count. Best effort.
    pub async fn release(&self, ip: &str, action: RateLimitAction) {
        if let Err(e) = self.store.release(&RateLimitKey::new(ip, action)).await {
            tracing::warn!(ip, action = action.as_str(), error = %e, "Failed to release rate limit slot");
        }
    }

    /// Clear the counter after a success. Best effort.
    pub async fn reset(&self, ip: &str, action: RateLimitAction) {
        if let Err(e) = self.store.reset(&RateLimitKey::new(ip, action)).await {
            tracing::warn!(ip, action = action.as_str(), error = %e, "Failed to reset rate limit");
        }
    }
}
