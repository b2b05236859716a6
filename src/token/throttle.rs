//! Per-username throttle for password grants.

use std::num::NonZeroU32;

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DefaultKeyedStateStore,
};

type UsernameRateLimiter<C> =
    RateLimiter<String, DefaultKeyedStateStore<String>, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Limits password attempts per username.
///
/// State for a username is created the first time it is seen and dropped by
/// [`prune`](Self::prune) once it has fully replenished, so presenting many
/// distinct usernames cannot grow the table without bound. A throttle built
/// with a zero quota is disabled and tracks nothing.
pub struct LoginThrottle<C: Clock = DefaultClock> {
    limiter: Option<UsernameRateLimiter<C>>,
}

impl LoginThrottle {
    /// Create a throttle allowing `attempts_per_minute` attempts per username.
    /// Zero means unlimited.
    #[must_use]
    pub fn new(attempts_per_minute: u32) -> Self {
        Self::with_clock(attempts_per_minute, DefaultClock::default())
    }
}

impl<C: Clock> LoginThrottle<C> {
    /// Like [`LoginThrottle::new`], reading time from `clock`.
    #[must_use]
    pub fn with_clock(attempts_per_minute: u32, clock: C) -> Self {
        Self {
            limiter: NonZeroU32::new(attempts_per_minute)
                .map(|n| RateLimiter::dashmap_with_clock(Quota::per_minute(n), clock)),
        }
    }

    /// Record an attempt for `username`. Returns `false` when over quota.
    pub fn check(&self, username: &str) -> bool {
        self.limiter
            .as_ref()
            .is_none_or(|limiter| limiter.check_key(&username.to_string()).is_ok())
    }

    /// Forget usernames whose quota has fully replenished.
    pub fn prune(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Number of usernames currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}

impl<C: Clock> std::fmt::Debug for LoginThrottle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginThrottle")
            .field("enabled", &self.limiter.is_some())
            .field("tracked", &self.tracked())
            .finish()
    }
}
