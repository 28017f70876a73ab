use std::{fmt, num::NonZeroU32, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::NimbusError;

use super::{ApiError, ServerState, Team};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often teams whose quota has fully replenished are dropped from the limiter.
pub const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-team request limiter.
///
/// Each team gets a GCRA bucket allowing `limit` requests per second, with a burst of the same
/// size. Buckets are created on a team's first request and pruned by [`spawn_rate_limit_pruner`]
/// once they are full again.
pub struct RateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RateLimiter {
    /// Allows `limit` requests per team per second. `0` allows everything.
    pub fn new(limit: u32) -> Self {
        Self {
            limiter: NonZeroU32::new(limit)
                .map(|limit| governor::RateLimiter::keyed(Quota::per_second(limit))),
            clock: DefaultClock::default(),
        }
    }

    /// Counts one request from `team`.
    pub fn check(&self, team: &str) -> Result<(), NimbusError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        limiter
            .check_key(&team.to_string())
            .map_err(|not_until| NimbusError::RateLimited {
                retry_after_ms: not_until.wait_time_from(self.clock.now()).as_millis() as u64,
            })
    }

    /// Drops the buckets of teams that could send a full burst again.
    pub fn retain_recent(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// The number of teams currently tracked.
    pub fn tracked_teams(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Prunes idle teams from `limiter` every `interval` until `shutdown` fires.
pub fn spawn_rate_limit_pruner(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    limiter.retain_recent();
                    tracing::trace!(teams = limiter.tracked_teams(), "pruned rate limiter");
                }
            }
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Functions: Middleware
//--------------------------------------------------------------------------------------------------

/// Rejects requests of teams over their request rate.
///
/// Runs after [`auth_middleware`](super::auth_middleware), which attaches the [`Team`].
pub async fn rate_limit_middleware(
    State(state): State<ServerState>,
    Extension(team): Extension<Team>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Err(e) = state.limiter().check(&team.0) {
        tracing::debug!(team = %team.0, "rate limited");
        return ApiError(e).into_response();
    }

    next.run(req).await
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.limiter.is_some())
            .field("tracked_teams", &self.tracked_teams())
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_team() {
        let limiter = RateLimiter::new(2);

        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        let err = limiter.check("a").unwrap_err();
        assert!(matches!(
            err,
            NimbusError::RateLimited { retry_after_ms } if retry_after_ms <= 500
        ));

        // Other teams have their own bucket.
        assert!(limiter.check("b").is_ok());
        assert_eq!(limiter.tracked_teams(), 2);
    }

    #[test]
    fn test_no_double_burst_across_a_second_boundary() {
        let limiter = RateLimiter::new(4);
        for _ in 0..4 {
            assert!(limiter.check("a").is_ok());
        }

        // A fixed window would hand out a fresh batch of four after the boundary. The bucket
        // only refills one request every quarter second.
        std::thread::sleep(Duration::from_millis(300));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn test_idle_teams_are_pruned() {
        let limiter = RateLimiter::new(10);
        for team in ["a", "b", "c"] {
            assert!(limiter.check(team).is_ok());
        }
        assert_eq!(limiter.tracked_teams(), 3);

        // One request replenishes after a tenth of a second.
        std::thread::sleep(Duration::from_millis(150));
        limiter.retain_recent();
        assert_eq!(limiter.tracked_teams(), 0);
    }

    #[tokio::test]
    async fn test_pruner_stops_on_shutdown() -> anyhow::Result<()> {
        let limiter = Arc::new(RateLimiter::new(1));
        let shutdown = CancellationToken::new();
        let pruner =
            spawn_rate_limit_pruner(limiter.clone(), Duration::from_millis(10), shutdown.clone());

        assert!(limiter.check("a").is_ok());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), pruner).await??;
        Ok(())
    }

    #[test]
    fn test_zero_disables_limiting() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check("a").is_ok());
        }
        assert_eq!(limiter.tracked_teams(), 0);
    }
}
