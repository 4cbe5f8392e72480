//! Per-peer token bucket.
//!
//! One GCRA bucket per `(user, pid)`, held in governor's sharded keyed
//! store so peers never contend on a shared counter.

use super::{Middleware, Next, RequestContext};
use crate::config::RateLimitConfig;
use crate::error::{IpcError, Result};
use crate::peer::PeerKey;
use crate::protocol::{Request, Response};
use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::{debug, warn};

pub struct RateLimit {
    limiter: Option<DefaultKeyedRateLimiter<PeerKey>>,
    clock: DefaultClock,
}

impl RateLimit {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let rate = NonZeroU32::new(config.requests_per_second).ok_or_else(|| IpcError::Config {
            message: "rate_limit.requests_per_second must be non-zero".to_string(),
        })?;
        let burst = NonZeroU32::new(config.burst).ok_or_else(|| IpcError::Config {
            message: "rate_limit.burst must be non-zero".to_string(),
        })?;

        Ok(Self {
            limiter: Some(RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst))),
            clock: DefaultClock::default(),
        })
    }

    pub fn disabled() -> Self {
        Self {
            limiter: None,
            clock: DefaultClock::default(),
        }
    }

    /// Take one token from `key`'s bucket.
    pub fn check(&self, key: &PeerKey) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter.check_key(key).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            IpcError::RateLimited {
                retry_after_ms: wait.as_millis().max(1) as u64,
            }
        })
    }

    /// Drop buckets that have refilled completely.
    pub fn forget_idle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
            debug!("Rate limiter tracking {} peer(s)", limiter.len());
        }
    }
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit")
            .field("enabled", &self.limiter.is_some())
            .finish()
    }
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &RequestContext, request: Request, next: Next<'_>) -> Response {
        if let Err(e) = self.check(&ctx.peer.key()) {
            ctx.connection.record_rejected();
            warn!(
                peer_pid = ctx.peer.pid,
                path = %request.path,
                "Peer over request budget: {}",
                e
            );
            return Response::from_error(&e);
        }
        next.run(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, CountingEndpoint};
    use super::super::MiddlewareChain;
    use super::*;
    use crate::peer::UserId;
    use std::sync::atomic::Ordering;

    fn config(rate: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            requests_per_second: rate,
            burst,
        }
    }

    fn key(pid: u32) -> PeerKey {
        PeerKey {
            user: UserId::from_uid(1000),
            pid,
        }
    }

    #[test]
    fn test_burst_then_rejected() {
        let limit = RateLimit::new(&config(1, 3)).unwrap();
        for _ in 0..3 {
            limit.check(&key(1)).unwrap();
        }
        match limit.check(&key(1)) {
            Err(IpcError::RateLimited { retry_after_ms }) => assert!(retry_after_ms >= 1),
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_peers_have_independent_budgets() {
        let limit = RateLimit::new(&config(1, 2)).unwrap();
        limit.check(&key(1)).unwrap();
        limit.check(&key(1)).unwrap();
        assert!(limit.check(&key(1)).is_err());

        // Exhausting peer 1 leaves peer 2 untouched
        limit.check(&key(2)).unwrap();
        limit.check(&key(2)).unwrap();
        assert!(limit.check(&key(2)).is_err());
    }

    #[test]
    fn test_disabled_never_limits() {
        let limit = RateLimit::new(&RateLimitConfig {
            enabled: false,
            requests_per_second: 1,
            burst: 1,
        })
        .unwrap();
        for _ in 0..100 {
            limit.check(&key(1)).unwrap();
        }
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(RateLimit::new(&config(0, 0)).is_err());
    }

    #[tokio::test]
    async fn test_rejected_requests_skip_endpoint_and_count() {
        let mut chain = MiddlewareChain::new();
        chain.push(RateLimit::new(&config(1, 2)).unwrap());
        let endpoint = CountingEndpoint::default();
        let ctx = context(1000, 5, None);

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(chain.run(&ctx, Request::get("/api/v1/health"), &endpoint).await.status_code);
        }

        assert_eq!(statuses, vec![200, 200, 429, 429]);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.connection.snapshot().requests_rejected, 2);
    }
}
