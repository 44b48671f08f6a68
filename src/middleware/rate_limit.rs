// Per-client rate limiting on governor's keyed GCRA limiter

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota,
};
use tracing::{debug, warn};

use crate::auth::AuthError;

/// Per-client rate limiter
///
/// Each client identity gets its own GCRA cell, equivalent to a token bucket
/// of `quota.burst_size()` refilled once per `quota.replenish_interval()`.
/// At most `max_clients` identities are tracked.
pub struct RateLimiter<C: Clock = DefaultClock> {
    keyed: governor::RateLimiter<String, DashMapStateStore<String>, C, NoOpMiddleware<C::Instant>>,
    max_clients: usize,
}

impl RateLimiter {
    pub fn new(quota: Quota, max_clients: usize) -> Self {
        Self::with_clock(quota, max_clients, &DefaultClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(quota: Quota, max_clients: usize, clock: &C) -> Self {
        Self {
            keyed: governor::RateLimiter::dashmap_with_clock(quota, clock),
            max_clients: max_clients.max(1),
        }
    }

    /// Consume one cell for `client`; false when throttled
    ///
    /// With the table full, an idle sweep runs first. If nothing could be
    /// evicted every request is refused until a sweep frees room, so the
    /// table never grows past `max_clients`.
    pub fn allow(&self, client: &str) -> bool {
        if self.keyed.len() >= self.max_clients {
            let evicted = self.sweep_idle();
            debug!(evicted, "Rate limiter at capacity, swept idle clients");
            if self.keyed.len() >= self.max_clients {
                warn!(
                    tracked = self.keyed.len(),
                    "Rate limiter client table full; rejecting request"
                );
                return false;
            }
        }

        self.keyed.check_key(&client.to_string()).is_ok()
    }

    /// Drop clients whose allowance has fully replenished
    ///
    /// A replenished client is indistinguishable from a fresh one, so eviction
    /// never grants extra requests.
    pub fn sweep_idle(&self) -> usize {
        let before = self.keyed.len();
        self.keyed.retain_recent();
        before.saturating_sub(self.keyed.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.keyed.len()
    }
}

/// Identify the caller: X-Forwarded-For (first hop), then X-Real-IP, then the
/// socket address
pub fn client_identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_value("x-real-ip") {
        return real_ip.to_string();
    }

    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware rejecting requests from clients that exhausted their bucket
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), remote);

    if !limiter.allow(&client) {
        warn!(client = %client, endpoint = %request.uri().path(), "Rate limit exceeded");
        return Err(AuthError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderName, HeaderValue, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use axum_test::TestServer;
    use governor::clock::FakeRelativeClock;
    use std::{num::NonZeroU32, time::Duration};

    fn per_minute(burst: u32) -> Quota {
        Quota::per_minute(NonZeroU32::new(1).unwrap()).allow_burst(NonZeroU32::new(burst).unwrap())
    }

    fn limiter(burst: u32, max_clients: usize) -> (RateLimiter<FakeRelativeClock>, FakeRelativeClock) {
        let clock = FakeRelativeClock::default();
        (RateLimiter::with_clock(per_minute(burst), max_clients, &clock), clock)
    }

    #[test]
    fn test_burst_then_refill() {
        let (limiter, clock) = limiter(5, 100);

        for _ in 0..5 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));

        clock.advance(Duration::from_secs(60));

        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let (limiter, clock) = limiter(3, 100);
        assert!(limiter.allow("client"));

        clock.advance(Duration::from_secs(3600));

        for _ in 0..3 {
            assert!(limiter.allow("client"));
        }
        assert!(!limiter.allow("client"));
    }

    #[test]
    fn test_clients_have_independent_buckets() {
        let (limiter, _clock) = limiter(1, 100);

        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_sweep_evicts_only_replenished_clients() {
        let (limiter, clock) = limiter(2, 100);
        assert!(limiter.allow("busy"));
        assert!(limiter.allow("idle"));

        // "idle" replenishes completely, "busy" spends its whole burst again
        clock.advance(Duration::from_secs(600));
        assert!(limiter.allow("busy"));
        assert!(limiter.allow("busy"));

        assert_eq!(limiter.sweep_idle(), 1);
        assert_eq!(limiter.tracked_clients(), 1);

        // "busy" kept its depleted state
        assert!(!limiter.allow("busy"));
    }

    #[test]
    fn test_capacity_sweeps_then_fails_closed() {
        let (limiter, clock) = limiter(1, 2);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));

        // Both clients are drained, so nothing can be evicted
        assert!(!limiter.allow("c"));
        assert_eq!(limiter.tracked_clients(), 2);

        // Replenished clients are idle and give up their slots
        clock.advance(Duration::from_secs(600));
        assert!(limiter.allow("c"));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_double_spend() {
        let limiter = Arc::new(RateLimiter::new(per_minute(10), 100));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("shared") })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_client_identity_precedence() {
        let remote: SocketAddr = "192.168.1.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();

        assert_eq!(client_identity(&headers, None), "unknown");
        assert_eq!(client_identity(&headers, Some(remote)), "192.168.1.9");

        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.4"));
        assert_eq!(client_identity(&headers, Some(remote)), "172.16.0.4");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, Some(remote)), "203.0.113.7");
    }

    #[tokio::test]
    async fn test_middleware_returns_429() {
        let limiter = Arc::new(RateLimiter::new(per_minute(2), 100));
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit));
        let server = TestServer::new(app).unwrap();

        let forwarded = HeaderName::from_static("x-forwarded-for");
        for _ in 0..2 {
            let response = server
                .get("/")
                .add_header(forwarded.clone(), HeaderValue::from_static("198.51.100.1"))
                .await;
            assert_eq!(response.status_code(), StatusCode::OK);
        }

        let response = server
            .get("/")
            .add_header(forwarded.clone(), HeaderValue::from_static("198.51.100.1"))
            .await;
        assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error_code"], "RATE_LIMITED");

        // A different client is unaffected
        let response = server
            .get("/")
            .add_header(forwarded, HeaderValue::from_static("198.51.100.2"))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }
}
