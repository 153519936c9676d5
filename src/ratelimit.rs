//! Per-requester rate limiting for the `intake` webhook endpoints, grounded
//! on the teacher's `core/rate_limit.rs` (`KeyedRateLimiter` over
//! `governor`, one limiter instance per key, lazily created). Scaled down
//! to the single tier this crate needs: inbound chat commands all land on
//! the same two routes, so there is no per-path tier split to make.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Keys limiters by requester (email header, falling back to peer IP), so a
/// single misbehaving caller can't starve the webhook for everyone else.
pub struct KeyedRateLimiter {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
    quota: Quota,
    cleanup_threshold: usize,
}

impl KeyedRateLimiter {
    pub fn new(requests_per_second: u32, burst_size: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst_size).unwrap_or(NonZeroU32::MIN));
        Self { limiters: RwLock::new(HashMap::new()), quota, cleanup_threshold: 10_000 }
    }

    pub async fn check(&self, key: &str) -> bool {
        let existing = self.limiters.read().await.get(key).cloned();
        let limiter = match existing {
            Some(l) => l,
            None => {
                let mut limiters = self.limiters.write().await;
                if limiters.len() > self.cleanup_threshold {
                    limiters.clear();
                }
                let new_limiter = Arc::new(RateLimiter::direct(self.quota));
                limiters.insert(key.to_string(), Arc::clone(&new_limiter));
                new_limiter
            }
        };
        limiter.check().is_ok()
    }
}

pub struct RateLimitState {
    pub enabled: bool,
    limiter: KeyedRateLimiter,
}

impl RateLimitState {
    pub fn new(enabled: bool, requests_per_second: u32, burst: u32) -> Arc<Self> {
        Arc::new(Self { enabled, limiter: KeyedRateLimiter::new(requests_per_second, burst) })
    }
}

/// Prefer the signed requester identity carried on chat-command webhooks;
/// without one, key by source IP so unauthenticated spam still gets capped.
fn rate_limit_key(headers: &HeaderMap, req: &Request) -> String {
    if let Some(email) = headers.get("X-SSO-Elevator-Requester").and_then(|v| v.to_str().ok()) {
        return email.to_string();
    }
    req.extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(State(state): State<Arc<RateLimitState>>, headers: HeaderMap, req: Request, next: Next) -> Response {
    if !state.enabled {
        return next.run(req).await;
    }
    let key = rate_limit_key(&headers, &req);
    if state.limiter.check(&key).await {
        next.run(req).await
    } else {
        let body = serde_json::json!({"error": "rate_limit_exceeded", "message": "too many requests, slow down"});
        (StatusCode::TOO_MANY_REQUESTS, [("Retry-After", "1")], body.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_then_rejects() {
        let limiter = KeyedRateLimiter::new(1, 2);
        assert!(limiter.check("a").await);
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_budgets() {
        let limiter = KeyedRateLimiter::new(1, 1);
        assert!(limiter.check("a").await);
        assert!(!limiter.check("a").await);
        assert!(limiter.check("b").await);
    }
}
