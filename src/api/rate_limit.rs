//! Per-IP request limits for the public API, login/signup and payment callbacks.
//!
//! Each (client IP, tier) pair gets a fixed budget per window; the budget refills
//! proportionally to the time since the last request.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::ApiError;
use crate::config::RateLimitConfig;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    Api,
    /// Stripe and SSLCommerz callbacks
    Webhook,
    /// Login and signup
    Auth,
}

#[derive(Debug, Clone)]
struct Bucket {
    remaining: u32,
    window_start: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<(IpAddr, RateLimitTier), Bucket>,
    config: RateLimitConfig,
    window: Duration,
}

/// Outcome of an allowed request
#[derive(Debug, Clone, Copy)]
pub struct Allowance {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            window: Duration::from_secs(config.window_seconds.max(1)),
            config,
        }
    }

    fn limit(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Api => self.config.api_requests_per_window,
            RateLimitTier::Webhook => self.config.webhook_requests_per_window,
            RateLimitTier::Auth => self.config.auth_requests_per_window,
        }
    }

    /// Take one request from the bucket. `Err` carries the seconds until retry.
    pub fn check(&self, ip: IpAddr, tier: RateLimitTier) -> Result<Allowance, u64> {
        let limit = self.limit(tier);
        if !self.config.enabled {
            return Ok(Allowance {
                limit,
                remaining: limit,
                reset_after: 0,
            });
        }

        let now = Instant::now();
        let mut bucket = self.buckets.entry((ip, tier)).or_insert_with(|| Bucket {
            remaining: limit,
            window_start: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.window_start);
        if elapsed >= self.window {
            bucket.remaining = limit;
            bucket.window_start = now;
        } else {
            let idle = now.duration_since(bucket.last_seen).as_secs_f64();
            let refill = (idle * limit as f64 / self.window.as_secs_f64()) as u32;
            bucket.remaining = bucket.remaining.saturating_add(refill).min(limit);
        }
        bucket.last_seen = now;

        let reset_after = self
            .window
            .saturating_sub(now.duration_since(bucket.window_start))
            .as_secs();
        if bucket.remaining == 0 {
            return Err(reset_after.max(1));
        }
        bucket.remaining -= 1;

        Ok(Allowance {
            limit,
            remaining: bucket.remaining,
            reset_after,
        })
    }

    /// Drop buckets idle for two windows
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let ttl = self.window * 2;
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_seen) < ttl);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Client address as reported by the reverse proxy. X-Real-IP is set by the proxy
/// itself; in X-Forwarded-For only the rightmost hop was appended by it, the rest
/// comes from the client.
fn client_ip(headers: &HeaderMap) -> IpAddr {
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next());

    real_ip
        .into_iter()
        .chain(forwarded)
        .find_map(|v| v.trim().parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub async fn rate_limit_api(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    limit_tier(&state, request, next, RateLimitTier::Api).await
}

pub async fn rate_limit_webhook(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    limit_tier(&state, request, next, RateLimitTier::Webhook).await
}

pub async fn rate_limit_auth(State(state): State<Arc<AppState>>, request: Request<Body>, next: Next) -> Response {
    limit_tier(&state, request, next, RateLimitTier::Auth).await
}

async fn limit_tier(state: &AppState, request: Request<Body>, next: Next, tier: RateLimitTier) -> Response {
    let ip = client_ip(request.headers());

    match state.rate_limiter.check(ip, tier) {
        Ok(allowance) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(allowance.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(allowance.remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(allowance.reset_after));
            response
        }
        Err(retry_after) => {
            tracing::warn!(ip = %ip, tier = ?tier, "Rate limit exceeded");
            let mut response = ApiError::rate_limited(format!(
                "Too many requests. Try again in {} seconds.",
                retry_after
            ))
            .into_response();
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from(retry_after));
            response
        }
    }
}

/// Periodically forget idle clients
pub fn spawn_cleanup_task(rate_limiter: Arc<RateLimiter>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tick.tick().await;
            rate_limiter.cleanup_expired();
            tracing::debug!(tracked = rate_limiter.len(), "Rate limiter cleanup complete");
        }
    });
}
