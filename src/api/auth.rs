//! API-key check and sliding-window rate limiting for write routes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::AppState;
use crate::api::routes::ApiError;
use crate::config::ApiKey;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Per-bucket sliding window of request timestamps.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<Buckets>,
}

struct Buckets {
    hits: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl Buckets {
    /// Drop every bucket whose newest hit has left the window.
    fn sweep(&mut self, now: Instant, window: Duration) {
        self.hits
            .retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < window));
        self.last_sweep = now;
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Buckets {
                hits: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0 && !self.window.is_zero()
    }

    /// Record one request for `bucket`. `false` when the bucket is over its limit.
    ///
    /// Idle buckets are evicted at most once per window.
    pub async fn allow(&self, bucket: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if now.duration_since(state.last_sweep) >= self.window {
            let before = state.hits.len();
            state.sweep(now, self.window);
            debug!(evicted = before - state.hits.len(), "Rate limiter swept idle buckets");
        }

        let window = state.hits.entry(bucket.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            window.pop_front();
        }
        if window.len() >= self.limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

/// Index of the configured key matching the presented one.
fn match_key(keys: &[ApiKey], presented: &str) -> Option<usize> {
    keys.iter()
        .position(|k| k.key.expose_secret() == presented)
}

/// API key if one was presented, else the first forwarded address.
fn bucket_for(headers: &HeaderMap, key_index: Option<usize>) -> String {
    if let Some(index) = key_index {
        return format!("key:{index}");
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("ip:{ip}"))
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Middleware guarding POST routes. Reads pass through untouched.
pub async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let keys = &state.config.api_keys;
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());
    let key_index = presented.and_then(|k| match_key(keys, k));

    if !keys.is_empty() && key_index.is_none() {
        debug!(path = %request.uri().path(), "Rejected request without a valid API key");
        return ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid api key")
            .into_response();
    }

    let bucket = bucket_for(request.headers(), key_index);
    if !state.limiter.allow(&bucket).await {
        warn!(bucket = %bucket, "Rate limit exceeded");
        return ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    if let Some(index) = key_index {
        debug!(key = %keys[index].label, path = %request.uri().path(), "Authenticated request");
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_api_keys;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn limiter_counts_per_bucket() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow("a").await);
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        assert!(limiter.allow("b").await);
    }

    #[tokio::test]
    async fn limiter_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.allow("a").await);
        assert!(!limiter.allow("a").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("a").await);
    }

    #[tokio::test]
    async fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::new(5, Duration::from_millis(50));
        for i in 0..10_000 {
            assert!(limiter.allow(&format!("ip:10.0.{}.{}", i / 256, i % 256)).await);
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("ip:192.0.2.1").await);
        let state = limiter.state.lock().await;
        assert_eq!(state.hits.len(), 1);
        assert!(state.hits.contains_key("ip:192.0.2.1"));
    }

    #[tokio::test]
    async fn sweep_keeps_active_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(100));
        assert!(limiter.allow("idle").await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(limiter.allow("busy").await);
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The sweep on this call drops "idle" but "busy" is still inside its window.
        assert!(limiter.allow("other").await);
        assert!(!limiter.allow("busy").await);
        let state = limiter.state.lock().await;
        assert!(!state.hits.contains_key("idle"));
    }

    #[tokio::test]
    async fn disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.enabled());
        for _ in 0..100 {
            assert!(limiter.allow("a").await);
        }
    }

    #[test]
    fn key_matching() {
        let keys = parse_api_keys("k1:dev,k2:ops,k3");
        assert_eq!(match_key(&keys, "k2"), Some(1));
        assert_eq!(match_key(&keys, "k3"), Some(2));
        assert_eq!(match_key(&keys, "nope"), None);
    }

    #[test]
    fn bucket_selection() {
        let mut headers = HeaderMap::new();
        assert_eq!(bucket_for(&headers, None), "anonymous");

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(bucket_for(&headers, None), "ip:10.0.0.1");
        assert_eq!(bucket_for(&headers, Some(3)), "key:3");
    }
}
