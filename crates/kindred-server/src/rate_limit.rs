//! Token-bucket rate limiting, keyed per client.
//!
//! One limiter type, two keyings: the HTTP surface runs an IP-keyed
//! limiter as middleware, and the WebSocket reader budgets inbound frames
//! through a connection-keyed limiter (`RateLimiter<ConnId>`).

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            refilled_at: Instant::now(),
        }
    }

    fn take_one(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.refilled_at = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_secs(&self, now: Instant) -> f64 {
        now.duration_since(self.refilled_at).as_secs_f64()
    }
}

/// One bucket per key; a request passes while its bucket has tokens.
#[derive(Clone)]
pub struct RateLimiter<K: Eq + Hash = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    rate: f64,
    capacity: f64,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: K) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| Bucket::full(self.capacity));
        bucket.take_one(self.rate, self.capacity)
    }

    /// Drop a key's bucket outright (a connection went away).
    pub async fn forget(&self, key: &K) {
        self.buckets.lock().await.remove(key);
    }

    /// Evict buckets idle for longer than `max_idle_secs`.
    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| bucket.idle_secs(now) < max_idle_secs);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// ConnectInfo first, then proxy headers.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    for header in ["x-forwarded-for", "x-real-ip"] {
        let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let first = value.split(',').next().unwrap_or(value);
        if let Ok(ip) = first.trim().parse::<IpAddr>() {
            return Some(ip);
        }
    }

    None
}
