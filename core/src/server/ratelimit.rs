/*
 * ratelimit.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Request rate limiting: token bucket, fixed window and sliding window
//! behind one trait, pluggable key extraction, periodic idle-key cleanup,
//! and a middleware adapter emitting the X-RateLimit-* headers.
//!
//! Each algorithm guards its per-key map with a single mutex held only for
//! one lookup/update. Distinct keys never share budget.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::RateLimitConfig;
use crate::protocol::http::{Request, Response};
use crate::server::router::{Middleware, MiddlewareAction};

/// Cleanup worker wakes at most this often.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Keys idle longer than this are purged.
pub const IDLE_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    Disabled,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::TokenBucket => "token_bucket",
            LimitType::FixedWindow => "fixed_window",
            LimitType::SlidingWindow => "sliding_window",
            LimitType::Disabled => "disabled",
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after: Duration,
    pub limit_type: LimitType,
    pub reason: Option<String>,
}

struct Decision {
    allowed: bool,
    remaining: u64,
    reset_after: Duration,
}

trait Algorithm: Send + Sync {
    fn check(&self, key: &str, now: Instant) -> Decision;
    fn cleanup(&self, now: Instant);
    fn limit(&self) -> u64;
    fn kind(&self) -> LimitType;
}

// ---------------------------------------------------------------- token bucket

struct BucketState {
    tokens: u64,
    last_refill: Instant,
    last_seen: Instant,
}

struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    refill_interval: Duration,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBucket {
    fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_rate: refill_rate.max(1),
            refill_interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl Algorithm for TokenBucket {
    fn check(&self, key: &str, now: Instant) -> Decision {
        let mut buckets = self.buckets.lock().unwrap();
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });
        state.last_seen = now;

        let elapsed = now.saturating_duration_since(state.last_refill);
        let interval_nanos = self.refill_interval.as_nanos().max(1);
        let intervals = (elapsed.as_nanos() / interval_nanos) as u64;
        if intervals > 0 {
            state.tokens = (state.tokens + intervals * self.refill_rate).min(self.capacity);
            // Advance by whole intervals so partial progress is kept.
            state.last_refill += self.refill_interval * intervals as u32;
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            Decision {
                allowed: true,
                remaining: state.tokens,
                reset_after: self.refill_interval,
            }
        } else {
            let since_refill = now.saturating_duration_since(state.last_refill);
            let reset_nanos = interval_nanos - (since_refill.as_nanos() % interval_nanos);
            Decision {
                allowed: false,
                remaining: 0,
                reset_after: Duration::from_nanos(reset_nanos as u64),
            }
        }
    }

    fn cleanup(&self, now: Instant) {
        self.buckets
            .lock()
            .unwrap()
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= IDLE_EXPIRY);
    }

    fn limit(&self) -> u64 {
        self.refill_rate
    }

    fn kind(&self) -> LimitType {
        LimitType::TokenBucket
    }
}

// ---------------------------------------------------------------- fixed window

struct WindowState {
    count: u64,
    window_start: Instant,
    last_seen: Instant,
}

struct FixedWindow {
    max_requests: u64,
    window: Duration,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindow {
    fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl Algorithm for FixedWindow {
    fn check(&self, key: &str, now: Instant) -> Decision {
        let mut windows = self.windows.lock().unwrap();
        let state = windows.entry(key.to_string()).or_insert(WindowState {
            count: 0,
            window_start: now,
            last_seen: now,
        });
        state.last_seen = now;

        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed >= self.window {
            state.count = 0;
            state.window_start = now;
        }
        let elapsed = now.saturating_duration_since(state.window_start);

        if state.count < self.max_requests {
            state.count += 1;
            Decision {
                allowed: true,
                remaining: self.max_requests - state.count,
                reset_after: self.window - elapsed,
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_after: self.window - elapsed,
            }
        }
    }

    fn cleanup(&self, now: Instant) {
        self.windows
            .lock()
            .unwrap()
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= IDLE_EXPIRY);
    }

    fn limit(&self) -> u64 {
        self.max_requests
    }

    fn kind(&self) -> LimitType {
        LimitType::FixedWindow
    }
}

// -------------------------------------------------------------- sliding window

struct SlideState {
    times: VecDeque<Instant>,
    last_seen: Instant,
}

struct SlidingWindow {
    max_requests: u64,
    window: Duration,
    keys: Mutex<HashMap<String, SlideState>>,
}

impl SlidingWindow {
    fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl Algorithm for SlidingWindow {
    fn check(&self, key: &str, now: Instant) -> Decision {
        let mut keys = self.keys.lock().unwrap();
        let state = keys.entry(key.to_string()).or_insert(SlideState {
            times: VecDeque::new(),
            last_seen: now,
        });
        state.last_seen = now;

        while let Some(oldest) = state.times.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                state.times.pop_front();
            } else {
                break;
            }
        }

        if (state.times.len() as u64) < self.max_requests {
            state.times.push_back(now);
            let oldest = *state.times.front().unwrap_or(&now);
            Decision {
                allowed: true,
                remaining: self.max_requests - state.times.len() as u64,
                reset_after: (oldest + self.window).saturating_duration_since(now),
            }
        } else {
            let oldest = *state.times.front().unwrap_or(&now);
            Decision {
                allowed: false,
                remaining: 0,
                reset_after: (oldest + self.window).saturating_duration_since(now),
            }
        }
    }

    fn cleanup(&self, now: Instant) {
        self.keys
            .lock()
            .unwrap()
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= IDLE_EXPIRY);
    }

    fn limit(&self) -> u64 {
        self.max_requests
    }

    fn kind(&self) -> LimitType {
        LimitType::SlidingWindow
    }
}

// ------------------------------------------------------------- key extraction

pub type KeyExtractor = Arc<dyn Fn(&Request) -> String + Send + Sync>;

fn peer_ip(req: &Request) -> String {
    req.remote_addr
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Default: first X-Forwarded-For entry, else X-Real-IP, else the peer address.
pub fn ip_extractor() -> KeyExtractor {
    Arc::new(|req| {
        if let Some(xff) = req.header("x-forwarded-for") {
            if let Some(first) = xff.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real) = req.header("x-real-ip") {
            return real.trim().to_string();
        }
        peer_ip(req)
    })
}

/// X-Api-Key header, falling back to the client IP for anonymous requests.
pub fn api_key_extractor() -> KeyExtractor {
    let ip = ip_extractor();
    Arc::new(move |req| match req.header("x-api-key") {
        Some(key) if !key.is_empty() => format!("key:{}", key),
        _ => ip(req),
    })
}

/// Budget per endpoint path (all clients share it).
pub fn endpoint_extractor() -> KeyExtractor {
    Arc::new(|req| req.path.clone())
}

/// Bearer token from Authorization, falling back to the client IP.
pub fn bearer_extractor() -> KeyExtractor {
    let ip = ip_extractor();
    Arc::new(move |req| {
        if let Some(auth) = req.header("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
                let token = token.trim();
                if !token.is_empty() {
                    return format!("bearer:{}", token);
                }
            }
        }
        ip(req)
    })
}

/// Client IP concatenated with the User-Agent string.
pub fn ip_user_agent_extractor() -> KeyExtractor {
    let ip = ip_extractor();
    Arc::new(move |req| {
        format!("{}|{}", ip(req), req.header("user-agent").unwrap_or(""))
    })
}

fn extractor_for(strategy: &str) -> KeyExtractor {
    match strategy {
        "api_key" => api_key_extractor(),
        "endpoint" => endpoint_extractor(),
        "bearer" => bearer_extractor(),
        "ip_user_agent" => ip_user_agent_extractor(),
        _ => ip_extractor(),
    }
}

// ------------------------------------------------------------------- limiter

struct LimiterInner {
    algorithm: Option<Arc<dyn Algorithm>>,
    extractor: KeyExtractor,
}

/// The rate limiter: holds the active algorithm and the key extractor.
/// `update_config` swaps the algorithm atomically, discarding per-key state.
pub struct RateLimiter {
    inner: RwLock<LimiterInner>,
}

fn build_algorithm(config: &RateLimitConfig) -> Option<Arc<dyn Algorithm>> {
    if !config.enabled {
        return None;
    }
    let window = Duration::from_secs(config.window_duration_seconds.max(1));
    let algorithm: Arc<dyn Algorithm> = match config.strategy.as_str() {
        "fixed_window" => Arc::new(FixedWindow::new(config.max_requests, window)),
        "sliding_window" => Arc::new(SlidingWindow::new(config.max_requests, window)),
        _ => Arc::new(TokenBucket::new(
            config.burst_capacity.max(1),
            config.max_requests,
            window,
        )),
    };
    Some(algorithm)
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            inner: RwLock::new(LimiterInner {
                algorithm: build_algorithm(config),
                extractor: extractor_for(&config.key_strategy),
            }),
        }
    }

    /// A limiter that allows everything.
    pub fn disabled() -> Self {
        Self {
            inner: RwLock::new(LimiterInner {
                algorithm: None,
                extractor: ip_extractor(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().unwrap().algorithm.is_some()
    }

    /// Set a custom key extractor (replaces the configured strategy's).
    pub fn set_key_extractor(&self, extractor: KeyExtractor) {
        self.inner.write().unwrap().extractor = extractor;
    }

    /// Replace algorithm and extractor; in-flight per-key state under the old
    /// algorithm is discarded.
    pub fn update_config(&self, config: &RateLimitConfig) {
        let mut inner = self.inner.write().unwrap();
        inner.algorithm = build_algorithm(config);
        inner.extractor = extractor_for(&config.key_strategy);
    }

    pub fn check_request(&self, req: &Request) -> RateLimitResult {
        self.check_request_at(req, Instant::now())
    }

    fn check_request_at(&self, req: &Request, now: Instant) -> RateLimitResult {
        let inner = self.inner.read().unwrap();
        let algorithm = match &inner.algorithm {
            Some(a) => a.clone(),
            None => {
                return RateLimitResult {
                    allowed: true,
                    remaining: u64::MAX,
                    reset_after: Duration::ZERO,
                    limit_type: LimitType::Disabled,
                    reason: None,
                }
            }
        };
        let key = (inner.extractor)(req);
        drop(inner);

        let decision = algorithm.check(&key, now);
        RateLimitResult {
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_after: decision.reset_after,
            limit_type: algorithm.kind(),
            reason: if decision.allowed {
                None
            } else {
                Some(format!("rate limit exceeded for {}", key))
            },
        }
    }

    /// Current X-RateLimit-Limit value (0 when disabled).
    pub fn limit(&self) -> u64 {
        self.inner
            .read()
            .unwrap()
            .algorithm
            .as_ref()
            .map(|a| a.limit())
            .unwrap_or(0)
    }

    /// Purge keys idle for more than an hour.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        if let Some(algorithm) = self.inner.read().unwrap().algorithm.clone() {
            algorithm.cleanup(now);
        }
    }
}

/// Background cleanup: wake every five minutes (or on shutdown) and purge
/// idle keys. Never holds more than the algorithm's per-call lock.
pub fn spawn_cleanup(
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    limiter.cleanup();
                }
                _ = shutdown.changed() => {
                    tracing::debug!("[ratelimit] cleanup task stopping");
                    return;
                }
            }
        }
    })
}

/// Middleware adapter. On deny: X-RateLimit-* headers plus the custom
/// response or a 429 JSON body, and the pipeline stops. On allow: limit and
/// remaining headers, pipeline continues. Disabled limiter: pass-through.
pub fn middleware(limiter: Arc<RateLimiter>, custom_response: Option<Response>) -> Middleware {
    Arc::new(move |req: &Request, response: &mut Response| {
        if !limiter.is_enabled() {
            return MiddlewareAction::Continue;
        }
        let result = limiter.check_request(req);
        let limit = limiter.limit();
        response.set_header("X-RateLimit-Limit", &limit.to_string());
        response.set_header("X-RateLimit-Remaining", &result.remaining.to_string());
        if result.allowed {
            return MiddlewareAction::Continue;
        }

        let reset_secs = result.reset_after.as_secs_f64().ceil() as u64;
        match &custom_response {
            Some(custom) => {
                let mut replacement = custom.clone();
                replacement.set_header("X-RateLimit-Limit", &limit.to_string());
                replacement.set_header("X-RateLimit-Remaining", "0");
                replacement.set_header("X-RateLimit-Reset", &reset_secs.to_string());
                replacement.set_header("X-RateLimit-Type", result.limit_type.as_str());
                *response = replacement;
            }
            None => {
                response.status = 429;
                response.set_header("X-RateLimit-Reset", &reset_secs.to_string());
                response.set_header("X-RateLimit-Type", result.limit_type.as_str());
                let body = serde_json::json!({
                    "error": "Too Many Requests",
                    "retry_after_seconds": reset_secs,
                });
                response.set_header("Content-Type", "application/json");
                response.set_body(body.to_string().into_bytes());
            }
        }
        tracing::debug!(
            "[ratelimit] denied {} ({})",
            result.reason.as_deref().unwrap_or("?"),
            result.limit_type.as_str()
        );
        MiddlewareAction::Stop
    })
}
