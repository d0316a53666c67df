//! Fixed-window rate limiting.
//!
//! Each route class (search, call, registry) gets a named limiter with an
//! isolated keyspace and its own budget. Windows live in a process-local
//! concurrent map: per-key admission is atomic under the map's entry
//! lock, different keys proceed in parallel, and a restart clears all
//! state. This is a soft control against accidental hammering, not a
//! security boundary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use http::HeaderMap;

use crate::catalog::now_millis;
use crate::config::RateBudget;
use crate::error::ApiError;

/// One per-key counter window.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at_ms: u64,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// The window's budget.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the current window resets, epoch milliseconds.
    pub reset_at_ms: u64,
}

impl Decision {
    /// Whole seconds until the window resets, rounded up; what goes into
    /// `Retry-After`.
    #[must_use]
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// A named fixed-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    budget: RateBudget,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    /// Creates a limiter with the given budget.
    #[must_use]
    pub fn new(name: &'static str, budget: RateBudget) -> Self {
        Self {
            name,
            budget,
            windows: DashMap::new(),
        }
    }

    /// The limiter's route-class name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Admits or rejects one request for `key` at time `now_ms`.
    ///
    /// First request for a key — or any request after the window elapsed —
    /// resets the counter to 1 and opens a fresh window. The
    /// read-modify-write runs under the map's entry lock, so concurrent
    /// requests for one key cannot interleave.
    pub fn admit(&self, key: &str, now_ms: u64) -> Decision {
        let window_ms = self.budget.window_secs * 1000;
        let mut entry = self
            .windows
            .entry(key.to_owned())
            .or_insert(RateWindow {
                count: 0,
                reset_at_ms: now_ms + window_ms,
            });

        if entry.reset_at_ms <= now_ms {
            entry.count = 0;
            entry.reset_at_ms = now_ms + window_ms;
        }
        entry.count += 1;

        let allowed = entry.count <= self.budget.max_requests;
        Decision {
            allowed,
            limit: self.budget.max_requests,
            remaining: self.budget.max_requests.saturating_sub(entry.count),
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// Removes windows that have already elapsed, bounding memory to the
    /// number of distinct keys active within one window.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at_ms > now_ms);
        before - self.windows.len()
    }

    /// Number of live windows, for maintenance logging.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no windows are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Derives the rate key for a request.
///
/// Prefers the caller's API key, truncated to its 12-character prefix so
/// the raw secret is never retained in the window map. Falls back to the
/// client network address (`x-forwarded-for` first hop, then `x-real-ip`,
/// then the socket address).
#[must_use]
pub fn rate_key(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(key) = headers.get("X-Stoa-Key").and_then(|v| v.to_str().ok()) {
        let prefix: String = key.chars().take(12).collect();
        return format!("key:{prefix}");
    }

    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
        .or_else(|| remote.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_owned());
    format!("ip:{ip}")
}

/// Axum middleware enforcing one limiter on a route group.
///
/// Every response gets `X-RateLimit-Limit` and `X-RateLimit-Remaining`;
/// rejections are `429` with `Retry-After`.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let key = rate_key(request.headers(), remote);
    let now_ms = now_millis();
    let decision = limiter.admit(&key, now_ms);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        let retry_after_secs = decision.retry_after_secs(now_ms);
        tracing::debug!(
            limiter = limiter.name(),
            key = %key,
            retry_after_secs,
            "rate limit exceeded"
        );
        ApiError::RateLimited {
            retry_after_secs,
            limit: decision.limit,
        }
        .into_response()
    };

    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    response
}

/// Periodically sweeps expired windows from all limiters until cancelled.
pub async fn sweep_loop(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = now_millis();
                for limiter in &limiters {
                    let removed = limiter.sweep(now_ms);
                    if removed > 0 {
                        tracing::debug!(
                            limiter = limiter.name(),
                            removed,
                            live = limiter.len(),
                            "swept expired rate windows"
                        );
                    }
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}
