//! Inbound rate limiting
//!
//! Sliding-window limiter for operator-facing endpoints. The store is a
//! trait so the in-memory window log can be swapped for a shared backend
//! without touching the handlers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::{RateLimitConfig, RateLimitRule};

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Rejected; the caller may retry after this many seconds.
    Limited { retry_after_seconds: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Backing store for rate limit windows.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Records one request under `key` if the rule admits it.
    async fn try_acquire(&self, key: &str, rule: &RateLimitRule, now: DateTime<Utc>) -> Decision;
}

/// Sliding-window store backed by a per-key timestamp log.
///
/// A rejected request is not recorded, so a caller hammering a limited key
/// does not push their own window further out.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn try_acquire(&self, key: &str, rule: &RateLimitRule, now: DateTime<Utc>) -> Decision {
        let window = Duration::seconds(rule.window_seconds as i64);
        let cutoff = now - window;

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let log = windows.entry(key.to_string()).or_default();

        while log.front().is_some_and(|entry| *entry <= cutoff) {
            log.pop_front();
        }

        if log.len() >= rule.max_requests as usize {
            // front() is non-empty here: max_requests is validated >= 1
            let retry_after = log
                .front()
                .map(|oldest| (*oldest + window - now).num_seconds().max(1) as u64)
                .unwrap_or(rule.window_seconds);
            return Decision::Limited {
                retry_after_seconds: retry_after,
            };
        }

        log.push_back(now);
        Decision::Allowed
    }
}

/// Endpoint classes limited independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitClass {
    /// Authorization initiation, strict
    Authorize,
    /// OAuth callbacks, loose
    Callback,
    /// Manual token refresh, moderate
    Refresh,
}

impl RateLimitClass {
    fn prefix(&self) -> &'static str {
        match self {
            RateLimitClass::Authorize => "authorize",
            RateLimitClass::Callback => "callback",
            RateLimitClass::Refresh => "refresh",
        }
    }
}

/// Rate limiter over a shared store, one rule per endpoint class.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Checks `key` against the rule for `class`.
    ///
    /// Keys are namespaced per class, so exhausting the refresh budget never
    /// touches the authorize budget for the same caller.
    pub async fn check(&self, class: RateLimitClass, key: &str, now: DateTime<Utc>) -> Decision {
        let rule = match class {
            RateLimitClass::Authorize => &self.config.authorize,
            RateLimitClass::Callback => &self.config.callback,
            RateLimitClass::Refresh => &self.config.refresh,
        };
        let namespaced = format!("{}:{}", class.prefix(), key);
        self.store.try_acquire(&namespaced, rule, now).await
    }
}

/// Client identity for rate limiting: the authenticated user when known,
/// otherwise the caller's network address from `X-Forwarded-For`.
pub fn rate_limit_key(user_id: Option<Uuid>, headers: &HeaderMap) -> String {
    if let Some(user_id) = user_id {
        return format!("user:{}", user_id);
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());

    match forwarded {
        Some(addr) => format!("addr:{}", addr),
        None => "addr:unknown".to_string(),
    }
}
