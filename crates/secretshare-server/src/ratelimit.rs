//! Fixed-window admission control.
//!
//! Counters live behind the [`HitStore`] trait. The bundled
//! [`MemoryHitStore`] keeps them in process memory: a restart clears every
//! window and several server instances do not share counts. Deployments
//! running more than one instance need a shared `HitStore`.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::SecretError;

/// Key used for every client whose address cannot be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    CreateSecret,
    AccessSecret,
    Auth,
    Api,
}

impl OperationClass {
    pub const ALL: [OperationClass; 4] = [
        Self::CreateSecret,
        Self::AccessSecret,
        Self::Auth,
        Self::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSecret => "create_secret",
            Self::AccessSecret => "access_secret",
            Self::Auth => "auth",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub window: Duration,
    pub max_requests: u32,
}

impl Policy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policies {
    pub create_secret: Policy,
    pub access_secret: Policy,
    pub auth: Policy,
    pub api: Policy,
    /// Per-user budget for authenticated mutations.
    pub user: Policy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            create_secret: Policy::new(5, Duration::minutes(1)),
            access_secret: Policy::new(20, Duration::minutes(1)),
            auth: Policy::new(10, Duration::minutes(15)),
            api: Policy::new(100, Duration::minutes(15)),
            user: Policy::new(50, Duration::hours(1)),
        }
    }
}

impl Policies {
    pub fn get(&self, class: OperationClass) -> Policy {
        match class {
            OperationClass::CreateSecret => self.create_secret,
            OperationClass::AccessSecret => self.access_secret,
            OperationClass::Auth => self.auth,
            OperationClass::Api => self.api,
        }
    }
}

/// Counter state after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hits {
    pub total_hits: u32,
    pub time_until_reset: Duration,
}

#[async_trait]
pub trait HitStore: Send + Sync {
    /// Count one hit against `key`, opening a new window if none is running.
    async fn increment(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<Hits>;

    /// Current window for `key` without counting a hit.
    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Hits>>;

    /// Undo one hit. The entry disappears when its count reaches zero.
    async fn decrement(&self, key: &str) -> Result<()>;

    async fn reset_key(&self, key: &str) -> Result<()>;

    /// Drop windows that have ended. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// In-memory counters. Each key is updated under its shard lock, so hits on
/// one key never get lost and different keys never contend.
#[derive(Debug, Default)]
pub struct MemoryHitStore {
    hits: DashMap<String, Window>,
}

impl MemoryHitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

#[async_trait]
impl HitStore for MemoryHitStore {
    async fn increment(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<Hits> {
        let reset_at = now
            .checked_add_signed(window)
            .ok_or_else(|| anyhow::anyhow!("rate limit window of {window} overflows"))?;
        let mut entry = self.hits.entry(key.to_owned()).or_insert(Window {
            count: 0,
            reset_at,
        });
        if entry.count == 0 || now >= entry.reset_at {
            entry.count = 1;
            entry.reset_at = reset_at;
        } else {
            entry.count = entry.count.saturating_add(1);
        }
        Ok(Hits {
            total_hits: entry.count,
            time_until_reset: entry.reset_at - now,
        })
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Hits>> {
        Ok(self
            .hits
            .get(key)
            .filter(|w| now < w.reset_at)
            .map(|w| Hits {
                total_hits: w.count,
                time_until_reset: w.reset_at - now,
            }))
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        self.hits.remove_if_mut(key, |_, w| {
            w.count = w.count.saturating_sub(1);
            w.count == 0
        });
        Ok(())
    }

    async fn reset_key(&self, key: &str) -> Result<()> {
        self.hits.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.hits.len();
        self.hits.retain(|_, w| now < w.reset_at);
        Ok(before.saturating_sub(self.hits.len()))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: Option<u64>,
    pub reset_at: DateTime<Utc>,
}

impl Admission {
    fn open(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            retry_after_secs: None,
            reset_at: now,
        }
    }

    pub fn into_result(self) -> Result<Self, SecretError> {
        if self.allowed {
            return Ok(self);
        }
        Err(SecretError::RateLimited {
            retry_after_secs: self.retry_after_secs.unwrap_or(1),
            limit: self.limit,
            remaining: self.remaining,
            reset_at: self.reset_at,
        })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn HitStore>,
    policies: Policies,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn HitStore>, policies: Policies, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policies,
            clock,
        }
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    /// Count a request from `client_key` against `class` and decide whether to admit it.
    /// A failing hit store admits the request.
    pub async fn check_admission(&self, class: OperationClass, client_key: &str) -> Admission {
        let policy = self.policies.get(class);
        let key = format!("{class}:{client_key}");
        self.admit(&key, policy).await
    }

    /// Separate budget keyed by authenticated user and action.
    pub async fn check_user_rate_limit(
        &self,
        user_id: &str,
        action: &str,
        policy: Policy,
    ) -> Admission {
        let key = format!("user:{user_id}:{action}");
        self.admit(&key, policy).await
    }

    /// True if `client_key` has already spent its budget for `class`. Does not count a hit.
    pub async fn is_blocked(&self, class: OperationClass, client_key: &str) -> bool {
        let policy = self.policies.get(class);
        let key = format!("{class}:{client_key}");
        match self.store.peek(&key, self.clock.now()).await {
            Ok(Some(hits)) => hits.total_hits >= policy.max_requests,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, key = %key, "rate limit store error");
                false
            }
        }
    }

    pub async fn reset(&self, class: OperationClass, client_key: &str) {
        let key = format!("{class}:{client_key}");
        if let Err(e) = self.store.reset_key(&key).await {
            warn!(error = %e, key = %key, "rate limit store error");
        }
    }

    async fn admit(&self, key: &str, policy: Policy) -> Admission {
        let now = self.clock.now();
        let hits = match self.store.increment(key, policy.window, now).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, key = %key, "rate limit store error; admitting request");
                return Admission::open(policy.max_requests, now);
            }
        };

        let allowed = hits.total_hits <= policy.max_requests;
        let until_reset_ms = hits.time_until_reset.num_milliseconds().max(0) as u64;
        let admission = Admission {
            allowed,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(hits.total_hits),
            retry_after_secs: (!allowed).then(|| until_reset_ms.div_ceil(1000).max(1)),
            reset_at: now + hits.time_until_reset,
        };
        if !allowed {
            debug!(key = %key, hits = hits.total_hits, limit = policy.max_requests, "rate limited");
        }
        admission
    }

    /// Spawn a background task that drops finished windows every `interval`.
    pub fn spawn_cleanup(self, interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                match self.store.purge_expired(self.clock.now()).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "purged finished rate limit windows"),
                    Err(e) => warn!(error = %e, "rate limit cleanup error"),
                }
            }
        });
    }
}

/// Resolve the identity used for IP-based limits: first `X-Forwarded-For`
/// entry, then `X-Real-IP`, then `CF-Connecting-IP`. Clients with none of
/// these share the [`UNKNOWN_CLIENT`] bucket.
pub fn client_key(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    for name in ["x-real-ip", "cf-connecting-ip"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    UNKNOWN_CLIENT.to_owned()
}
