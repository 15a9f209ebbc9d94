use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::PolicyError;
use crate::observability::Observability;

/// Fixed counting window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    reset_at: Instant,
}

/// 按 key 计数的固定窗口限流器。key 通常是工具名。
///
/// The counter map is unbounded in key cardinality; [`RateLimiter::cleanup`]
/// (or [`RateLimiter::spawn_cleanup`]) drops expired entries.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limit: u32,
    counters: RwLock<HashMap<String, Counter>>,
    obs: Observability,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, obs: Observability) -> Self {
        Self {
            enabled: config.enabled,
            limit: config.requests_per_minute,
            counters: RwLock::new(HashMap::new()),
            obs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn allow(&self, key: &str) -> Result<(), PolicyError> {
        self.allow_at(key, Instant::now())
    }

    /// [`RateLimiter::allow`] against an explicit clock.
    pub fn allow_at(&self, key: &str, now: Instant) -> Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }

        let mut counters = self.counters.write();
        let Some(counter) = counters.get_mut(key) else {
            counters.insert(
                key.to_string(),
                Counter {
                    count: 1,
                    reset_at: now + WINDOW,
                },
            );
            return Ok(());
        };

        if now >= counter.reset_at {
            counter.count = 1;
            counter.reset_at = now + WINDOW;
            return Ok(());
        }

        if counter.count >= self.limit {
            self.obs.record_rate_limit_hit();
            debug!(key, limit = self.limit, "rate limit exceeded");
            return Err(PolicyError::RateLimitExceeded);
        }

        counter.count += 1;
        Ok(())
    }

    pub fn remaining(&self, key: &str) -> u32 {
        self.remaining_at(key, Instant::now())
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> u32 {
        let counters = self.counters.read();
        match counters.get(key) {
            Some(c) if now < c.reset_at => self.limit.saturating_sub(c.count),
            _ => self.limit,
        }
    }

    pub fn reset(&self, key: &str) {
        self.counters.write().remove(key);
    }

    /// Drop every counter whose window has ended. Returns how many went away.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, c| now < c.reset_at);
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`RateLimiter::cleanup`] every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = limiter.cleanup();
                        if removed > 0 {
                            debug!(removed, "rate limit counters cleaned up");
                        }
                    }
                }
            }
        })
    }
}
