//! Circuit breaker guarding the upstream log API.
//!
//! State machine: Closed → Open → HalfOpen
//! - Closed trips to Open once `error_threshold` consecutive failures are recorded
//! - Open moves to HalfOpen on the first `allow()` after `timeout` since the last failure
//! - HalfOpen lets exactly one probe through; its outcome closes or re-opens the circuit

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{PolicyError, Result};
use crate::observability::Observability;
use crate::time::parse_duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Probes allowed in flight while HalfOpen.
const MAX_HALF_OPEN_PROBES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_probes_used: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    half_open_probes_used: u32,
}

impl BreakerState {
    fn transition_to(&mut self, next: CircuitState) {
        self.state = next;
        match next {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => self.half_open_probes_used = 0,
            CircuitState::Open => {}
        }
    }
}

/// One breaker per pipeline. Every transition happens under the single write
/// lock, so "Open → HalfOpen" and "take the probe" are one atomic step.
#[derive(Debug)]
pub struct CircuitBreaker {
    enabled: bool,
    error_threshold: u32,
    timeout: Duration,
    inner: RwLock<BreakerState>,
    obs: Observability,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig, obs: Observability) -> Result<Self> {
        let timeout = match config.timeout.trim() {
            "" => DEFAULT_TIMEOUT,
            s => parse_duration(s)?,
        };
        Ok(Self::with_timeout(
            config.enabled,
            config.error_threshold,
            timeout,
            obs,
        ))
    }

    pub fn with_timeout(
        enabled: bool,
        error_threshold: u32,
        timeout: Duration,
        obs: Observability,
    ) -> Self {
        Self {
            enabled,
            error_threshold,
            timeout,
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                half_open_probes_used: 0,
            }),
            obs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allow(&self) -> std::result::Result<(), PolicyError> {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> std::result::Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure_at
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.timeout);
                if !cooled {
                    return Err(PolicyError::CircuitOpen);
                }
                info!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "circuit breaker timeout elapsed, transitioning to half-open"
                );
                inner.transition_to(CircuitState::HalfOpen);
                // this caller is the probe
                inner.half_open_probes_used = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes_used >= MAX_HALF_OPEN_PROBES {
                    return Err(PolicyError::CircuitOpen);
                }
                inner.half_open_probes_used += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::HalfOpen => {
                info!("half-open probe succeeded, circuit breaker closed");
                inner.transition_to(CircuitState::Closed);
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// The caller gave up before the upstream answered. Nothing is learned
    /// about upstream health; a half-open slot is handed back for the next call.
    pub fn record_abandoned(&self) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_probes_used = inner.half_open_probes_used.saturating_sub(1);
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.write();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.error_threshold => {
                warn!(
                    failures = inner.failure_count,
                    threshold = self.error_threshold,
                    "circuit breaker tripped, transitioning to open"
                );
                inner.transition_to(CircuitState::Open);
                self.obs.record_circuit_breaker_trip();
            }
            CircuitState::HalfOpen => {
                warn!("half-open probe failed, circuit breaker re-opened");
                inner.transition_to(CircuitState::Open);
                self.obs.record_circuit_breaker_trip();
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn state_str(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_probes_used: inner.half_open_probes_used,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.transition_to(CircuitState::Closed);
        inner.half_open_probes_used = 0;
        inner.last_failure_at = None;
    }
}
