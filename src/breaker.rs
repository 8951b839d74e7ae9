//! Per-tool circuit breakers.
//!
//! A breaker counts invoke-stage failures in a sliding window. Once the
//! count reaches the threshold the circuit opens and calls are rejected
//! without touching the handler. After the cooldown a single probe is let
//! through: success closes the circuit, failure re-opens it.
//!
//! Breaker state is shared by every task that calls the same tool, so all
//! mutation happens under one mutex per breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation
    Closed,
    /// Rejecting calls until the cooldown elapses
    Open,
    /// One probe call admitted to test recovery
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one breaker, for API responses and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    pub tool: String,
    pub state: BreakerState,
    /// Failures currently inside the window
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Permission to call the handler, returned by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open probe
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at_wall: Option<DateTime<Utc>>,
}

/// Failure-isolation state machine for one tool.
#[derive(Debug)]
pub struct CircuitBreaker {
    tool: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(tool: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            tool: tool.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                last_failure_at: None,
                opened_at_wall: None,
            }),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Ask to call the handler.
    ///
    /// # Errors
    /// Returns the time left until a probe may be admitted when the circuit
    /// is open, or when a half-open probe is already in flight.
    pub async fn try_acquire(&self) -> Result<Admission, Duration> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(tool = %self.tool, "Circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    // The probe settles the circuit; check back after a full cooldown
                    Err(self.config.cooldown)
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful call made under `admission`.
    ///
    /// Only the half-open probe closes the circuit. A `Normal` call that
    /// was admitted before the trip and finishes late leaves an Open or
    /// HalfOpen circuit as it is.
    pub async fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock().await;
        let state = inner.state;
        match (admission, state) {
            (Admission::Probe, BreakerState::HalfOpen) => {
                tracing::info!(tool = %self.tool, "Circuit closed after successful probe");
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.probe_in_flight = false;
            }
            (Admission::Normal, BreakerState::Closed) => inner.failures.clear(),
            _ => {}
        }
    }

    /// Record a failed call made under `admission`.
    ///
    /// Only the half-open probe re-opens the circuit; late `Normal`
    /// failures count only while Closed.
    pub async fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.last_failure_at = Some(Utc::now());

        let state = inner.state;
        match (admission, state) {
            (Admission::Probe, BreakerState::HalfOpen) => {
                inner.probe_in_flight = false;
                Self::open(&mut inner, now);
                tracing::warn!(tool = %self.tool, "Probe failed, circuit re-opened");
            }
            (Admission::Normal, BreakerState::Closed) => {
                inner.failures.push_back(now);
                self.evict_expired(&mut inner, now);
                let failures = inner.failures.len() as u32;
                if failures >= self.config.failure_threshold {
                    Self::open(&mut inner, now);
                    tracing::warn!(
                        tool = %self.tool,
                        failures,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Circuit breaker tripped"
                    );
                }
            }
            // A call admitted before the trip finished late
            _ => {}
        }
    }

    /// Current state, with Open reported as-is even if the cooldown elapsed.
    pub async fn snapshot(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        self.evict_expired(&mut inner, now);
        CircuitBreakerState {
            tool: self.tool.clone(),
            state: inner.state,
            failure_count: inner.failures.len() as u32,
            last_failure_at: inner.last_failure_at,
            opened_at: inner.opened_at_wall,
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    fn open(inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.opened_at_wall = Some(Utc::now());
    }

    fn evict_expired(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.failures.front() {
            if now.saturating_duration_since(*front) > self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Breakers keyed by tool name, created on first use.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    config: BreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get the breaker for `tool`, creating a closed one if needed.
    pub async fn breaker_for(&self, tool: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(tool) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(tool, self.config.clone())))
            .clone()
    }

    /// Snapshot every breaker, sorted by tool name.
    pub async fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            states.push(breaker.snapshot().await);
        }
        states.sort_by(|a, b| a.tool.cmp(&b.tool));
        states
    }
}
