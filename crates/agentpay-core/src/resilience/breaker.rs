//! Distributed circuit breaker.
//!
//! State lives in the storage abstraction under `circuit:{service}`, and
//! every transition happens inside one atomic read-modify-write, so the
//! breaker is race-free across processes sharing a backend.

use std::{sync::Arc, time::Duration};

use agentpay_store::Store;
use chrono::Utc;

use crate::error::Error;

/// Breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    /// Healthy; calls pass.
    Closed,
    /// Gated; calls are rejected until the recovery timeout passes.
    Open,
    /// Recovering; exactly one probe call is admitted.
    HalfOpen,
}

/// Persisted breaker state for one service.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CircuitState {
    phase: CircuitPhase,
    failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_failure_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery_at: Option<i64>,
    probing: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failure_count: 0,
            last_failure_at: None,
            recovery_at: None,
            probing: false,
        }
    }
}

/// Breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub recovery_timeout: Duration,
    /// Rolling window failures must land in to count together.
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

fn state_key(service: &str) -> String {
    format!("circuit:{service}")
}

/// Three-state health gate, one state record per service name.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    config: BreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with default tunables.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, BreakerConfig::default())
    }

    /// Creates a breaker with explicit tunables.
    pub fn with_config(store: Arc<dyn Store>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    async fn transition<F>(&self, service: &str, mut apply: F) -> Result<CircuitState, Error>
    where
        F: FnMut(CircuitState, i64) -> CircuitState + Send,
    {
        let key = state_key(service);
        let updated = self
            .store
            .update(&key, &mut |current| {
                let state: CircuitState = current
                    .and_then(|json| serde_json::from_str(json).ok())
                    .unwrap_or_default();
                let next = apply(state, Utc::now().timestamp());
                serde_json::to_string(&next).ok()
            })
            .await?;
        let json = updated.ok_or_else(|| {
            Error::Storage(agentpay_store::StoreError::Backend(format!(
                "circuit state write failed for {service}"
            )))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            Error::Storage(agentpay_store::StoreError::Corrupt { key, reason: e.to_string() })
        })
    }

    /// Ask to place one call through the breaker.
    ///
    /// Returns `circuit_open` without touching the protected service when
    /// the breaker is gating it. In half-open, exactly one caller wins the
    /// probe slot.
    pub async fn try_acquire(&self, service: &str) -> Result<(), Error> {
        let state = self
            .transition(service, |mut state, now| {
                match state.phase {
                    CircuitPhase::Closed => {}
                    CircuitPhase::Open => {
                        if state.recovery_at.is_some_and(|at| now >= at) {
                            state.phase = CircuitPhase::HalfOpen;
                            state.probing = true;
                        }
                    }
                    CircuitPhase::HalfOpen => {
                        if !state.probing {
                            state.probing = true;
                        }
                    }
                }
                state
            })
            .await?;
        match state.phase {
            CircuitPhase::Closed => Ok(()),
            CircuitPhase::Open => Err(Error::CircuitOpen(service.to_owned())),
            CircuitPhase::HalfOpen => {
                // Only the transition that set `probing` owns the probe;
                // competing callers see it already set.
                if self.probe_claimed(service).await? {
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(service.to_owned()))
                }
            }
        }
    }

    /// Claim the half-open probe slot for this caller.
    async fn probe_claimed(&self, service: &str) -> Result<bool, Error> {
        // The probe slot is a short-lived lock so concurrent half-open
        // callers race on an atomic primitive, not on the state JSON.
        let key = format!("circuit:{service}:probe");
        Ok(self.store.acquire_lock(&key, "probe", self.config.recovery_timeout).await?)
    }

    async fn release_probe(&self, service: &str) {
        let key = format!("circuit:{service}:probe");
        let _ = self.store.release_lock(&key, "probe").await;
    }

    /// Record a successful call.
    pub async fn record_success(&self, service: &str) -> Result<(), Error> {
        let state = self
            .transition(service, |mut state, _now| {
                match state.phase {
                    CircuitPhase::Closed => {
                        state.failure_count = state.failure_count.saturating_sub(1);
                    }
                    CircuitPhase::HalfOpen => {
                        state.phase = CircuitPhase::Closed;
                        state.failure_count = 0;
                        state.recovery_at = None;
                        state.probing = false;
                    }
                    CircuitPhase::Open => {}
                }
                state
            })
            .await?;
        if state.phase == CircuitPhase::Closed {
            self.release_probe(service).await;
        }
        Ok(())
    }

    /// Record a failed call.
    pub async fn record_failure(&self, service: &str) -> Result<(), Error> {
        let threshold = self.config.failure_threshold;
        let window = self.config.window.as_secs() as i64;
        let recovery = self.config.recovery_timeout.as_secs() as i64;
        let state = self
            .transition(service, |mut state, now| {
                match state.phase {
                    CircuitPhase::Closed => {
                        let in_window =
                            state.last_failure_at.is_some_and(|at| now - at <= window);
                        state.failure_count = if in_window { state.failure_count + 1 } else { 1 };
                        state.last_failure_at = Some(now);
                        if state.failure_count >= threshold {
                            state.phase = CircuitPhase::Open;
                            state.recovery_at = Some(now + recovery);
                        }
                    }
                    CircuitPhase::HalfOpen => {
                        state.phase = CircuitPhase::Open;
                        state.recovery_at = Some(now + recovery);
                        state.last_failure_at = Some(now);
                        state.probing = false;
                    }
                    CircuitPhase::Open => {
                        state.last_failure_at = Some(now);
                    }
                }
                state
            })
            .await?;
        if state.phase == CircuitPhase::Open {
            tracing::warn!(service, "circuit opened");
            self.release_probe(service).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agentpay_store::MemoryStore;

    use super::*;

    fn quick() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn trips_at_threshold() -> Result<(), Box<dyn std::error::Error>> {
        let breaker = CircuitBreaker::with_config(Arc::new(MemoryStore::new()), quick());
        for _ in 0..3 {
            breaker.try_acquire("custody").await?;
            breaker.record_failure("custody").await?;
        }
        let err = breaker.try_acquire("custody").await.err().ok_or("expected open")?;
        assert_eq!(err.kind(), "circuit_open");
        Ok(())
    }

    #[tokio::test]
    async fn success_decrements_failures() -> Result<(), Box<dyn std::error::Error>> {
        let breaker = CircuitBreaker::with_config(Arc::new(MemoryStore::new()), quick());
        breaker.record_failure("custody").await?;
        breaker.record_failure("custody").await?;
        breaker.record_success("custody").await?;
        // Two failures minus one success leaves headroom for one more.
        breaker.record_failure("custody").await?;
        breaker.try_acquire("custody").await?;
        Ok(())
    }

    #[tokio::test]
    async fn recovers_through_half_open_probe() -> Result<(), Box<dyn std::error::Error>> {
        let breaker = CircuitBreaker::with_config(Arc::new(MemoryStore::new()), quick());
        for _ in 0..3 {
            breaker.record_failure("custody").await?;
        }
        assert!(breaker.try_acquire("custody").await.is_err());
        tokio::time::sleep(Duration::from_millis(75)).await;
        // One probe is admitted, a second concurrent caller is not.
        breaker.try_acquire("custody").await?;
        assert!(breaker.try_acquire("custody").await.is_err());
        breaker.record_success("custody").await?;
        breaker.try_acquire("custody").await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_probe_reopens() -> Result<(), Box<dyn std::error::Error>> {
        let breaker = CircuitBreaker::with_config(Arc::new(MemoryStore::new()), quick());
        for _ in 0..3 {
            breaker.record_failure("custody").await?;
        }
        tokio::time::sleep(Duration::from_millis(75)).await;
        breaker.try_acquire("custody").await?;
        breaker.record_failure("custody").await?;
        let err = breaker.try_acquire("custody").await.err().ok_or("expected open")?;
        assert_eq!(err.kind(), "circuit_open");
        Ok(())
    }

    #[tokio::test]
    async fn services_are_independent() -> Result<(), Box<dyn std::error::Error>> {
        let breaker = CircuitBreaker::with_config(Arc::new(MemoryStore::new()), quick());
        for _ in 0..3 {
            breaker.record_failure("http402").await?;
        }
        assert!(breaker.try_acquire("http402").await.is_err());
        breaker.try_acquire("custody").await?;
        Ok(())
    }
}
