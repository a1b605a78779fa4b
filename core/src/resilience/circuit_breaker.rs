use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            open_timeout: Duration::from_secs(config.open_timeout_secs),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit `{name}` is open")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure-isolation state machine for one destination.
///
/// Callers take a [`BreakerPermit`] before talking to the destination and
/// report the outcome through it. A permit dropped without an outcome only
/// releases the half-open trial slot.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: Option<broadcast::Sender<BreakerTransition>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::with_transitions(name, settings, None)
    }

    fn with_transitions(
        name: impl Into<String>,
        settings: BreakerSettings,
        transitions: Option<broadcast::Sender<BreakerTransition>>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            consecutive_successes: inner.successes,
        }
    }

    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, CircuitOpen> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| Instant::now().saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed < self.settings.open_timeout {
                    return Err(self.open_error());
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.successes = 0;
                inner.trial_in_flight = true;
                return Ok(BreakerPermit::new(self, true));
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                return Ok(BreakerPermit::new(self, true));
            }
        }
        Ok(BreakerPermit::new(self, false))
    }

    /// Runs `f` under the breaker. Every `Err` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.settings.success_threshold {
                    inner.failures = 0;
                    inner.successes = 0;
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late.
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.settings.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.successes = 0;
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if let Some(tx) = &self.transitions {
            let _ = tx.send(BreakerTransition {
                name: self.name.clone(),
                from,
                to,
            });
        }
    }

    fn open_error(&self) -> CircuitOpen {
        CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[must_use = "report the outcome with succeed() or fail()"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Process-wide set of breakers keyed by destination host.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(destination.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_transitions(
                destination,
                self.settings,
                Some(self.transitions.clone()),
            ))
        }))
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Logs every state transition until `shutdown` fires.
    pub fn spawn_monitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(BreakerTransition { name, from, to }) => match to {
                            BreakerState::Open => {
                                warn!(breaker = %name, %from, %to, "circuit opened");
                            }
                            _ => info!(breaker = %name, %from, %to, "circuit state changed"),
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "breaker monitor lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("rag:8080", settings());
        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let mut invoked = false;
        let result = breaker
            .call(|| {
                invoked = true;
                async { Ok::<(), &'static str>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert!(!invoked, "open circuit must not run the call");
    }

    #[tokio::test]
    async fn success_while_closed_resets_failures() {
        let breaker = CircuitBreaker::new("svc", settings());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.expect("success");
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open(_))));

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&breaker).await.expect("trial call admitted");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.expect("second success");
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_half_open_reopens() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::new("svc", settings());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = breaker.try_acquire().expect("trial");
        assert!(breaker.try_acquire().is_err());
        drop(trial);
        let retry = breaker.try_acquire().expect("slot released on drop");
        retry.succeed();
    }

    #[tokio::test]
    async fn registry_reuses_breakers_and_reports_transitions() {
        let registry = CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            ..settings()
        });
        let mut rx = registry.subscribe();
        let a = registry.get("session-service:8080");
        let b = registry.get("session-service:8080");
        assert!(Arc::ptr_eq(&a, &b));

        let _ = fail(&a).await;
        let event = rx.recv().await.expect("transition");
        assert_eq!(
            event,
            BreakerTransition {
                name: "session-service:8080".to_string(),
                from: BreakerState::Closed,
                to: BreakerState::Open,
            }
        );
        assert_eq!(registry.snapshot().len(), 1);
    }
}
