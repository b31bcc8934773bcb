//! Per-node circuit breakers.
//!
//! A node that keeps timing out or refusing connections slows every
//! operation down to the call timeout. With circuits enabled, such a node is
//! short-circuited: its calls are recorded as
//! `TransportFailure(CircuitOpen)` without touching the wire until the
//! recovery timeout passes. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Node unhealthy, calls fail fast
//! - **HalfOpen**: Probing whether the node recovered
//!
//! Only transport failures count against a node. A node answering with an
//! application error is reachable and healthy from the circuit's point of view.

use crate::metrics;
use crate::node::NodeId;
use crate::transport::{NodeResult, TransportFailureReason};
use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the observation window; trips once half of it failed.
    pub failure_threshold: u32,
    /// Number of half-open calls observed before deciding to close.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    /// Set by a rejection, cleared once a call passes again
    open: AtomicBool,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.open.store(false, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.open.store(true, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Whether the last decided call was rejected.
    ///
    /// Follows the most recent call only: a successful call after recovery
    /// clears it whatever the lifetime counts are. A failing call leaves it
    /// as it was, since a failed half-open call reopens the circuit.
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// One circuit breaker per node, created on first use.
pub struct NodeCircuits {
    config: CircuitConfig,
    breakers: DashMap<NodeId, Arc<CircuitBreaker>>,
}

impl NodeCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, node_id: &NodeId) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(format!("node:{node_id}"), &self.config)))
            .clone()
    }

    /// Run a node call through the node's circuit.
    ///
    /// Transport failures count as circuit failures; node answers of any
    /// status count as successes. A rejected call becomes
    /// `TransportFailure(CircuitOpen)`.
    pub async fn call<F>(&self, node_id: &NodeId, call: F) -> NodeResult
    where
        F: Future<Output = NodeResult>,
    {
        let breaker = self.breaker(node_id);
        let outcome = breaker
            .call(|| async move {
                let result = call.await;
                if result.is_node_answer() {
                    Ok(result)
                } else {
                    Err(result)
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitError::Inner(result)) => result,
            Err(CircuitError::Rejected) => {
                metrics::record_circuit_rejection(node_id.as_str());
                NodeResult::TransportFailure(TransportFailureReason::CircuitOpen)
            }
        }
    }

    /// Whether the node's circuit currently looks open.
    pub fn is_open(&self, node_id: &NodeId) -> bool {
        self.breakers
            .get(node_id)
            .map(|b| b.is_likely_open())
            .unwrap_or(false)
    }

    /// Breaker of a node, if it was ever used.
    pub fn get(&self, node_id: &NodeId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(node_id).map(|b| Arc::clone(b.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    fn refused() -> NodeResult {
        NodeResult::TransportFailure(TransportFailureReason::ConnectionRefused)
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", &test_config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", &test_config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_node_circuit_opens_on_transport_failures() {
        let circuits = NodeCircuits::new(test_config());
        let node = NodeId::from("node-3");

        let mut rejected = 0;
        for _ in 0..6 {
            let result = circuits.call(&node, async { refused() }).await;
            if result.failure_reason() == Some(TransportFailureReason::CircuitOpen) {
                rejected += 1;
            }
        }

        assert!(rejected >= 1, "circuit should reject once tripped");
        assert!(circuits.is_open(&node));
        assert!(!circuits.is_open(&NodeId::from("node-1")));
    }

    #[tokio::test]
    async fn test_recovered_circuit_no_longer_open() {
        let config = CircuitConfig {
            recovery_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let circuits = NodeCircuits::new(config);
        let node = NodeId::from("node-3");

        // Trips once the two-call window is full and still failing
        for _ in 0..3 {
            circuits.call(&node, async { refused() }).await;
        }
        // Outnumber the later successes with rejections
        for _ in 0..4 {
            let result = circuits.call(&node, async { refused() }).await;
            assert_eq!(result.failure_reason(), Some(TransportFailureReason::CircuitOpen));
        }
        assert!(circuits.is_open(&node));

        // recloser measures its open wait on the wall clock
        tokio::time::sleep(Duration::from_millis(120)).await;
        let result = circuits
            .call(&node, async {
                NodeResult::Success {
                    status: 200,
                    payload: Bytes::new(),
                }
            })
            .await;
        assert!(result.is_success());

        let breaker = circuits.get(&node).unwrap();
        assert!(breaker.rejections() > breaker.successes());
        assert!(!circuits.is_open(&node));
    }

    #[tokio::test]
    async fn test_application_errors_do_not_trip() {
        let circuits = NodeCircuits::new(test_config());
        let node = NodeId::from("node-2");

        for _ in 0..6 {
            let result = circuits
                .call(&node, async {
                    NodeResult::ApplicationError {
                        status: 409,
                        payload: Bytes::new(),
                    }
                })
                .await;
            assert!(matches!(result, NodeResult::ApplicationError { status: 409, .. }));
        }

        let breaker = circuits.get(&node).unwrap();
        assert_eq!(breaker.rejections(), 0);
        assert_eq!(breaker.successes(), 6);
        assert!(!circuits.is_open(&node));
    }

    #[tokio::test]
    async fn test_breakers_are_per_node() {
        let circuits = NodeCircuits::new(test_config());
        let bad = NodeId::from("bad");
        let good = NodeId::from("good");

        for _ in 0..6 {
            circuits.call(&bad, async { refused() }).await;
        }
        let result = circuits
            .call(&good, async {
                NodeResult::Success {
                    status: 200,
                    payload: Bytes::new(),
                }
            })
            .await;
        assert!(result.is_success());
        assert_eq!(circuits.get(&good).unwrap().name(), "node:good");
    }

    #[test]
    fn test_circuit_error_is_rejected() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert!(rejected.is_rejected());
        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(!inner.is_rejected());
    }
}
