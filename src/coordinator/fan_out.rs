//! Parallel per-node dispatch of one phase.
//!
//! Every target gets its own task on a [`JoinSet`]. A task waits for a
//! bulkhead slot (bounded in-flight calls per operation) and a rate limiter
//! token, then runs exactly one transport attempt under the per-call
//! timeout, through the node's circuit when circuits are on.
//!
//! The collecting loop stops at the phase deadline. Tasks still running
//! then are aborted and drained, so their futures (and any open upload
//! readers) are dropped before the phase returns. Their nodes come back as
//! `unresolved`; what that means is the phase coordinator's call.

use crate::circuit_breaker::NodeCircuits;
use crate::metrics;
use crate::node::{NodeId, NodeTarget};
use crate::resilience::{Bulkhead, RateLimiter};
use crate::transport::{NodeCall, NodeResult, NodeTransport, TransportFailureReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Results of one phase broadcast.
#[derive(Debug, Default)]
pub struct PhaseOutcome {
    /// Results in arrival order.
    pub results: Vec<(NodeId, NodeResult)>,
    /// Targets without a result (deadline hit, or task lost).
    pub unresolved: Vec<NodeId>,
    pub deadline_hit: bool,
}

/// Dispatches phase calls to many nodes at once.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn NodeTransport>,
    circuits: Option<Arc<NodeCircuits>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    call_timeout: Duration,
    max_concurrent: usize,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn NodeTransport>, call_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            transport,
            circuits: None,
            rate_limiter: None,
            call_timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn with_circuits(mut self, circuits: Arc<NodeCircuits>) -> Self {
        self.circuits = Some(circuits);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn circuits(&self) -> Option<&Arc<NodeCircuits>> {
        self.circuits.as_ref()
    }

    /// Send `call` to every target and wait for all results or `deadline`.
    pub async fn broadcast(&self, targets: &[NodeTarget], call: NodeCall, deadline: Instant) -> PhaseOutcome {
        if targets.is_empty() {
            return PhaseOutcome::default();
        }

        let call = Arc::new(call);
        let bulkhead = Bulkhead::new(self.max_concurrent);
        let mut tasks = JoinSet::new();

        for target in targets {
            let target = target.clone();
            let call = Arc::clone(&call);
            let dispatcher = self.clone();
            let bulkhead = bulkhead.clone();

            tasks.spawn(async move {
                let result = dispatcher.call_node(&target, &call, &bulkhead).await;
                (target.id, result)
            });
        }

        let mut outcome = PhaseOutcome {
            results: Vec::with_capacity(targets.len()),
            ..Default::default()
        };

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((node_id, result)))) => outcome.results.push((node_id, result)),
                Ok(Some(Err(e))) => {
                    warn!(operation_id = %call.operation_id, error = %e, "Node call task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    outcome.deadline_hit = true;
                    debug!(
                        operation_id = %call.operation_id,
                        phase = call.kind.wire_name(),
                        pending = tasks.len(),
                        "Phase deadline reached, abandoning pending calls"
                    );
                    tasks.abort_all();
                    // Drop the aborted futures before returning
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        outcome.unresolved = targets
            .iter()
            .filter(|t| !outcome.results.iter().any(|(id, _)| *id == t.id))
            .map(|t| t.id.clone())
            .collect();
        outcome
    }

    async fn call_node(&self, target: &NodeTarget, call: &NodeCall, bulkhead: &Bulkhead) -> NodeResult {
        let _permit = match bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(node_id = %target.id, error = %e, "No dispatch slot, node not called");
                return NodeResult::TransportFailure(TransportFailureReason::ConnectionRefused);
            }
        };
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let started = Instant::now();
        let attempt = async {
            tokio::time::timeout(self.call_timeout, self.transport.call(target, call))
                .await
                .unwrap_or_else(|_| NodeResult::timeout())
        };
        let result = match &self.circuits {
            Some(circuits) => circuits.call(&target.id, attempt).await,
            None => attempt.await,
        };
        let latency = started.elapsed();

        metrics::record_node_call(target.id.as_str(), call.kind.wire_name(), result.outcome_label(), latency);
        if result.is_success() {
            debug!(
                node_id = %target.id,
                phase = call.kind.wire_name(),
                latency_ms = latency.as_millis() as u64,
                "Node call succeeded"
            );
        } else {
            warn!(
                operation_id = %call.operation_id,
                node_id = %target.id,
                phase = call.kind.wire_name(),
                latency_ms = latency.as_millis() as u64,
                result = %result,
                "Node call failed"
            );
        }
        result
    }
}
