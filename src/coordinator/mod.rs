// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The façade that ties together:
//! - Target resolution via [`crate::node::NodeRegistry`]
//! - Upload staging via [`crate::staging::StagedUpload`]
//! - The claim/commit/cancel protocol via [`phases::PhaseCoordinator`]
//! - Response merging via [`crate::merge::ResponseMerger`]
//!
//! # Architecture
//!
//! Every submission runs to completion on the caller's task:
//! 1. Validates the operation (programmer errors fail here, nothing is sent)
//! 2. Reads one registry snapshot and resolves the target scope
//! 3. Stages the upload body once, if any
//! 4. Drives the phases to a terminal state inside a `replicate` span
//! 5. Merges per-node results into one [`MergedResponse`]
//!
//! Runtime failures on nodes never surface as `Err`: they are in the
//! response. Graceful shutdown stops new submissions and waits for the
//! in-flight ones.

pub(crate) mod context;
mod fan_out;
mod phases;
mod types;

pub use context::{ReplicationContext, ResultSlots};
pub use fan_out::{Dispatcher, PhaseOutcome};
pub use phases::PhaseCoordinator;
pub use types::{EngineState, HealthCheck, NodeHealth, Phase};

use crate::circuit_breaker::NodeCircuits;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::merge::{MergedResponse, PayloadMerger, ResponseMerger};
use crate::metrics;
use crate::node::{NodeConnectionState, NodeId, NodeRegistry, NodeTarget};
use crate::operation::{
    OperationKind, ReplicatedOperation, RequestPayload, TargetScope, UploadMetadata, UploadSource,
};
use crate::resilience::RateLimiter;
use crate::staging::StagedUpload;
use crate::transport::http::HttpNodeTransport;
use crate::transport::ledger::IdempotentTransport;
use crate::transport::{NodeTransport, UploadBody};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, info_span, warn, Instrument};

/// Transport wrapped with the phase result ledger.
pub type LedgerTransport = IdempotentTransport<Arc<dyn NodeTransport>>;

/// The request replication engine.
///
/// Share it behind an `Arc`; every method takes `&self` and submissions may
/// run concurrently. Overlapping mutations on the same nodes are not
/// serialized: callers needing ordering must not submit them concurrently.
pub struct ReplicationEngine {
    config: ReplicatorConfig,

    /// Membership snapshot source (owned by the host)
    registry: Arc<dyn NodeRegistry>,

    coordinator: PhaseCoordinator,

    merger: ResponseMerger,

    /// Phase ledger, when idempotency is enabled
    ledger: Option<Arc<LedgerTransport>>,

    /// Per-node circuits, when enabled
    circuits: Option<Arc<NodeCircuits>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Operations currently between acceptance and merged response
    in_flight: Arc<AtomicUsize>,

    /// Signalled when the last in-flight operation finishes
    drained: Arc<Notify>,
}

impl ReplicationEngine {
    /// Create an engine over the given registry and transport.
    ///
    /// The engine is `Running` as soon as it is built.
    pub fn new(
        config: ReplicatorConfig,
        registry: Arc<dyn NodeRegistry>,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let (ledger, transport): (Option<Arc<LedgerTransport>>, Arc<dyn NodeTransport>) =
            if config.idempotency.enabled {
                let ledger = Arc::new(IdempotentTransport::new(
                    transport,
                    config.idempotency.retention_duration(),
                ));
                let transport: Arc<dyn NodeTransport> = ledger.clone();
                (Some(ledger), transport)
            } else {
                (None, transport)
            };

        let mut dispatcher = Dispatcher::new(
            transport,
            config.call_timeout_duration(),
            config.max_concurrent_calls,
        );

        let circuits = config.circuit.circuit_config().map(|cfg| {
            info!(
                failure_threshold = cfg.failure_threshold,
                recovery_timeout_ms = cfg.recovery_timeout.as_millis() as u64,
                "Per-node circuit breakers enabled"
            );
            Arc::new(NodeCircuits::new(cfg))
        });
        if let Some(circuits) = &circuits {
            dispatcher = dispatcher.with_circuits(Arc::clone(circuits));
        }

        if let Some(cfg) = config.rate_limit.rate_limit_config() {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for node dispatch"
            );
            dispatcher = dispatcher.with_rate_limiter(Arc::new(RateLimiter::new(cfg)));
        }

        let coordinator = PhaseCoordinator::new(
            dispatcher,
            config.claim_timeout_duration(),
            config.cancel_grace_duration(),
        );
        let merger = ResponseMerger::new(config.local_node_id.as_deref().map(NodeId::from));

        let (state_tx, state_rx) = watch::channel(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(
            node_id = config.local_node_id.as_deref().unwrap_or("-"),
            max_concurrent_calls = config.max_concurrent_calls,
            idempotency = config.idempotency.enabled,
            "Replication engine running"
        );

        Ok(Self {
            config,
            registry,
            coordinator,
            merger,
            ledger,
            circuits,
            state_tx,
            state_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        })
    }

    /// Create an engine talking HTTP to the nodes.
    pub fn with_http_transport(config: ReplicatorConfig, registry: Arc<dyn NodeRegistry>) -> Result<Self> {
        let transport = HttpNodeTransport::new(&config)?;
        Self::new(config, registry, Arc::new(transport))
    }

    /// Register an endpoint payload merger.
    pub fn with_payload_merger(mut self, merger: Arc<dyn PayloadMerger>) -> Self {
        self.merger.register(merger);
        self
    }

    /// Submit a caller request.
    ///
    /// For `StreamedUpload`, the request body is the upload and the
    /// `Filename` header names it; use [`upload()`](Self::upload) to stream
    /// from a reader instead.
    pub async fn submit(
        &self,
        payload: RequestPayload,
        kind: OperationKind,
        scope: TargetScope,
    ) -> Result<MergedResponse> {
        self.execute(ReplicatedOperation::new(kind, payload, scope), None).await
    }

    /// Replicate a prepared operation.
    ///
    /// Replicating the same operation again reuses its ID; with idempotency
    /// enabled, phases a node already answered are not delivered twice.
    pub async fn replicate(&self, operation: &ReplicatedOperation) -> Result<MergedResponse> {
        self.execute(operation.clone(), None).await
    }

    /// Replicate an upload read from `source`.
    ///
    /// The source is consumed once and staged; every node receives the
    /// staged bytes.
    pub async fn upload(
        &self,
        payload: RequestPayload,
        source: UploadSource,
        metadata: UploadMetadata,
        scope: TargetScope,
    ) -> Result<MergedResponse> {
        self.execute(ReplicatedOperation::upload(payload, metadata, scope), Some(source))
            .await
    }

    async fn execute(&self, operation: ReplicatedOperation, source: Option<UploadSource>) -> Result<MergedResponse> {
        let _guard = self.enter()?;

        if let Err(e) = operation.validate(source.is_some()) {
            reject(&e);
            return Err(e);
        }
        if let Some(ledger) = &self.ledger {
            let purged = ledger.purge_expired();
            if purged > 0 {
                debug!(purged, "Expired phase ledger entries");
            }
        }

        let resolved = match self.resolve(operation.scope()) {
            Ok(resolved) => resolved,
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };

        let upload = match self.stage(&operation, source).await {
            Ok(upload) => upload,
            Err(e) => {
                reject(&e);
                return Err(e);
            }
        };

        let kind = operation.kind();
        let span = info_span!("replicate", operation_id = %operation.id(), kind = %kind);
        async move {
            let mut ctx = ReplicationContext::new(
                operation,
                resolved,
                self.config.operation_deadline_duration(),
                upload,
            );
            if !ctx.skipped().is_empty() {
                debug!(skipped = ?ctx.skipped(), "Skipping nodes not connected");
                metrics::record_skipped_nodes(ctx.skipped().len());
            }

            self.coordinator.run(&mut ctx).await?;

            let response = self.merger.merge(&ctx);
            metrics::record_unknown_outcomes(response.unknown_outcome.len());
            metrics::record_operation(kind.wire_name(), response.outcome.as_str(), ctx.elapsed());
            info!(
                outcome = %response.outcome,
                phase = %response.phase,
                succeeded = response.succeeded.len(),
                failed = response.failed_nodes().len(),
                skipped = response.skipped.len(),
                unknown = response.unknown_outcome.len(),
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                "Operation finished"
            );
            Ok::<_, ReplicationError>(response)
        }
        .instrument(span)
        .await
    }

    /// Register an in-flight operation, unless shutting down.
    fn enter(&self) -> Result<InFlightGuard> {
        // Count first so shutdown never misses an operation that got past the check
        let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            drained: Arc::clone(&self.drained),
        };
        if !self.is_running() {
            metrics::record_rejected_submission("shutdown");
            return Err(ReplicationError::Shutdown);
        }
        metrics::set_in_flight_operations(count);
        Ok(guard)
    }

    /// Resolve the scope against one registry snapshot, in resolution order.
    fn resolve(&self, scope: &TargetScope) -> Result<Vec<NodeTarget>> {
        let nodes = self.registry.list_nodes();
        match scope {
            TargetScope::AllNodes => Ok(nodes),
            TargetScope::Nodes(ids) => {
                if let Some(unknown) = ids.iter().find(|id| !nodes.iter().any(|n| &n.id == *id)) {
                    return Err(ReplicationError::UnknownNode(unknown.clone()));
                }
                Ok(nodes.into_iter().filter(|n| ids.contains(&n.id)).collect())
            }
        }
    }

    async fn stage(&self, operation: &ReplicatedOperation, source: Option<UploadSource>) -> Result<Option<UploadBody>> {
        if operation.kind() != OperationKind::StreamedUpload {
            if source.is_some() {
                return Err(ReplicationError::InvalidOperation(format!(
                    "upload source given for a {} operation",
                    operation.kind()
                )));
            }
            return Ok(None);
        }

        let metadata = operation
            .upload_metadata()
            .cloned()
            .ok_or_else(|| ReplicationError::InvalidOperation("upload without filename metadata".to_string()))?;
        let source = match source {
            Some(source) => source,
            None => match &operation.payload().body {
                Some(body) => UploadSource::Buffered(body.clone()),
                None => {
                    return Err(ReplicationError::MissingPayload {
                        operation_id: operation.id().to_string(),
                    })
                }
            },
        };

        let staged = StagedUpload::stage(source, &self.config.upload).await?;
        debug!(
            operation_id = %operation.id(),
            filename = %metadata.filename,
            bytes = staged.len(),
            spilled = staged.is_spilled(),
            "Upload staged for replication"
        );
        Ok(Some(UploadBody { staged, metadata }))
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine accepts submissions.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Get comprehensive health status for monitoring endpoints.
    ///
    /// **Performance**: This method performs no network I/O. Node states
    /// come from the registry snapshot, circuit states from the breakers.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check();
    ///
    /// // For /ready endpoint
    /// if health.ready {
    ///     StatusCode::OK
    /// } else {
    ///     StatusCode::SERVICE_UNAVAILABLE
    /// }
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let snapshot = self.registry.list_nodes();

        let mut nodes = Vec::with_capacity(snapshot.len());
        let (mut connected, mut disconnected, mut starting, mut circuit_open) = (0, 0, 0, 0);
        for node in snapshot {
            match node.state {
                NodeConnectionState::Connected => connected += 1,
                NodeConnectionState::Disconnected => disconnected += 1,
                NodeConnectionState::Starting => starting += 1,
            }
            let open = self
                .circuits
                .as_ref()
                .map(|c| c.is_open(&node.id))
                .unwrap_or(false);
            if open {
                circuit_open += 1;
            }
            nodes.push(NodeHealth {
                node_id: node.id,
                state: node.state,
                circuit_open: open,
            });
        }

        let ready = state == EngineState::Running && connected > 0;
        let healthy = ready && disconnected == 0 && circuit_open == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            nodes_total: nodes.len(),
            nodes_connected: connected,
            nodes_disconnected: disconnected,
            nodes_starting: starting,
            nodes_circuit_open: circuit_open,
            in_flight_operations: self.in_flight(),
            nodes,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Reject new submissions with [`ReplicationError::Shutdown`]
    /// 2. Wait for in-flight operations (bounded by the operation deadline
    ///    plus the cancel grace, which no operation outlives)
    /// 3. Report `Stopped`
    pub async fn shutdown(&self) {
        if self.state() != EngineState::Running {
            return;
        }
        info!(in_flight = self.in_flight(), "Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let drain_timeout = self.config.operation_deadline_duration() + self.config.cancel_grace_duration();
        let drain = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            warn!(
                in_flight = self.in_flight(),
                "In-flight operations did not drain in time"
            );
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Replication engine stopped");
    }

    /// The phase ledger, when idempotency is enabled.
    pub fn ledger(&self) -> Option<&Arc<LedgerTransport>> {
        self.ledger.as_ref()
    }

    /// Get the node ID this engine coordinates from.
    pub fn node_id(&self) -> Option<&str> {
        self.config.local_node_id.as_deref()
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }
}

fn reject(err: &ReplicationError) {
    let reason = match err {
        ReplicationError::EmptyScope => "empty_scope",
        ReplicationError::MissingPayload { .. } => "missing_payload",
        ReplicationError::InvalidOperation(_) => "invalid_operation",
        ReplicationError::UnknownNode(_) => "unknown_node",
        ReplicationError::UploadTooLarge { .. } => "upload_too_large",
        ReplicationError::Staging { .. } => "staging",
        _ => "other",
    };
    warn!(error = %err, "Submission rejected");
    metrics::record_rejected_submission(reason);
}

/// Decrements the in-flight count when an operation ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_in_flight_operations(remaining);
        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }
}
