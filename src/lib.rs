//! # Cluster Replicator
//!
//! Coordinator-driven replication of caller requests across the nodes of a
//! cluster: one logical request fans out to every connected node, mutations
//! go through claim → commit / cancel, and the per-node answers are merged
//! back into one response.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            cluster-replicator                             │
//! │                                                                           │
//! │  ┌───────────────────┐   ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ ReplicationEngine │──►│ NodeRegistry │   │ PhaseCoordinator         │  │
//! │  │ (submit/upload)   │   │ (snapshot)   │   │ claim → commit / cancel  │  │
//! │  └───────────────────┘   └──────────────┘   └──────────────────────────┘  │
//! │         │                                            │                    │
//! │         ▼                                            ▼                    │
//! │  ┌───────────────────┐                    ┌──────────────────────────┐    │
//! │  │ ResponseMerger    │◄───────────────────│ NodeTransport (per node) │    │
//! │  │ (representative)  │    NodeResults     │ HTTP + phase ledger      │    │
//! │  └───────────────────┘                    └──────────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **No commit after a failed claim**: a single rejected, unreachable or
//!    timed out claim cancels the operation on the nodes that claimed.
//! 2. **Best-effort-durable commit**: commit is sent to every claimed node;
//!    nodes that fail it are reported as `PARTIAL_FAILURE`, nothing is rolled
//!    back.
//! 3. **Structured results**: node failures are never errors. Only invalid
//!    submissions fail the call; everything else is in [`MergedResponse`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cluster_replicator::{
//!     OperationKind, ReplicationEngine, ReplicatorConfig, RequestPayload, StaticNodeRegistry,
//!     NodeTarget, TargetScope,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> cluster_replicator::Result<()> {
//! let registry = Arc::new(StaticNodeRegistry::with_nodes([
//!     NodeTarget::connected("node-1", "http://10.0.0.1:8080"),
//!     NodeTarget::connected("node-2", "http://10.0.0.2:8080"),
//! ]));
//! let engine = ReplicationEngine::with_http_transport(ReplicatorConfig::default(), registry)?;
//!
//! let response = engine
//!     .submit(
//!         RequestPayload::put("/flow/processors/p1", r#"{"state":"RUNNING"}"#),
//!         OperationKind::MutationClaim,
//!         TargetScope::AllNodes,
//!     )
//!     .await?;
//! println!("{} via {:?}", response.outcome, response.representative);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod node;
pub mod operation;
pub mod resilience;
pub mod staging;
pub mod transport;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, NodeCircuits};
pub use config::{DispatchRateLimit, IdempotencyConfig, NodeCircuitConfig, ReplicatorConfig, UploadConfig};
pub use coordinator::{EngineState, HealthCheck, NodeHealth, Phase, ReplicationEngine};
pub use error::{ReplicationError, Result};
pub use merge::{
    ConsistencyWarning, JsonArrayMerger, MergedResponse, NodeFailure, Outcome, PayloadMerger,
    RepresentativeMerger, ResponseMerger,
};
pub use node::{NodeConnectionState, NodeId, NodeRegistry, NodeTarget, StaticNodeRegistry};
pub use operation::{
    OperationId, OperationKind, ReplicatedOperation, RequestPayload, TargetScope, UploadMetadata,
    UploadSource,
};
pub use staging::StagedUpload;
pub use transport::http::HttpNodeTransport;
pub use transport::ledger::IdempotentTransport;
pub use transport::{NodeCall, NodeResult, NodeTransport, TransportFailureReason};
