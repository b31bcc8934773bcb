//! Response merging.
//!
//! Turns the finished result slots of a [`ReplicationContext`] into one
//! [`MergedResponse`]:
//!
//! | Terminal phase | Outcome | Payload |
//! |----------------|---------|---------|
//! | READ_COMPLETE | by read successes | representative read payload |
//! | COMMITTED, every commit Success | ALL_SUCCEEDED | representative commit payload |
//! | COMMITTED, some commits failed | PARTIAL_FAILURE | representative, else first succeeded node |
//! | COMMITTED, no commit succeeded | ALL_FAILED | none |
//! | CANCELLED | ALL_FAILED | first claim failure in resolution order |
//! | ABORTED_TIMEOUT | ALL_FAILED (reason `timeout`) | none |
//!
//! The representative is the local (coordinating) node when it succeeded,
//! otherwise the first succeeded node in resolution order.
//!
//! # Payload Mergers
//!
//! Some endpoints answer with per-node data that should be combined rather
//! than picked from one node (e.g. listings). A [`PayloadMerger`] registered
//! for a method + path pattern builds the payload from every successful
//! node. Without one, the representative's payload is returned as is and
//! mutation payloads of other nodes are checked against it: a different
//! SHA-256 is a [`ConsistencyWarning`], logged and reported, never fatal.

use crate::coordinator::context::ReplicationContext;
use crate::coordinator::Phase;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::NodeId;
use crate::operation::{OperationId, OperationKind};
use crate::transport::NodeResult;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reason reported when the operation deadline expired.
pub const TIMEOUT_REASON: &str = "timeout";

/// Overall outcome of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    AllSucceeded,
    PartialFailure,
    AllFailed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllSucceeded => "ALL_SUCCEEDED",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::AllFailed => "ALL_FAILED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node's failure in one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub node_id: NodeId,
    /// Phase the failure happened in.
    pub phase: OperationKind,
    pub result: NodeResult,
}

impl NodeFailure {
    /// Short reason: the transport failure reason or `status <code>`.
    pub fn reason(&self) -> String {
        match &self.result {
            NodeResult::TransportFailure(reason) => reason.as_str().to_string(),
            other => match other.status() {
                Some(status) => format!("status {status}"),
                None => other.outcome_label().to_string(),
            },
        }
    }
}

/// A node whose payload differs from the representative's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub node_id: NodeId,
    pub representative: NodeId,
    pub representative_sha256: String,
    pub node_sha256: String,
}

/// The resolved logical result of one replicated operation.
#[derive(Debug, Clone)]
pub struct MergedResponse {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub outcome: Outcome,
    /// Terminal phase reached.
    pub phase: Phase,
    /// Status code to report, taken from the node the payload came from.
    pub status: Option<u16>,
    pub payload: Option<Bytes>,
    /// Failure reason for ALL_FAILED outcomes.
    pub reason: Option<String>,
    pub representative: Option<NodeId>,
    /// Nodes where the final phase succeeded, in resolution order.
    pub succeeded: Vec<NodeId>,
    /// Per-node failures across all phases, in resolution order per phase.
    pub failures: Vec<NodeFailure>,
    /// Nodes in scope that were not connected and never called.
    pub skipped: Vec<NodeId>,
    /// Nodes cut off by the deadline; their effect needs manual reconciliation.
    pub unknown_outcome: Vec<NodeId>,
    pub warnings: Vec<ConsistencyWarning>,
}

impl MergedResponse {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::AllSucceeded
    }

    pub fn timed_out(&self) -> bool {
        self.phase == Phase::AbortedTimeout
    }

    /// Whether an operator has to look at node state.
    ///
    /// True for partially applied mutations and for unknown outcomes.
    pub fn requires_reconciliation(&self) -> bool {
        !self.unknown_outcome.is_empty()
            || (self.kind.is_mutation() && self.outcome == Outcome::PartialFailure)
            || (self.phase == Phase::Committed && self.outcome == Outcome::AllFailed)
    }

    /// Failing node IDs, without duplicates, in report order.
    pub fn failed_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        for failure in &self.failures {
            if !nodes.contains(&failure.node_id) {
                nodes.push(failure.node_id.clone());
            }
        }
        nodes
    }

    /// First failure recorded for `node_id`.
    pub fn failure_for(&self, node_id: &NodeId) -> Option<&NodeFailure> {
        self.failures.iter().find(|f| &f.node_id == node_id)
    }

    pub fn payload_str(&self) -> Option<String> {
        self.payload
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }
}

/// Builds a merged payload for one endpoint.
pub trait PayloadMerger: Send + Sync {
    /// Whether this merger applies to the request.
    fn can_handle(&self, method: &str, path: &str) -> bool;

    /// Merge every successful node payload.
    ///
    /// `responses` is in resolution order. Returning `None` falls back to
    /// the representative's payload.
    fn merge_payloads(&self, representative: &Bytes, responses: &[(NodeId, Bytes)]) -> Option<Bytes>;
}

/// Returns the representative's payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepresentativeMerger;

impl PayloadMerger for RepresentativeMerger {
    fn can_handle(&self, _method: &str, _path: &str) -> bool {
        true
    }

    fn merge_payloads(&self, representative: &Bytes, _responses: &[(NodeId, Bytes)]) -> Option<Bytes> {
        Some(representative.clone())
    }
}

/// Concatenates one JSON array field across all nodes.
///
/// The representative's document is kept and its `field` array replaced by
/// the elements of every node's `field` array, in resolution order. A node
/// payload that is not a JSON object with that array makes the merger give
/// up and fall back to the representative.
#[derive(Debug, Clone)]
pub struct JsonArrayMerger {
    method: String,
    pattern: Regex,
    field: String,
}

impl JsonArrayMerger {
    pub fn new(method: impl Into<String>, path_pattern: &str, field: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(path_pattern)
            .map_err(|e| ReplicationError::Config(format!("invalid merger path pattern '{path_pattern}': {e}")))?;
        Ok(Self {
            method: method.into(),
            pattern,
            field: field.into(),
        })
    }
}

impl PayloadMerger for JsonArrayMerger {
    fn can_handle(&self, method: &str, path: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.pattern.is_match(path)
    }

    fn merge_payloads(&self, representative: &Bytes, responses: &[(NodeId, Bytes)]) -> Option<Bytes> {
        let mut document: Value = serde_json::from_slice(representative).ok()?;
        let mut merged = Vec::new();
        for (node_id, payload) in responses {
            let value: Value = match serde_json::from_slice(payload) {
                Ok(value) => value,
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Payload is not JSON, not merging");
                    return None;
                }
            };
            match value.get(&self.field) {
                Some(Value::Array(items)) => merged.extend(items.iter().cloned()),
                _ => return None,
            }
        }
        document
            .as_object_mut()?
            .insert(self.field.clone(), Value::Array(merged));
        serde_json::to_vec(&document).ok().map(Bytes::from)
    }
}

/// Combines per-node results into a [`MergedResponse`].
#[derive(Clone, Default)]
pub struct ResponseMerger {
    local_node: Option<NodeId>,
    mergers: Vec<Arc<dyn PayloadMerger>>,
}

impl ResponseMerger {
    pub fn new(local_node: Option<NodeId>) -> Self {
        Self {
            local_node,
            mergers: Vec::new(),
        }
    }

    /// Register an endpoint merger. Earlier registrations win.
    pub fn register(&mut self, merger: Arc<dyn PayloadMerger>) {
        self.mergers.push(merger);
    }

    fn merger_for(&self, method: &str, path: &str) -> Option<&Arc<dyn PayloadMerger>> {
        self.mergers.iter().find(|m| m.can_handle(method, path))
    }

    /// Pick the representative among nodes whose final phase succeeded.
    pub fn representative(&self, succeeded: &[NodeId]) -> Option<NodeId> {
        match &self.local_node {
            Some(local) if succeeded.contains(local) => Some(local.clone()),
            _ => succeeded.first().cloned(),
        }
    }

    /// Build the merged response of a context in a terminal phase.
    pub fn merge(&self, ctx: &ReplicationContext) -> MergedResponse {
        let operation = ctx.operation();
        let mut response = MergedResponse {
            operation_id: operation.id(),
            kind: operation.kind(),
            outcome: Outcome::AllFailed,
            phase: ctx.phase(),
            status: None,
            payload: None,
            reason: None,
            representative: None,
            succeeded: Vec::new(),
            failures: Vec::new(),
            skipped: ctx.skipped().to_vec(),
            unknown_outcome: ctx.unknown_outcome().to_vec(),
            warnings: Vec::new(),
        };

        match ctx.phase() {
            Phase::ReadComplete => self.merge_success_phase(ctx, ctx.primary(), OperationKind::Read, &mut response),
            Phase::Committed => self.merge_success_phase(ctx, ctx.commit(), OperationKind::MutationCommit, &mut response),
            Phase::Cancelled => {
                response.failures = self.mutation_failures(ctx);
                match response.failures.first() {
                    Some(first) => {
                        response.status = first.result.status();
                        response.payload = Some(match first.result.payload() {
                            Some(payload) => payload.clone(),
                            None => Bytes::from(first.reason()),
                        });
                        response.reason = Some(first.reason());
                    }
                    None => response.reason = Some("no connected target nodes".to_string()),
                }
            }
            Phase::AbortedTimeout => {
                response.failures = self.mutation_failures(ctx);
                response.reason = Some(TIMEOUT_REASON.to_string());
            }
            other => {
                warn!(operation_id = %operation.id(), phase = %other, "Merging a non-terminal operation");
                response.reason = Some(format!("operation ended in non-terminal phase {other}"));
            }
        }

        response
    }

    fn mutation_failures(&self, ctx: &ReplicationContext) -> Vec<NodeFailure> {
        let claim_kind = ctx.operation().kind();
        let mut failures = collect_failures(ctx.primary().failures(), claim_kind);
        failures.extend(collect_failures(ctx.cancel().failures(), OperationKind::MutationCancel));
        failures
    }

    fn merge_success_phase(
        &self,
        ctx: &ReplicationContext,
        slots: &crate::coordinator::context::ResultSlots,
        phase_kind: OperationKind,
        response: &mut MergedResponse,
    ) {
        response.succeeded = slots.succeeded();
        response.failures = collect_failures(slots.failures(), phase_kind);

        response.outcome = if response.succeeded.is_empty() {
            Outcome::AllFailed
        } else if response.failures.is_empty() && slots.is_complete() {
            Outcome::AllSucceeded
        } else {
            Outcome::PartialFailure
        };

        let Some(representative) = self.representative(&response.succeeded) else {
            response.reason = Some(match response.failures.first() {
                Some(first) => first.reason(),
                None => "no connected target nodes".to_string(),
            });
            return;
        };
        let Some(rep_result) = slots.get(&representative) else {
            return;
        };
        let rep_payload = rep_result.payload().cloned().unwrap_or_default();
        response.status = rep_result.status();

        let successes: Vec<(NodeId, Bytes)> = slots
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(id, r)| (id.clone(), r.payload().cloned().unwrap_or_default()))
            .collect();

        let payload = ctx.operation().payload();
        response.payload = match self.merger_for(&payload.method, &payload.path) {
            Some(merger) => Some(
                merger
                    .merge_payloads(&rep_payload, &successes)
                    .unwrap_or_else(|| rep_payload.clone()),
            ),
            None => {
                if phase_kind == OperationKind::MutationCommit {
                    response.warnings = consistency_warnings(&representative, &rep_payload, &successes);
                }
                Some(rep_payload)
            }
        };
        response.representative = Some(representative);
    }
}

fn collect_failures(failures: Vec<(NodeId, NodeResult)>, phase: OperationKind) -> Vec<NodeFailure> {
    failures
        .into_iter()
        .map(|(node_id, result)| NodeFailure { node_id, phase, result })
        .collect()
}

fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn consistency_warnings(
    representative: &NodeId,
    rep_payload: &Bytes,
    successes: &[(NodeId, Bytes)],
) -> Vec<ConsistencyWarning> {
    let rep_sha = sha256_hex(rep_payload);
    let mut warnings = Vec::new();
    for (node_id, payload) in successes {
        if node_id == representative {
            continue;
        }
        let node_sha = sha256_hex(payload);
        if node_sha != rep_sha {
            warn!(
                node_id = %node_id,
                representative = %representative,
                "Node payload diverges from representative after commit"
            );
            metrics::record_consistency_warning(node_id.as_str());
            warnings.push(ConsistencyWarning {
                node_id: node_id.clone(),
                representative: representative.clone(),
                representative_sha256: rep_sha.clone(),
                node_sha256: node_sha,
            });
        }
    }
    warnings
}
