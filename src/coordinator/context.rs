//! Lifetime state of one replicated operation.
//!
//! A [`ReplicationContext`] is created when the engine accepts an operation
//! and dropped once the merged response is built. It owns:
//!
//! - the node snapshot taken at resolution (targets to call, nodes skipped)
//! - one write-once result slot per target and phase
//! - the operation deadline and the current [`Phase`]
//! - the staged upload body, whose temporary file goes away with the context
//!
//! Only the phase coordinator writes to it, from a single task, as results
//! arrive from the fan-out. A slot keeps its first classification: a late
//! answer for a slot already marked as timed out is ignored.

use super::types::Phase;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::{NodeId, NodeTarget};
use crate::operation::ReplicatedOperation;
use crate::transport::{NodeResult, UploadBody};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One result slot per node, in resolution order.
#[derive(Debug, Clone, Default)]
pub struct ResultSlots {
    slots: Vec<(NodeId, Option<NodeResult>)>,
}

impl ResultSlots {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            slots: nodes.into_iter().map(|id| (id, None)).collect(),
        }
    }

    /// Record a node's result. Returns `false` if the slot was already
    /// filled or the node has no slot in this phase.
    pub fn record(&mut self, node_id: &NodeId, result: NodeResult) -> bool {
        match self.slots.iter_mut().find(|(id, _)| id == node_id) {
            Some((_, slot @ None)) => {
                *slot = Some(result);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&NodeResult> {
        self.slots
            .iter()
            .find(|(id, _)| id == node_id)
            .and_then(|(_, r)| r.as_ref())
    }

    /// Nodes still without a result.
    pub fn pending(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .filter(|(_, r)| r.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|(_, r)| r.is_some())
    }

    /// Every slot holds a `Success`. False for an empty set.
    pub fn all_success(&self) -> bool {
        !self.slots.is_empty()
            && self
                .slots
                .iter()
                .all(|(_, r)| matches!(r, Some(result) if result.is_success()))
    }

    /// Filled slots, in resolution order.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeResult)> {
        self.slots
            .iter()
            .filter_map(|(id, r)| r.as_ref().map(|result| (id, result)))
    }

    /// Nodes whose result is `Success`, in resolution order.
    pub fn succeeded(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, r)| r.is_success())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Non-success results, in resolution order.
    pub fn failures(&self) -> Vec<(NodeId, NodeResult)> {
        self.iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.slots.iter().map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Full lifetime state of one replicated operation.
pub struct ReplicationContext {
    operation: ReplicatedOperation,
    targets: Vec<NodeTarget>,
    skipped: Vec<NodeId>,
    primary: ResultSlots,
    commit: ResultSlots,
    cancel: ResultSlots,
    unknown_outcome: Vec<NodeId>,
    phase: Phase,
    started: Instant,
    deadline: Instant,
    upload: Option<UploadBody>,
}

impl ReplicationContext {
    /// Create the context from the resolved node snapshot.
    ///
    /// Connected nodes become targets; the rest are recorded as skipped.
    pub fn new(
        operation: ReplicatedOperation,
        resolved: Vec<NodeTarget>,
        deadline: Duration,
        upload: Option<UploadBody>,
    ) -> Self {
        let (targets, not_connected): (Vec<_>, Vec<_>) =
            resolved.into_iter().partition(|n| n.is_connected());
        let skipped = not_connected.into_iter().map(|n| n.id).collect();
        let primary = ResultSlots::new(targets.iter().map(|t| t.id.clone()));
        let phase = if operation.kind().is_mutation() {
            Phase::PendingClaim
        } else {
            Phase::Reading
        };
        let started = Instant::now();

        Self {
            operation,
            targets,
            skipped,
            primary,
            commit: ResultSlots::default(),
            cancel: ResultSlots::default(),
            unknown_outcome: Vec::new(),
            phase,
            started,
            deadline: started + deadline,
            upload,
        }
    }

    pub fn operation(&self) -> &ReplicatedOperation {
        &self.operation
    }

    /// Connected targets, in resolution order.
    pub fn targets(&self) -> &[NodeTarget] {
        &self.targets
    }

    /// Nodes in scope that were not connected at resolution.
    pub fn skipped(&self) -> &[NodeId] {
        &self.skipped
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn upload(&self) -> Option<&UploadBody> {
        self.upload.as_ref()
    }

    /// Read or claim results.
    pub fn primary(&self) -> &ResultSlots {
        &self.primary
    }

    pub fn commit(&self) -> &ResultSlots {
        &self.commit
    }

    pub fn cancel(&self) -> &ResultSlots {
        &self.cancel
    }

    /// Nodes whose effect is unknown because the deadline cut them off.
    pub fn unknown_outcome(&self) -> &[NodeId] {
        &self.unknown_outcome
    }

    /// Move to the next phase.
    ///
    /// Fails on an illegal transition, and on `Committing` unless every
    /// target answered its claim with `Success`.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(ReplicationError::Internal(format!(
                "illegal phase transition {} -> {}",
                self.phase, next
            )));
        }
        if next == Phase::Committing && !self.primary.all_success() {
            return Err(ReplicationError::Internal(
                "commit requested without a unanimous claim".to_string(),
            ));
        }

        debug!(
            operation_id = %self.operation.id(),
            from = %self.phase,
            to = %next,
            "Phase transition"
        );
        metrics::record_phase_transition(next.as_str());
        self.phase = next;
        Ok(())
    }

    pub fn record_primary(&mut self, node_id: &NodeId, result: NodeResult) -> bool {
        self.primary.record(node_id, result)
    }

    /// Open commit slots for every target.
    pub fn begin_commit(&mut self) {
        self.commit = ResultSlots::new(self.targets.iter().map(|t| t.id.clone()));
    }

    pub fn record_commit(&mut self, node_id: &NodeId, result: NodeResult) -> bool {
        self.commit.record(node_id, result)
    }

    /// Open cancel slots for the given nodes.
    pub fn begin_cancel(&mut self, nodes: &[NodeId]) {
        self.cancel = ResultSlots::new(nodes.iter().cloned());
    }

    pub fn record_cancel(&mut self, node_id: &NodeId, result: NodeResult) -> bool {
        self.cancel.record(node_id, result)
    }

    pub fn mark_unknown(&mut self, node_id: &NodeId) {
        if !self.unknown_outcome.contains(node_id) {
            self.unknown_outcome.push(node_id.clone());
        }
    }

    /// Targets matching the given node IDs, in resolution order.
    pub fn targets_for(&self, nodes: &[NodeId]) -> Vec<NodeTarget> {
        self.targets
            .iter()
            .filter(|t| nodes.contains(&t.id))
            .cloned()
            .collect()
    }
}
