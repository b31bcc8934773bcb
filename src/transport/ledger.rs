//! Phase result ledger.
//!
//! Redelivering a phase a node already answered must not apply it twice. The
//! [`IdempotentTransport`] remembers every node answer keyed by
//! `(operation id, node, phase)` and replays it instead of calling again:
//!
//! ```text
//! call(op-7, node-2, commit) ──→ ledger miss ──→ wire ──→ Success(200) ──→ recorded
//! call(op-7, node-2, commit) ──→ ledger hit ──────────────────────────────→ Success(200)
//! ```
//!
//! Only node answers (`Success`, `ApplicationError`) are recorded. A transport
//! failure says nothing about what the node did, so the next delivery goes to
//! the wire. Entries expire after the configured retention.
//!
//! Once a cancel was sent to a node, its claim for that operation is gone
//! whatever the cancel returned. A later claim for the same operation is
//! answered with a conflict instead of the recorded claim, so a redelivered
//! operation can never commit on a node that dropped its claim:
//!
//! ```text
//! call(op-7, node-2, cancel) ──→ marked cancelled ──→ wire
//! call(op-7, node-2, claim)  ──→ cancelled ──────────────→ ApplicationError(409)
//! ```

use super::{BoxFuture, NodeCall, NodeResult, NodeTransport};
use crate::metrics;
use crate::node::{NodeId, NodeTarget};
use crate::operation::{OperationId, OperationKind};
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Status reported for a claim on an operation the node already cancelled.
pub const CANCELLED_CLAIM_STATUS: u16 = 409;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    operation_id: OperationId,
    node_id: NodeId,
    kind: OperationKind,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    result: NodeResult,
    recorded_at: Instant,
}

/// Transport wrapper answering repeated phase deliveries from a ledger.
pub struct IdempotentTransport<T> {
    inner: T,
    entries: DashMap<LedgerKey, LedgerEntry>,
    /// (operation, node) pairs a cancel was sent to
    cancelled: DashMap<(OperationId, NodeId), Instant>,
    retention: Duration,
}

impl<T: NodeTransport> IdempotentTransport<T> {
    pub fn new(inner: T, retention: Duration) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            cancelled: DashMap::new(),
            retention,
        }
    }

    /// Recorded answer of a node for a phase, if still retained.
    pub fn lookup(&self, operation_id: OperationId, node_id: &NodeId, kind: OperationKind) -> Option<NodeResult> {
        let key = LedgerKey {
            operation_id,
            node_id: node_id.clone(),
            kind,
        };
        let entry = self.entries.get(&key)?;
        if entry.recorded_at.elapsed() > self.retention {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.result.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries.retain(|_, entry| entry.recorded_at.elapsed() <= retention);
        self.cancelled.retain(|_, at| at.elapsed() <= retention);
        before.saturating_sub(self.entries.len())
    }

    /// Whether a cancel was sent to the node for this operation.
    pub fn is_cancelled(&self, operation_id: OperationId, node_id: &NodeId) -> bool {
        match self.cancelled.get(&(operation_id, node_id.clone())) {
            Some(at) => at.elapsed() <= self.retention,
            None => false,
        }
    }

    /// Number of recorded answers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: NodeTransport> NodeTransport for IdempotentTransport<T> {
    fn call<'a>(&'a self, target: &'a NodeTarget, call: &'a NodeCall) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            if call.kind.is_claim() && self.is_cancelled(call.operation_id, &target.id) {
                warn!(
                    operation_id = %call.operation_id,
                    node_id = %target.id,
                    phase = %call.kind,
                    "Claim redelivered after cancel, refusing"
                );
                metrics::record_ledger_replay(call.kind.wire_name());
                return NodeResult::ApplicationError {
                    status: CANCELLED_CLAIM_STATUS,
                    payload: Bytes::from_static(b"claim already cancelled"),
                };
            }
            if call.kind == OperationKind::MutationCancel {
                // Marked before sending: a cancel that fails in transit may still land
                self.cancelled
                    .insert((call.operation_id, target.id.clone()), Instant::now());
            }

            if let Some(recorded) = self.lookup(call.operation_id, &target.id, call.kind) {
                debug!(
                    operation_id = %call.operation_id,
                    node_id = %target.id,
                    phase = %call.kind,
                    outcome = recorded.outcome_label(),
                    "Phase already answered, replaying recorded result"
                );
                metrics::record_ledger_replay(call.kind.wire_name());
                return recorded;
            }

            let result = self.inner.call(target, call).await;
            if result.is_node_answer() {
                self.entries.insert(
                    LedgerKey {
                        operation_id: call.operation_id,
                        node_id: target.id.clone(),
                        kind: call.kind,
                    },
                    LedgerEntry {
                        result: result.clone(),
                        recorded_at: Instant::now(),
                    },
                );
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ReplicatedOperation, RequestPayload, TargetScope};
    use crate::transport::TransportFailureReason;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers with the scripted results in order, counting calls.
    struct Scripted {
        results: Mutex<Vec<NodeResult>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<NodeResult>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl NodeTransport for Scripted {
        fn call<'a>(&'a self, _target: &'a NodeTarget, _call: &'a NodeCall) -> BoxFuture<'a, NodeResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.results.lock().unwrap().pop().unwrap_or_else(NodeResult::timeout);
            Box::pin(async move { next })
        }
    }

    fn ok() -> NodeResult {
        NodeResult::Success {
            status: 200,
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn commit_call() -> NodeCall {
        let op = ReplicatedOperation::new(
            OperationKind::MutationClaim,
            RequestPayload::put("/x", "{}"),
            TargetScope::AllNodes,
        );
        NodeCall::for_phase(&op, OperationKind::MutationCommit, None)
    }

    #[tokio::test]
    async fn test_duplicate_phase_replayed_from_ledger() {
        let ledger = IdempotentTransport::new(Scripted::new(vec![ok(), ok()]), Duration::from_secs(60));
        let target = NodeTarget::connected("node-1", "http://node-1");
        let call = commit_call();

        assert_eq!(ledger.call(&target, &call).await, ok());
        assert_eq!(ledger.call(&target, &call).await, ok());
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_other_node_or_phase_not_replayed() {
        let ledger = IdempotentTransport::new(Scripted::new(vec![ok(), ok(), ok()]), Duration::from_secs(60));
        let call = commit_call();
        let mut cancel = call.clone();
        cancel.kind = OperationKind::MutationCancel;

        ledger.call(&NodeTarget::connected("node-1", "http://n1"), &call).await;
        ledger.call(&NodeTarget::connected("node-2", "http://n2"), &call).await;
        ledger.call(&NodeTarget::connected("node-1", "http://n1"), &cancel).await;
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transport_failures_not_recorded() {
        let ledger = IdempotentTransport::new(
            Scripted::new(vec![
                NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall),
                ok(),
            ]),
            Duration::from_secs(60),
        );
        let target = NodeTarget::connected("node-1", "http://node-1");
        let call = commit_call();

        assert!(!ledger.call(&target, &call).await.is_node_answer());
        assert_eq!(ledger.call(&target, &call).await, ok());
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_application_errors_recorded() {
        let conflict = NodeResult::ApplicationError {
            status: 409,
            payload: Bytes::new(),
        };
        let ledger = IdempotentTransport::new(Scripted::new(vec![conflict.clone()]), Duration::from_secs(60));
        let target = NodeTarget::connected("node-1", "http://node-1");
        let call = commit_call();

        ledger.call(&target, &call).await;
        assert_eq!(ledger.call(&target, &call).await, conflict);
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_after_cancel_refused() {
        // claim ok, cancel fails in transit, redelivered claim would be ok on the wire
        let ledger = IdempotentTransport::new(
            Scripted::new(vec![
                ok(),
                NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall),
                ok(),
            ]),
            Duration::from_secs(60),
        );
        let target = NodeTarget::connected("node-1", "http://node-1");
        let claim = {
            let mut call = commit_call();
            call.kind = OperationKind::MutationClaim;
            call
        };
        let mut cancel = claim.clone();
        cancel.kind = OperationKind::MutationCancel;

        assert_eq!(ledger.call(&target, &claim).await, ok());
        assert!(!ledger.call(&target, &cancel).await.is_node_answer());
        assert!(ledger.is_cancelled(claim.operation_id, &target.id));

        let redelivered = ledger.call(&target, &claim).await;
        assert_eq!(redelivered.status(), Some(CANCELLED_CLAIM_STATUS));
        assert!(!redelivered.is_success());
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 2);

        // Other nodes of the same operation are unaffected
        let other = NodeTarget::connected("node-2", "http://node-2");
        assert_eq!(ledger.call(&other, &claim).await, ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let ledger = IdempotentTransport::new(Scripted::new(vec![ok(), ok()]), Duration::from_secs(10));
        let target = NodeTarget::connected("node-1", "http://node-1");
        let call = commit_call();

        ledger.call(&target, &call).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(ledger.lookup(call.operation_id, &target.id, call.kind).is_none());
        ledger.call(&target, &call).await;
        assert_eq!(ledger.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let ledger = IdempotentTransport::new(Scripted::new(vec![ok(), ok()]), Duration::from_secs(10));
        let call = commit_call();
        ledger.call(&NodeTarget::connected("node-1", "http://n1"), &call).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        ledger.call(&NodeTarget::connected("node-2", "http://n2"), &call).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(ledger.purge_expired(), 1);
        assert_eq!(ledger.len(), 1);
    }
}
