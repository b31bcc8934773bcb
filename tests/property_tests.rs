//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use bytes::Bytes;
use cluster_replicator::coordinator::ResultSlots;
use cluster_replicator::transport::{parse_phase_headers, NODE_CONTINUE_STATUS};
use cluster_replicator::{
    NodeCall, NodeConnectionState, NodeId, NodeResult, NodeTarget, OperationKind, Outcome, Phase,
    ReplicatedOperation, RequestPayload, ResponseMerger, StaticNodeRegistry, TargetScope,
    TransportFailureReason,
};
use common::{engine, Behavior, MockTransport};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

// =============================================================================
// Two-Phase Protocol Properties
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Claim {
    Accept,
    Continue,
    Conflict,
    Refused,
    Hang,
}

impl Claim {
    fn behavior(self) -> Behavior {
        match self {
            Claim::Accept => Behavior::ok("claimed"),
            Claim::Continue => Behavior::status(NODE_CONTINUE_STATUS, ""),
            Claim::Conflict => Behavior::status(409, "conflict"),
            Claim::Refused => Behavior::Fail(TransportFailureReason::ConnectionRefused),
            Claim::Hang => Behavior::Hang,
        }
    }

    fn accepted(self) -> bool {
        matches!(self, Claim::Accept | Claim::Continue)
    }
}

fn claim_strategy() -> impl Strategy<Value = Claim> {
    prop_oneof![
        4 => Just(Claim::Accept),
        1 => Just(Claim::Continue),
        1 => Just(Claim::Conflict),
        1 => Just(Claim::Refused),
        1 => Just(Claim::Hang),
    ]
}

/// (claim behavior, connected) per node
fn cluster_strategy() -> impl Strategy<Value = Vec<(Claim, bool)>> {
    prop::collection::vec((claim_strategy(), prop::bool::weighted(0.8)), 1..7)
}

fn run_paused<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Commit is sent iff every connected node accepted the claim, and only
    /// to connected nodes; cancel only reaches nodes that claimed.
    #[test]
    fn commit_only_after_unanimous_claim(nodes in cluster_strategy()) {
        let (mock, response, connected, accepted) = run_paused(async {
            let registry = Arc::new(StaticNodeRegistry::new());
            let mock = Arc::new(MockTransport::new());
            let mut connected = BTreeSet::new();
            let mut accepted = BTreeSet::new();

            for (i, (claim, is_connected)) in nodes.iter().enumerate() {
                let id = format!("node-{}", i + 1);
                let state = if *is_connected {
                    NodeConnectionState::Connected
                } else {
                    NodeConnectionState::Disconnected
                };
                registry.upsert(NodeTarget::new(id.as_str(), format!("http://10.0.0.{}:8080", i + 1), state));
                mock.script(&id, OperationKind::MutationClaim, claim.behavior());
                if *is_connected {
                    connected.insert(id.clone());
                    if claim.accepted() {
                        accepted.insert(id);
                    }
                }
            }

            let engine = engine(registry, mock.clone());
            let response = engine
                .submit(
                    RequestPayload::put("/flow/processors/p1", "{}"),
                    OperationKind::MutationClaim,
                    TargetScope::AllNodes,
                )
                .await
                .unwrap();
            (mock, response, connected, accepted)
        });

        let as_set = |v: Vec<String>| v.into_iter().collect::<BTreeSet<_>>();
        let claimed = as_set(mock.nodes_called(OperationKind::MutationClaim));
        let committed = as_set(mock.nodes_called(OperationKind::MutationCommit));
        let cancelled = as_set(mock.nodes_called(OperationKind::MutationCancel));

        // Dispatch set is exactly the connected targets
        prop_assert_eq!(&claimed, &connected);

        let unanimous = !connected.is_empty() && accepted == connected;
        if unanimous {
            prop_assert_eq!(response.phase, Phase::Committed);
            prop_assert_eq!(response.outcome, Outcome::AllSucceeded);
            prop_assert_eq!(&committed, &connected);
            prop_assert!(cancelled.is_empty());
        } else {
            prop_assert_eq!(response.phase, Phase::Cancelled);
            prop_assert_eq!(response.outcome, Outcome::AllFailed);
            prop_assert!(committed.is_empty());
            prop_assert_eq!(&cancelled, &accepted);
        }

        // Every connected node is accounted for, disconnected ones are skipped
        let skipped: BTreeSet<String> = response.skipped.iter().map(|n| n.to_string()).collect();
        prop_assert!(skipped.is_disjoint(&connected));
        prop_assert_eq!(skipped.len() + connected.len(), nodes.len());
    }
}

// =============================================================================
// Result Slot Properties
// =============================================================================

fn result_strategy() -> impl Strategy<Value = NodeResult> {
    prop_oneof![
        (200u16..300).prop_map(|status| NodeResult::Success { status, payload: Bytes::new() }),
        (400u16..600).prop_map(|status| NodeResult::ApplicationError { status, payload: Bytes::new() }),
        Just(NodeResult::timeout()),
        Just(NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall)),
    ]
}

proptest! {
    /// Each slot keeps the first result recorded for it; later ones are ignored.
    #[test]
    fn slots_are_write_once(
        node_count in 1usize..8,
        writes in prop::collection::vec((0usize..10, result_strategy()), 0..40),
    ) {
        let ids: Vec<NodeId> = (0..node_count).map(|i| NodeId::new(format!("node-{i}"))).collect();
        let mut slots = ResultSlots::new(ids.clone());
        let mut first: std::collections::HashMap<usize, NodeResult> = std::collections::HashMap::new();

        for (index, result) in writes {
            let node = NodeId::new(format!("node-{index}"));
            let recorded = slots.record(&node, result.clone());
            let expected = index < node_count && !first.contains_key(&index);
            prop_assert_eq!(recorded, expected);
            if expected {
                first.insert(index, result);
            }
        }

        for (index, id) in ids.iter().enumerate() {
            prop_assert_eq!(slots.get(id), first.get(&index));
        }
        prop_assert_eq!(slots.is_complete(), first.len() == node_count);
        prop_assert_eq!(slots.pending().len(), node_count - first.len());
        prop_assert_eq!(
            slots.all_success(),
            slots.is_complete() && first.values().all(|r| r.is_success())
        );
    }

    /// The local node represents whenever it succeeded.
    #[test]
    fn representative_prefers_local(succeeded in prop::collection::btree_set(0usize..6, 0..6), local in 0usize..6) {
        let succeeded: Vec<NodeId> = succeeded.into_iter().map(|i| NodeId::new(format!("node-{i}"))).collect();
        let local_id = NodeId::new(format!("node-{local}"));
        let merger = ResponseMerger::new(Some(local_id.clone()));

        let representative = merger.representative(&succeeded);
        if succeeded.contains(&local_id) {
            prop_assert_eq!(representative, Some(local_id));
        } else {
            prop_assert_eq!(representative, succeeded.first().cloned());
        }
    }
}

// =============================================================================
// Wire Classification Properties
// =============================================================================

fn kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Read),
        Just(OperationKind::MutationClaim),
        Just(OperationKind::MutationCommit),
        Just(OperationKind::MutationCancel),
        Just(OperationKind::StreamedUpload),
    ]
}

proptest! {
    /// 2xx is always success, 150 only on claims, everything else an application error.
    #[test]
    fn status_classification(kind in kind_strategy(), status in 100u16..600) {
        let result = NodeResult::from_response(kind, status, Bytes::new());
        let expected = (200..300).contains(&status) || (status == NODE_CONTINUE_STATUS && kind.is_claim());
        prop_assert_eq!(result.is_success(), expected);
        prop_assert!(result.is_node_answer());
        prop_assert_eq!(result.status(), Some(status));
    }

    /// Arbitrary header sets never panic the parser.
    #[test]
    fn parse_phase_headers_no_panic(headers in prop::collection::vec((".{0,40}", ".{0,60}"), 0..10)) {
        let _ = parse_phase_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    /// A receiving node identifies every phase whatever the header case.
    #[test]
    fn phase_headers_identify_call(kind in kind_strategy(), upper in any::<bool>()) {
        let operation = ReplicatedOperation::new(
            OperationKind::MutationClaim,
            RequestPayload::put("/flow/processors/p1", "{}"),
            TargetScope::AllNodes,
        );
        let call = NodeCall::for_phase(&operation, kind, None);
        let headers: Vec<(String, String)> = call
            .phase_headers()
            .into_iter()
            .map(|(k, v)| (if upper { k.to_ascii_uppercase() } else { k.to_ascii_lowercase() }, v))
            .collect();

        let parsed = parse_phase_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let parsed = parsed.expect("replication headers present");
        prop_assert_eq!(parsed.operation_id, operation.id());
        prop_assert_eq!(parsed.kind, kind);
        prop_assert_eq!(parsed.cancel, kind == OperationKind::MutationCancel);
    }
}
