//! Fuzz target for node answer classification.

#![no_main]

use bytes::Bytes;
use cluster_replicator::{NodeResult, OperationKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u16, u8, &[u8])| {
    let (status, kind, payload) = data;
    let kind = match kind % 5 {
        0 => OperationKind::Read,
        1 => OperationKind::MutationClaim,
        2 => OperationKind::MutationCommit,
        3 => OperationKind::MutationCancel,
        _ => OperationKind::StreamedUpload,
    };

    let result = NodeResult::from_response(kind, status, Bytes::copy_from_slice(payload));
    assert!(result.is_node_answer());
    assert_eq!(result.status(), Some(status));
    assert_eq!(result.payload().map(|p| &p[..]), Some(payload));
    if result.is_success() {
        assert!((200..300).contains(&status) || (kind.is_claim() && status == 150));
    }
});
