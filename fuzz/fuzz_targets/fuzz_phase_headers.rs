//! Fuzz target for incoming replication header parsing.
//!
//! Receiving nodes parse these headers from untrusted peers; parsing must
//! never panic and must only accept well-formed calls.

#![no_main]

use cluster_replicator::transport::parse_phase_headers;
use cluster_replicator::OperationKind;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|headers: Vec<(&str, &str)>| {
    if let Some(parsed) = parse_phase_headers(headers.iter().copied()) {
        // An accepted phase always maps back onto its wire name
        assert_eq!(OperationKind::from_wire(parsed.kind.wire_name()), Some(parsed.kind));
        assert_eq!(parsed.operation_id.to_string().parse().ok(), Some(parsed.operation_id));
    }
});
