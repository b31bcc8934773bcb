// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node transport: one attempt of one phase against one node.
//!
//! A [`NodeTransport`] never fails past its boundary. Whatever happens on the
//! wire comes back as a [`NodeResult`]:
//!
//! | What happened | NodeResult |
//! |---------------|------------|
//! | 2xx, or 150 (node-continue) on a claim | `Success` |
//! | Any other status the node answered with | `ApplicationError` |
//! | Deadline exceeded | `TransportFailure(Timeout)` |
//! | Connection refused / unresolvable | `TransportFailure(ConnectionRefused)` |
//! | Connection lost after sending | `TransportFailure(DisconnectedMidCall)` |
//! | Node circuit open, not attempted | `TransportFailure(CircuitOpen)` |
//!
//! # Wire Protocol
//!
//! Every phase replays the caller's request and adds:
//!
//! ```text
//! X-Request-Transaction-Id: <operation id>       (all phases)
//! X-Replication-Phase: read|claim|commit|cancel|upload
//! X-Cancel-Transaction: true                     (cancel only, no body)
//! Filename / Content-Type / X-Content-SHA256     (upload claim only)
//! ```
//!
//! Implementations: [`HttpNodeTransport`](http::HttpNodeTransport) over
//! reqwest, and [`IdempotentTransport`](ledger::IdempotentTransport) which
//! wraps any other transport with a phase result ledger.

pub mod http;
pub mod ledger;

use crate::node::NodeTarget;
use crate::operation::{OperationId, OperationKind, ReplicatedOperation, RequestPayload, UploadMetadata};
use crate::staging::StagedUpload;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Correlates every phase of one operation.
pub const TRANSACTION_ID_HEADER: &str = "X-Request-Transaction-Id";
/// Names the phase of a call.
pub const PHASE_HEADER: &str = "X-Replication-Phase";
/// Marks a cancel call.
pub const CANCEL_HEADER: &str = "X-Cancel-Transaction";
/// Upload file name.
pub const FILENAME_HEADER: &str = "Filename";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
/// Hex SHA-256 of an upload body.
pub const CHECKSUM_HEADER: &str = "X-Content-SHA256";
/// Status a node answers a claim with when it accepted it.
pub const NODE_CONTINUE_STATUS: u16 = 150;

/// Boxed future returned by transports.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a node could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFailureReason {
    /// No answer within the call timeout or the phase deadline.
    Timeout,
    /// Connection could not be established.
    ConnectionRefused,
    /// Connection broke after the request went out; the node may have acted.
    DisconnectedMidCall,
    /// Not attempted, the node's circuit breaker is open.
    CircuitOpen,
}

impl TransportFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::DisconnectedMidCall => "disconnected-mid-call",
            Self::CircuitOpen => "circuit-open",
        }
    }
}

impl fmt::Display for TransportFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one node call. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeResult {
    Success { status: u16, payload: Bytes },
    ApplicationError { status: u16, payload: Bytes },
    TransportFailure(TransportFailureReason),
}

impl NodeResult {
    /// Classify a status code the node answered with.
    pub fn from_response(kind: OperationKind, status: u16, payload: Bytes) -> Self {
        let accepted = (200..300).contains(&status) || (kind.is_claim() && status == NODE_CONTINUE_STATUS);
        if accepted {
            Self::Success { status, payload }
        } else {
            Self::ApplicationError { status, payload }
        }
    }

    pub fn timeout() -> Self {
        Self::TransportFailure(TransportFailureReason::Timeout)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Whether the node actually answered. Only these are safe to replay.
    pub fn is_node_answer(&self) -> bool {
        !matches!(self, Self::TransportFailure(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Success { status, .. } | Self::ApplicationError { status, .. } => Some(*status),
            Self::TransportFailure(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Success { payload, .. } | Self::ApplicationError { payload, .. } => Some(payload),
            Self::TransportFailure(_) => None,
        }
    }

    pub fn failure_reason(&self) -> Option<TransportFailureReason> {
        match self {
            Self::TransportFailure(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::ApplicationError { .. } => "application_error",
            Self::TransportFailure(reason) => reason.as_str(),
        }
    }
}

impl fmt::Display for NodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { status, .. } => write!(f, "success ({status})"),
            Self::ApplicationError { status, payload } => {
                write!(f, "application error ({status})")?;
                if !payload.is_empty() {
                    write!(f, ": {}", String::from_utf8_lossy(payload))?;
                }
                Ok(())
            }
            Self::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

/// Upload body attached to an upload claim.
#[derive(Debug, Clone)]
pub struct UploadBody {
    pub staged: StagedUpload,
    pub metadata: UploadMetadata,
}

/// One phase call as sent to a node.
#[derive(Debug, Clone)]
pub struct NodeCall {
    pub operation_id: OperationId,
    /// Phase of this call (`MutationCommit` for the commit of an upload, etc).
    pub kind: OperationKind,
    /// Caller request replayed on the node.
    pub request: Arc<RequestPayload>,
    /// Request body sent with this phase.
    pub body: Option<Bytes>,
    /// Present on upload claims only.
    pub upload: Option<UploadBody>,
}

impl NodeCall {
    /// Build the call for one phase of `operation`.
    ///
    /// Reads, claims and commits replay the request body. Cancels carry none.
    /// Upload bytes go out with the upload claim only; its commit and cancel
    /// carry the operation id alone.
    pub fn for_phase(operation: &ReplicatedOperation, kind: OperationKind, upload: Option<&UploadBody>) -> Self {
        let is_upload = operation.kind() == OperationKind::StreamedUpload;
        let body = match kind {
            OperationKind::Read | OperationKind::MutationClaim => operation.payload().body.clone(),
            OperationKind::MutationCommit if !is_upload => operation.payload().body.clone(),
            _ => None,
        };
        let upload = if kind == OperationKind::StreamedUpload {
            upload.cloned()
        } else {
            None
        };
        Self {
            operation_id: operation.id(),
            kind,
            request: Arc::clone(operation.payload()),
            body,
            upload,
        }
    }

    /// Replication headers for this call, in send order.
    pub fn phase_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (TRANSACTION_ID_HEADER, self.operation_id.to_string()),
            (PHASE_HEADER, self.kind.wire_name().to_string()),
        ];
        if self.kind == OperationKind::MutationCancel {
            headers.push((CANCEL_HEADER, "true".to_string()));
        }
        if let Some(upload) = &self.upload {
            headers.push((FILENAME_HEADER, upload.metadata.filename.clone()));
            headers.push((CONTENT_TYPE_HEADER, upload.metadata.content_type.clone()));
            headers.push((CHECKSUM_HEADER, upload.staged.sha256().to_string()));
        }
        headers
    }
}

/// Whether a caller header must not be replayed as is.
///
/// Replication headers are set by the engine; framing headers by the client.
pub fn is_reserved_header(name: &str) -> bool {
    [
        TRANSACTION_ID_HEADER,
        PHASE_HEADER,
        CANCEL_HEADER,
        CHECKSUM_HEADER,
        "Content-Length",
        "Host",
        "Transfer-Encoding",
        "Connection",
    ]
    .iter()
    .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Phase identification as seen by a receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseHeaders {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub cancel: bool,
}

/// Parse the replication headers of an incoming call.
///
/// Returns `None` when the call is not a replicated one. Header names are
/// matched case-insensitively.
pub fn parse_phase_headers<'a, I>(headers: I) -> Option<PhaseHeaders>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut operation_id = None;
    let mut kind = None;
    let mut cancel = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(TRANSACTION_ID_HEADER) {
            operation_id = value.parse::<OperationId>().ok();
        } else if name.eq_ignore_ascii_case(PHASE_HEADER) {
            kind = OperationKind::from_wire(value);
        } else if name.eq_ignore_ascii_case(CANCEL_HEADER) {
            cancel = value.trim().eq_ignore_ascii_case("true");
        }
    }

    Some(PhaseHeaders {
        operation_id: operation_id?,
        kind: kind?,
        cancel,
    })
}

/// Performs node calls.
///
/// Implementations must capture every failure as a [`NodeResult`] and must
/// not retry; the coordinator applies timeouts around them.
pub trait NodeTransport: Send + Sync + 'static {
    /// Execute exactly one attempt of `call` against `target`.
    fn call<'a>(&'a self, target: &'a NodeTarget, call: &'a NodeCall) -> BoxFuture<'a, NodeResult>;
}

impl<T: NodeTransport + ?Sized> NodeTransport for Arc<T> {
    fn call<'a>(&'a self, target: &'a NodeTarget, call: &'a NodeCall) -> BoxFuture<'a, NodeResult> {
        (**self).call(target, call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation() -> ReplicatedOperation {
        ReplicatedOperation::new(
            OperationKind::MutationClaim,
            RequestPayload::put("/flow/processors/p1", "{}"),
            crate::operation::TargetScope::AllNodes,
        )
    }

    #[test]
    fn test_classify_success_and_errors() {
        let ok = NodeResult::from_response(OperationKind::Read, 200, Bytes::from_static(b"{}"));
        assert!(ok.is_success());
        let conflict = NodeResult::from_response(OperationKind::MutationClaim, 409, Bytes::new());
        assert!(matches!(conflict, NodeResult::ApplicationError { status: 409, .. }));
        assert!(conflict.is_node_answer());
        let server = NodeResult::from_response(OperationKind::MutationCommit, 500, Bytes::new());
        assert!(!server.is_success());
    }

    #[test]
    fn test_node_continue_only_counts_for_claims() {
        assert!(NodeResult::from_response(OperationKind::MutationClaim, 150, Bytes::new()).is_success());
        assert!(NodeResult::from_response(OperationKind::StreamedUpload, 150, Bytes::new()).is_success());
        assert!(!NodeResult::from_response(OperationKind::MutationCommit, 150, Bytes::new()).is_success());
        assert!(!NodeResult::from_response(OperationKind::Read, 150, Bytes::new()).is_success());
    }

    #[test]
    fn test_transport_failure_accessors() {
        let failure = NodeResult::timeout();
        assert!(!failure.is_node_answer());
        assert_eq!(failure.status(), None);
        assert_eq!(failure.failure_reason(), Some(TransportFailureReason::Timeout));
        assert_eq!(failure.outcome_label(), "timeout");
        assert_eq!(failure.to_string(), "transport failure: timeout");
    }

    #[test]
    fn test_application_error_display_includes_body() {
        let err = NodeResult::ApplicationError {
            status: 409,
            payload: Bytes::from_static(b"revision mismatch"),
        };
        assert_eq!(err.to_string(), "application error (409): revision mismatch");
    }

    #[test]
    fn test_phase_headers_for_cancel() {
        let c = NodeCall::for_phase(&mutation(), OperationKind::MutationCancel, None);
        let headers = c.phase_headers();
        assert!(headers.contains(&(PHASE_HEADER, "cancel".to_string())));
        assert!(headers.contains(&(CANCEL_HEADER, "true".to_string())));
        assert!(c.body.is_none());
    }

    #[test]
    fn test_mutation_phases_replay_body() {
        let op = mutation();
        for kind in [OperationKind::MutationClaim, OperationKind::MutationCommit] {
            let c = NodeCall::for_phase(&op, kind, None);
            assert_eq!(c.body.as_deref(), Some(b"{}".as_slice()));
            assert_eq!(c.operation_id, op.id());
        }
    }

    #[test]
    fn test_upload_body_on_claim_only() {
        let op = ReplicatedOperation::upload(
            RequestPayload::new("POST", "/assets"),
            UploadMetadata::new("lib.nar"),
            crate::operation::TargetScope::AllNodes,
        );
        let upload = UploadBody {
            staged: StagedUpload::from_bytes(Bytes::from_static(b"nar-bytes"), 1024).unwrap(),
            metadata: UploadMetadata::new("lib.nar"),
        };

        let claim = NodeCall::for_phase(&op, OperationKind::StreamedUpload, Some(&upload));
        assert!(claim.upload.is_some());
        let headers = claim.phase_headers();
        assert!(headers.contains(&(PHASE_HEADER, "upload".to_string())));
        assert!(headers.contains(&(FILENAME_HEADER, "lib.nar".to_string())));
        assert!(headers.contains(&(CONTENT_TYPE_HEADER, "application/octet-stream".to_string())));
        assert!(headers.contains(&(CHECKSUM_HEADER, upload.staged.sha256().to_string())));

        let commit = NodeCall::for_phase(&op, OperationKind::MutationCommit, Some(&upload));
        assert!(commit.upload.is_none());
        assert!(commit.body.is_none());
        assert!(!commit.phase_headers().iter().any(|(k, _)| *k == FILENAME_HEADER));
    }

    #[test]
    fn test_reserved_headers() {
        assert!(is_reserved_header("x-replication-phase"));
        assert!(is_reserved_header("content-length"));
        assert!(!is_reserved_header("Authorization"));
        assert!(!is_reserved_header("Filename"));
    }

    #[test]
    fn test_parse_phase_headers_roundtrip() {
        let c = NodeCall::for_phase(&mutation(), OperationKind::MutationCancel, None);
        let sent = c.phase_headers();
        let parsed = parse_phase_headers(sent.iter().map(|(k, v)| (*k, v.as_str()))).unwrap();
        assert_eq!(parsed.operation_id, c.operation_id);
        assert_eq!(parsed.kind, OperationKind::MutationCancel);
        assert!(parsed.cancel);
    }

    #[test]
    fn test_parse_phase_headers_missing_or_invalid() {
        assert!(parse_phase_headers([("X-Replication-Phase", "claim")]).is_none());
        assert!(parse_phase_headers([
            ("x-request-transaction-id", "nope"),
            ("x-replication-phase", "claim"),
        ])
        .is_none());
    }
}
