//! Mock NodeTransport for testing.
//!
//! Records every call with its phase, body and upload checksum. Responses
//! are scripted per (node, phase); unscripted calls answer 200 with
//! [`DEFAULT_PAYLOAD`]. Upload claims are read to the end like a real
//! receiving node would, and the checksum of what arrived is recorded.

use bytes::Bytes;
use cluster_replicator::transport::BoxFuture;
use cluster_replicator::{
    NodeCall, NodeResult, NodeTarget, NodeTransport, OperationId, OperationKind, TransportFailureReason,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const DEFAULT_PAYLOAD: &[u8] = br#"{"revision":1}"#;

/// Scripted reaction of one node to one phase.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer with a status and body (classified like the wire would).
    Respond { status: u16, payload: Bytes },
    /// Answer after a delay.
    Delayed { delay: Duration, status: u16, payload: Bytes },
    /// Fail at the transport level.
    Fail(TransportFailureReason),
    /// Never answer.
    Hang,
}

impl Behavior {
    pub fn ok(payload: &'static str) -> Self {
        Self::Respond {
            status: 200,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    pub fn status(status: u16, payload: &'static str) -> Self {
        Self::Respond {
            status,
            payload: Bytes::from_static(payload.as_bytes()),
        }
    }

    pub fn delayed_ms(ms: u64) -> Self {
        Self::Delayed {
            delay: Duration::from_millis(ms),
            status: 200,
            payload: Bytes::from_static(DEFAULT_PAYLOAD),
        }
    }
}

/// A recorded transport call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub node_id: String,
    pub kind: OperationKind,
    pub operation_id: OperationId,
    pub body: Option<Bytes>,
    /// Checksum the sender announced for an upload.
    pub announced_sha256: Option<String>,
    /// Checksum of the upload bytes actually read.
    pub received_sha256: Option<String>,
    pub received_len: u64,
}

/// Mock implementation of NodeTransport that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockTransport::new();
/// mock.script("node-3", OperationKind::MutationClaim, Behavior::status(409, "conflict"));
///
/// // Use in tests...
///
/// assert_eq!(mock.nodes_called(OperationKind::MutationCancel), vec!["node-1", "node-2"]);
/// ```
#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<HashMap<(String, OperationKind), Behavior>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a node's reaction to a phase.
    pub fn script(&self, node_id: &str, kind: OperationKind, behavior: Behavior) {
        self.rules
            .lock()
            .unwrap()
            .insert((node_id.to_string(), kind), behavior);
    }

    /// Builder form of [`script`](Self::script).
    pub fn with(self, node_id: &str, kind: OperationKind, behavior: Behavior) -> Self {
        self.script(node_id, kind, behavior);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, kind: OperationKind) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    /// Sorted IDs of the nodes that received a phase.
    pub fn nodes_called(&self, kind: OperationKind) -> Vec<String> {
        let mut nodes: Vec<String> = self.calls_for(kind).into_iter().map(|c| c.node_id).collect();
        nodes.sort();
        nodes
    }

    pub fn call_count(&self, node_id: &str, kind: OperationKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.node_id == node_id && c.kind == kind)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn behavior(&self, node_id: &str, kind: OperationKind) -> Option<Behavior> {
        self.rules
            .lock()
            .unwrap()
            .get(&(node_id.to_string(), kind))
            .cloned()
    }

    async fn handle(&self, target: &NodeTarget, call: &NodeCall) -> NodeResult {
        let mut recorded = RecordedCall {
            node_id: target.id.to_string(),
            kind: call.kind,
            operation_id: call.operation_id,
            body: call.body.clone(),
            announced_sha256: None,
            received_sha256: None,
            received_len: 0,
        };

        // Simulated receiver: consume the upload body as the node would
        if let Some(upload) = &call.upload {
            recorded.announced_sha256 = Some(upload.staged.sha256().to_string());
            match upload.staged.open().await {
                Ok(mut reader) => {
                    let mut hasher = Sha256::new();
                    let mut chunk = vec![0u8; 64 * 1024];
                    loop {
                        match reader.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => {
                                hasher.update(&chunk[..n]);
                                recorded.received_len += n as u64;
                            }
                            Err(_) => return NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall),
                        }
                    }
                    recorded.received_sha256 = Some(hex::encode(hasher.finalize()));
                }
                Err(_) => return NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall),
            }
        }
        self.calls.lock().unwrap().push(recorded);

        match self.behavior(target.id.as_str(), call.kind) {
            None => NodeResult::from_response(call.kind, 200, Bytes::from_static(DEFAULT_PAYLOAD)),
            Some(Behavior::Respond { status, payload }) => NodeResult::from_response(call.kind, status, payload),
            Some(Behavior::Delayed { delay, status, payload }) => {
                tokio::time::sleep(delay).await;
                NodeResult::from_response(call.kind, status, payload)
            }
            Some(Behavior::Fail(reason)) => NodeResult::TransportFailure(reason),
            Some(Behavior::Hang) => std::future::pending().await,
        }
    }
}

impl NodeTransport for MockTransport {
    fn call<'a>(&'a self, target: &'a NodeTarget, call: &'a NodeCall) -> BoxFuture<'a, NodeResult> {
        Box::pin(self.handle(target, call))
    }
}
