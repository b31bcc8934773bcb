//! HTTP node transport over reqwest.
//!
//! Replays the caller's request on `<node address><path>` with the
//! replication headers added. Upload claims stream the staged body: memory
//! uploads share the same `Bytes`, spilled uploads open a fresh file reader
//! per node.
//!
//! The client has no overall request timeout of its own; the coordinator
//! bounds every call with the per-call timeout and the phase deadline.

use super::{is_reserved_header, BoxFuture, NodeCall, NodeResult, NodeTransport, TransportFailureReason};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::node::NodeTarget;
use bytes::Bytes;
use reqwest::{Body, Client, Method};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Node transport speaking HTTP.
#[derive(Debug, Clone)]
pub struct HttpNodeTransport {
    client: Client,
}

impl HttpNodeTransport {
    /// Build a transport whose connect timeout follows the per-call timeout.
    pub fn new(config: &ReplicatorConfig) -> Result<Self> {
        Self::with_connect_timeout(config.call_timeout_duration())
    }

    /// Build a transport with an explicit connect timeout.
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("cluster-replicator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (TLS identities, proxies).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn execute(&self, target: &NodeTarget, call: &NodeCall) -> NodeResult {
        let method = match Method::from_bytes(call.request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                // Rejected locally, the node never saw it
                return NodeResult::ApplicationError {
                    status: 400,
                    payload: Bytes::from(format!("invalid method '{}'", call.request.method)),
                };
            }
        };
        let url = format!("{}{}", target.address.trim_end_matches('/'), call.request.path);

        let mut request = self.client.request(method, &url);
        for (name, value) in &call.request.headers {
            if is_reserved_header(name) {
                continue;
            }
            if call.upload.is_some() && name.eq_ignore_ascii_case(super::CONTENT_TYPE_HEADER) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in call.phase_headers() {
            request = request.header(name, value);
        }

        if let Some(upload) = &call.upload {
            let body = match upload.staged.as_bytes() {
                Some(bytes) => Body::from(bytes.clone()),
                None => match upload.staged.open().await {
                    Ok(reader) => Body::wrap_stream(ReaderStream::new(reader)),
                    Err(e) => {
                        warn!(node_id = %target.id, error = %e, "Failed to open staged upload");
                        return NodeResult::ApplicationError {
                            status: 500,
                            payload: Bytes::from(format!("staged upload unreadable: {e}")),
                        };
                    }
                },
            };
            request = request
                .header(reqwest::header::CONTENT_LENGTH, upload.staged.len())
                .body(body);
        } else if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_error(target, &e),
        };

        let status = response.status().as_u16();
        match response.bytes().await {
            Ok(payload) => NodeResult::from_response(call.kind, status, payload),
            Err(e) => classify_error(target, &e),
        }
    }
}

fn classify_error(target: &NodeTarget, err: &reqwest::Error) -> NodeResult {
    if err.is_builder() {
        // Malformed header or URL, nothing reached the node
        warn!(node_id = %target.id, error = %err, "Request rejected before sending");
        return NodeResult::ApplicationError {
            status: 400,
            payload: Bytes::from(format!("request rejected locally: {err}")),
        };
    }
    let reason = if err.is_timeout() {
        TransportFailureReason::Timeout
    } else if err.is_connect() {
        TransportFailureReason::ConnectionRefused
    } else {
        TransportFailureReason::DisconnectedMidCall
    };
    debug!(node_id = %target.id, address = %target.address, error = %err, reason = %reason, "Node call failed");
    NodeResult::TransportFailure(reason)
}

impl NodeTransport for HttpNodeTransport {
    fn call<'a>(&'a self, target: &'a NodeTarget, call: &'a NodeCall) -> BoxFuture<'a, NodeResult> {
        Box::pin(self.execute(target, call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, ReplicatedOperation, RequestPayload, TargetScope};

    #[test]
    fn test_build_from_config() {
        let config = ReplicatorConfig::for_testing("node-1");
        assert!(HttpNodeTransport::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpNodeTransport::with_connect_timeout(Duration::from_secs(2)).unwrap();
        let target = NodeTarget::connected("node-1", format!("http://{addr}"));
        let op = ReplicatedOperation::new(OperationKind::Read, RequestPayload::get("/flow"), TargetScope::AllNodes);
        let call = NodeCall::for_phase(&op, OperationKind::Read, None);

        let result = transport.call(&target, &call).await;
        assert_eq!(
            result,
            NodeResult::TransportFailure(TransportFailureReason::ConnectionRefused)
        );
    }

    #[tokio::test]
    async fn test_invalid_method_rejected_locally() {
        let transport = HttpNodeTransport::with_connect_timeout(Duration::from_secs(1)).unwrap();
        let target = NodeTarget::connected("node-1", "http://127.0.0.1:9");
        let op = ReplicatedOperation::new(
            OperationKind::Read,
            RequestPayload::new("BAD METHOD", "/flow"),
            TargetScope::AllNodes,
        );
        let call = NodeCall::for_phase(&op, OperationKind::Read, None);

        let result = transport.call(&target, &call).await;
        assert!(matches!(result, NodeResult::ApplicationError { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_malformed_header_rejected_locally() {
        let transport = HttpNodeTransport::with_connect_timeout(Duration::from_secs(1)).unwrap();
        let target = NodeTarget::connected("node-1", "http://127.0.0.1:9");
        // Built without validation, as a caller bypassing the engine would
        let op = ReplicatedOperation::new(
            OperationKind::Read,
            RequestPayload::get("/flow").with_header("Bad Header", "1"),
            TargetScope::AllNodes,
        );
        let call = NodeCall::for_phase(&op, OperationKind::Read, None);

        let result = transport.call(&target, &call).await;
        assert!(result.is_node_answer());
        assert_eq!(result.status(), Some(400));
        assert!(result.failure_reason().is_none());
    }
}
