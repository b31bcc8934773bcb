//! Replicated operations: what the caller asked for, frozen at submission.
//!
//! A [`ReplicatedOperation`] is created once per inbound request and never
//! changes afterwards. Every phase call sent to every node is derived from it
//! and carries the same [`OperationId`], so a receiving node can correlate
//! claim, commit and cancel.
//!
//! # Operation Kinds
//!
//! | Kind | Submitted by | Wire phase | Two-phase |
//! |------|--------------|------------|-----------|
//! | `Read` | caller | `read` | no |
//! | `MutationClaim` | caller | `claim` | yes (starts it) |
//! | `MutationCommit` | coordinator | `commit` | - |
//! | `MutationCancel` | coordinator | `cancel` | - |
//! | `StreamedUpload` | caller | `upload` | yes (body on claim) |

use crate::error::{ReplicationError, Result};
use crate::node::NodeId;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Content type every replicated upload body is sent with.
pub const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// Identifier shared by every phase call of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a fresh random ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Kind of a replicated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Read,
    MutationClaim,
    MutationCommit,
    MutationCancel,
    StreamedUpload,
}

impl OperationKind {
    /// Phase name used on the wire (`X-Replication-Phase`).
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::MutationClaim => "claim",
            Self::MutationCommit => "commit",
            Self::MutationCancel => "cancel",
            Self::StreamedUpload => "upload",
        }
    }

    /// Parse a wire phase name (case-insensitive).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "claim" => Some(Self::MutationClaim),
            "commit" => Some(Self::MutationCommit),
            "cancel" => Some(Self::MutationCancel),
            "upload" => Some(Self::StreamedUpload),
            _ => None,
        }
    }

    /// Whether this kind goes through claim → commit/cancel.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Whether this kind may be submitted by a caller.
    ///
    /// Commit and cancel are issued by the coordinator only.
    pub fn is_caller_submittable(&self) -> bool {
        matches!(self, Self::Read | Self::MutationClaim | Self::StreamedUpload)
    }

    /// Whether a node may answer this kind with the node-continue status.
    pub fn is_claim(&self) -> bool {
        matches!(self, Self::MutationClaim | Self::StreamedUpload)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The request replayed on every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPayload {
    /// HTTP method, e.g. `PUT`.
    pub method: String,
    /// Path and query relative to the node address, e.g. `/flow/processors/abc`.
    pub path: String,
    /// Caller headers, replayed in order.
    pub headers: Vec<(String, String)>,
    /// Request body. Required for mutations.
    pub body: Option<Bytes>,
}

impl RequestPayload {
    /// Create a payload with no headers and no body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `GET` without body.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    /// `PUT` with a body.
    pub fn put(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("PUT", path).with_body(body)
    }

    /// `POST` with a body.
    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", path).with_body(body)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reject payloads no node could interpret.
    pub fn validate(&self) -> Result<()> {
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ReplicationError::InvalidOperation(format!(
                "invalid method '{}'",
                self.method
            )));
        }
        if !self.path.starts_with('/') {
            return Err(ReplicationError::InvalidOperation(format!(
                "path must start with '/': '{}'",
                self.path
            )));
        }
        for (name, value) in &self.headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ReplicationError::InvalidOperation(format!("invalid header name '{name}'")));
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(ReplicationError::InvalidOperation(format!(
                    "invalid value for header '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Which nodes an operation is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetScope {
    /// Every node the registry knows.
    #[default]
    AllNodes,
    /// An explicit subset.
    Nodes(BTreeSet<NodeId>),
}

impl TargetScope {
    /// Scope naming the given nodes.
    pub fn nodes<I, N>(ids: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        Self::Nodes(ids.into_iter().map(Into::into).collect())
    }

    /// Whether the scope names no node at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Nodes(ids) if ids.is_empty())
    }

    /// Whether the node is in scope.
    pub fn includes(&self, node_id: &NodeId) -> bool {
        match self {
            Self::AllNodes => true,
            Self::Nodes(ids) => ids.contains(node_id),
        }
    }
}

/// Out-of-band metadata of an upload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    /// Sent as the `Filename` header.
    pub filename: String,
    /// Sent as `Content-Type`. Defaults to [`UPLOAD_CONTENT_TYPE`].
    pub content_type: String,
}

impl UploadMetadata {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content_type: UPLOAD_CONTENT_TYPE.to_string(),
        }
    }

    /// Both fields travel as header values.
    pub fn validate(&self) -> Result<()> {
        if self.filename.is_empty() || HeaderValue::from_str(&self.filename).is_err() {
            return Err(ReplicationError::InvalidOperation(format!(
                "invalid upload filename {:?}",
                self.filename
            )));
        }
        if HeaderValue::from_str(&self.content_type).is_err() {
            return Err(ReplicationError::InvalidOperation(format!(
                "invalid upload content type {:?}",
                self.content_type
            )));
        }
        Ok(())
    }
}

/// Where upload bytes come from.
pub enum UploadSource {
    /// Already in memory. Shared by every node without copying.
    Buffered(Bytes),
    /// Readable once. Materialized before any node is contacted.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl UploadSource {
    /// Wrap a single-pass reader.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Stream(Box::new(reader))
    }

    /// Whether the source can be read more than once.
    pub fn is_rewindable(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        Self::Buffered(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffered(Bytes::from(bytes))
    }
}

/// One logical caller request.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone)]
pub struct ReplicatedOperation {
    id: OperationId,
    kind: OperationKind,
    payload: Arc<RequestPayload>,
    scope: TargetScope,
    upload: Option<UploadMetadata>,
}

impl ReplicatedOperation {
    /// Create an operation with a fresh ID.
    pub fn new(kind: OperationKind, payload: RequestPayload, scope: TargetScope) -> Self {
        Self::with_id(OperationId::new(), kind, payload, scope)
    }

    /// Create an operation with a known ID (resubmission, redelivery).
    pub fn with_id(
        id: OperationId,
        kind: OperationKind,
        payload: RequestPayload,
        scope: TargetScope,
    ) -> Self {
        let upload = if kind == OperationKind::StreamedUpload {
            payload
                .header(crate::transport::FILENAME_HEADER)
                .map(UploadMetadata::new)
        } else {
            None
        };
        Self {
            id,
            kind,
            payload: Arc::new(payload),
            scope,
            upload,
        }
    }

    /// Create an upload operation.
    ///
    /// `payload` carries method/path/headers; the bytes come from the
    /// [`UploadSource`] handed to the engine.
    pub fn upload(payload: RequestPayload, metadata: UploadMetadata, scope: TargetScope) -> Self {
        Self {
            id: OperationId::new(),
            kind: OperationKind::StreamedUpload,
            payload: Arc::new(payload),
            scope,
            upload: Some(metadata),
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn payload(&self) -> &Arc<RequestPayload> {
        &self.payload
    }

    pub fn scope(&self) -> &TargetScope {
        &self.scope
    }

    pub fn upload_metadata(&self) -> Option<&UploadMetadata> {
        self.upload.as_ref()
    }

    /// Check the operation can be accepted from a caller.
    ///
    /// `has_upload_source` tells whether an upload body arrives out of band.
    pub fn validate(&self, has_upload_source: bool) -> Result<()> {
        if !self.kind.is_caller_submittable() {
            return Err(ReplicationError::InvalidOperation(format!(
                "{} is issued by the coordinator, not by callers",
                self.kind
            )));
        }
        if self.scope.is_empty() {
            return Err(ReplicationError::EmptyScope);
        }
        self.payload.validate()?;

        match self.kind {
            OperationKind::Read => Ok(()),
            OperationKind::MutationClaim => {
                if self.payload.body.is_none() {
                    return Err(ReplicationError::MissingPayload {
                        operation_id: self.id.to_string(),
                    });
                }
                Ok(())
            }
            OperationKind::StreamedUpload => {
                let Some(upload) = &self.upload else {
                    return Err(ReplicationError::InvalidOperation(
                        "upload without filename metadata".to_string(),
                    ));
                };
                upload.validate()?;
                if !has_upload_source && self.payload.body.is_none() {
                    return Err(ReplicationError::MissingPayload {
                        operation_id: self.id.to_string(),
                    });
                }
                Ok(())
            }
            OperationKind::MutationCommit | OperationKind::MutationCancel => Ok(()),
        }
    }
}
