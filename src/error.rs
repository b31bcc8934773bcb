// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the request replicator.
//!
//! Only errors that make the `submit` call itself fail live here. Everything
//! that goes wrong on a node (rejections, timeouts, refused connections) is
//! data inside a [`MergedResponse`](crate::merge::MergedResponse), never an
//! `Err`.
//!
//! # Error Categories
//!
//! | Error Type | Programmer error | Description |
//! |------------|------------------|-------------|
//! | `EmptyScope` | Yes | Target scope names no nodes |
//! | `MissingPayload` | Yes | Mutation/upload submitted without a body |
//! | `InvalidOperation` | Yes | Kind/payload combination not accepted from callers |
//! | `UnknownNode` | Yes | Scope names a node the registry does not know |
//! | `UploadTooLarge` | Yes | Upload exceeds the configured bound |
//! | `Config` | Yes | Configuration invalid |
//! | `Staging` | No | Local I/O failure while materializing an upload |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Programmer errors fail fast and must not be retried as-is; see
//! [`ReplicationError::is_programmer_error()`].

use crate::node::NodeId;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that fail a submission before (or instead of) any node result.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The declared target scope resolved to no node at all.
    #[error("Target scope is empty")]
    EmptyScope,

    /// A mutating operation or upload carried no payload.
    #[error("Operation {operation_id} has no payload")]
    MissingPayload { operation_id: String },

    /// The operation cannot be accepted from a caller as built.
    ///
    /// Raised for coordinator-internal phase kinds (commit, cancel) and for
    /// kind/body mismatches such as an upload without an upload body.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The scope names a node the registry has never heard of.
    #[error("Unknown node in scope: {0}")]
    UnknownNode(NodeId),

    /// The upload source produced more bytes than allowed.
    #[error("Upload exceeds limit of {limit} bytes")]
    UploadTooLarge { limit: u64 },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local failure while staging an upload body.
    ///
    /// Nothing was sent to any node when this is returned.
    #[error("Upload staging failed ({message}): {source}")]
    Staging {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine is shutting down and accepts no new operations.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a staging error from an I/O error.
    pub fn staging(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Staging {
            message: message.into(),
            source,
        }
    }

    /// Check if this error is caused by invalid caller input.
    pub fn is_programmer_error(&self) -> bool {
        match self {
            Self::EmptyScope => true,
            Self::MissingPayload { .. } => true,
            Self::InvalidOperation(_) => true,
            Self::UnknownNode(_) => true,
            Self::UploadTooLarge { .. } => true,
            Self::Config(_) => true,
            Self::Staging { .. } => false, // Local disk trouble, not the caller
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
