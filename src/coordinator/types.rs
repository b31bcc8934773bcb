//! Coordinator state types.
//!
//! # Operation Phases
//!
//! ```text
//!                 all claims Success
//! PENDING_CLAIM ─────────────────────→ CLAIMED ──→ COMMITTING ──→ COMMITTED
//!       │
//!       │ any ApplicationError / TransportFailure / claim timeout
//!       ├────────────────────────────→ CLAIM_FAILED ──→ CANCELLING ──→ CANCELLED
//!       │
//!       │ operation deadline
//!       └────────────────────────────→ ABORTED_TIMEOUT
//!
//! READING ──→ READ_COMPLETE            (reads skip the two-phase protocol)
//! ```
//!
//! Terminal: COMMITTED, CANCELLED, ABORTED_TIMEOUT, READ_COMPLETE.
//!
//! # Engine States
//!
//! ```text
//! Running ──shutdown()──→ ShuttingDown ──(in-flight drained)──→ Stopped
//! ```

use crate::node::{NodeConnectionState, NodeId};
use std::fmt;

/// Phase of one replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PendingClaim,
    Claimed,
    Committing,
    Committed,
    ClaimFailed,
    Cancelling,
    Cancelled,
    AbortedTimeout,
    Reading,
    ReadComplete,
}

impl Phase {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Cancelled | Self::AbortedTimeout | Self::ReadComplete
        )
    }

    /// Whether `next` is a legal successor of this phase.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (PendingClaim, Claimed)
                | (PendingClaim, ClaimFailed)
                | (PendingClaim, AbortedTimeout)
                | (Claimed, Committing)
                | (Committing, Committed)
                | (ClaimFailed, Cancelling)
                | (Cancelling, Cancelled)
                | (Reading, ReadComplete)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingClaim => "PENDING_CLAIM",
            Self::Claimed => "CLAIMED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::ClaimFailed => "CLAIM_FAILED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::AbortedTimeout => "ABORTED_TIMEOUT",
            Self::Reading => "READING",
            Self::ReadComplete => "READ_COMPLETE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting operations.
    Running,

    /// `shutdown()` called. New submissions are rejected, in-flight
    /// operations are running to completion.
    ShuttingDown,

    /// All in-flight operations finished (or the drain timed out).
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Health of one node as seen by the engine.
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub node_id: NodeId,
    pub state: NodeConnectionState,
    /// Whether the node's circuit breaker is open (always false with circuits off).
    pub circuit_open: bool,
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached state only, never from network calls.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Accepting operations and at least one node is connected.
    pub ready: bool,
    /// Ready and no node is disconnected or circuit-open.
    pub healthy: bool,
    pub nodes_total: usize,
    pub nodes_connected: usize,
    pub nodes_disconnected: usize,
    pub nodes_starting: usize,
    pub nodes_circuit_open: usize,
    pub in_flight_operations: usize,
    pub nodes: Vec<NodeHealth>,
}
