//! Phase coordinator: drives one context to a terminal phase.
//!
//! # Reads
//!
//! One fan-out, then READ_COMPLETE. Nodes cut off by the deadline are
//! recorded as timeouts.
//!
//! # Mutations
//!
//! ```text
//! claim fan-out ──all Success──→ commit fan-out ──→ COMMITTED
//!       │
//!       ├──any failure / claim timeout──→ cancel fan-out (claimed nodes) ──→ CANCELLED
//!       │
//!       └──operation deadline──→ ABORTED_TIMEOUT + best-effort cancel
//! ```
//!
//! Commit is only sent after every claim slot holds `Success`; the context
//! refuses the transition otherwise. Commit failures are recorded, never
//! compensated: already committed nodes stay committed and the response
//! reports the partial failure.
//!
//! Deadline expiry after the commit/cancel decision does not abort: the
//! decision stands, pending nodes become timeouts with unknown outcome.

use super::context::ReplicationContext;
use super::fan_out::{Dispatcher, PhaseOutcome};
use super::types::Phase;
use crate::error::Result;
use crate::node::NodeId;
use crate::operation::OperationKind;
use crate::transport::{NodeCall, NodeResult, TransportFailureReason};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a phase's unresolved nodes end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slots {
    Primary,
    Commit,
    Cancel,
}

/// Runs read and two-phase mutation protocols over a [`Dispatcher`].
#[derive(Clone)]
pub struct PhaseCoordinator {
    dispatcher: Dispatcher,
    claim_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl PhaseCoordinator {
    pub fn new(dispatcher: Dispatcher, claim_timeout: Option<Duration>, cancel_grace: Duration) -> Self {
        Self {
            dispatcher,
            claim_timeout,
            cancel_grace,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Drive `ctx` to a terminal phase.
    pub async fn run(&self, ctx: &mut ReplicationContext) -> Result<()> {
        if ctx.operation().kind().is_mutation() {
            self.run_mutation(ctx).await
        } else {
            self.run_read(ctx).await
        }
    }

    async fn run_read(&self, ctx: &mut ReplicationContext) -> Result<()> {
        let call = NodeCall::for_phase(ctx.operation(), OperationKind::Read, None);
        let outcome = self.dispatcher.broadcast(ctx.targets(), call, ctx.deadline()).await;
        apply(ctx, Slots::Primary, outcome, false);
        ctx.advance(Phase::ReadComplete)
    }

    async fn run_mutation(&self, ctx: &mut ReplicationContext) -> Result<()> {
        if ctx.targets().is_empty() {
            // Nothing to claim: a vacuous unanimous claim must not commit
            debug!(operation_id = %ctx.operation().id(), "No connected targets, cancelling");
            ctx.advance(Phase::ClaimFailed)?;
            ctx.advance(Phase::Cancelling)?;
            return ctx.advance(Phase::Cancelled);
        }

        let claim_deadline = self.claim_deadline(ctx);
        let claim_kind = ctx.operation().kind();
        let call = NodeCall::for_phase(ctx.operation(), claim_kind, ctx.upload());
        let outcome = self.dispatcher.broadcast(ctx.targets(), call, claim_deadline).await;

        let aborted = outcome.deadline_hit && claim_deadline >= ctx.deadline();
        apply(ctx, Slots::Primary, outcome, aborted);

        if aborted {
            return self.abort(ctx).await;
        }

        if ctx.primary().all_success() {
            self.commit(ctx).await
        } else {
            self.cancel(ctx).await
        }
    }

    async fn commit(&self, ctx: &mut ReplicationContext) -> Result<()> {
        ctx.advance(Phase::Claimed)?;
        ctx.advance(Phase::Committing)?;
        ctx.begin_commit();

        let call = NodeCall::for_phase(ctx.operation(), OperationKind::MutationCommit, ctx.upload());
        let outcome = self.dispatcher.broadcast(ctx.targets(), call, ctx.deadline()).await;
        let deadline_hit = outcome.deadline_hit;
        apply(ctx, Slots::Commit, outcome, deadline_hit);

        ctx.advance(Phase::Committed)?;
        let failed = ctx.commit().failures().len();
        if failed > 0 {
            warn!(
                operation_id = %ctx.operation().id(),
                failed,
                committed = ctx.commit().succeeded().len(),
                "Commit failed on some nodes, committed nodes are not rolled back"
            );
        }
        Ok(())
    }

    async fn cancel(&self, ctx: &mut ReplicationContext) -> Result<()> {
        ctx.advance(Phase::ClaimFailed)?;
        let claimed = ctx.primary().succeeded();
        ctx.begin_cancel(&claimed);
        ctx.advance(Phase::Cancelling)?;

        info!(
            operation_id = %ctx.operation().id(),
            failed = ctx.primary().failures().len(),
            cancelling = claimed.len(),
            "Claim rejected, cancelling"
        );

        let targets = ctx.targets_for(&claimed);
        let call = NodeCall::for_phase(ctx.operation(), OperationKind::MutationCancel, None);
        let outcome = self.dispatcher.broadcast(&targets, call, ctx.deadline()).await;
        let deadline_hit = outcome.deadline_hit;
        apply(ctx, Slots::Cancel, outcome, deadline_hit);

        ctx.advance(Phase::Cancelled)
    }

    /// Operation deadline hit during claim: abort, then tell every node that
    /// may hold a claim to drop it.
    async fn abort(&self, ctx: &mut ReplicationContext) -> Result<()> {
        ctx.advance(Phase::AbortedTimeout)?;

        let mut notify: Vec<NodeId> = ctx.primary().succeeded();
        notify.extend(ctx.unknown_outcome().iter().cloned());
        warn!(
            operation_id = %ctx.operation().id(),
            unknown = ctx.unknown_outcome().len(),
            "Operation deadline exceeded during claim, aborting"
        );

        if notify.is_empty() {
            return Ok(());
        }
        ctx.begin_cancel(&notify);
        let targets = ctx.targets_for(&notify);
        let call = NodeCall::for_phase(ctx.operation(), OperationKind::MutationCancel, None);
        let outcome = self
            .dispatcher
            .broadcast(&targets, call, Instant::now() + self.cancel_grace)
            .await;
        // Best effort: record what came back, never mark more unknowns
        apply(ctx, Slots::Cancel, outcome, false);
        Ok(())
    }

    fn claim_deadline(&self, ctx: &ReplicationContext) -> Instant {
        match self.claim_timeout {
            Some(timeout) => (Instant::now() + timeout).min(ctx.deadline()),
            None => ctx.deadline(),
        }
    }
}

/// Record a phase outcome into the context's slots.
///
/// Unresolved nodes become timeouts when the deadline cut them off, or
/// mid-call disconnects when their task was lost. With `mark_unknown`, the
/// nodes cut off by the deadline are also listed as unknown outcome.
fn apply(ctx: &mut ReplicationContext, slots: Slots, outcome: PhaseOutcome, mark_unknown: bool) {
    let filler = if outcome.deadline_hit {
        NodeResult::timeout()
    } else {
        NodeResult::TransportFailure(TransportFailureReason::DisconnectedMidCall)
    };
    if mark_unknown && outcome.deadline_hit {
        for node_id in &outcome.unresolved {
            ctx.mark_unknown(node_id);
        }
    }

    let resolved = outcome.results.into_iter();
    let unresolved = outcome.unresolved.into_iter().map(|id| (id, filler.clone()));
    for (node_id, result) in resolved.chain(unresolved) {
        let recorded = match slots {
            Slots::Primary => ctx.record_primary(&node_id, result),
            Slots::Commit => ctx.record_commit(&node_id, result),
            Slots::Cancel => ctx.record_cancel(&node_id, result),
        };
        if !recorded {
            debug!(node_id = %node_id, "Ignoring result for an already classified slot");
        }
    }
}
