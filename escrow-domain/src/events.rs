//! Domain events for the escrow workflow
//!
//! `WorkflowEvent` is the input alphabet of the agreement state machine.
//! `LifecycleEvent` is the append-only audit trail persisted in the store's
//! event log; recovery debugging and tests read it back.

use crate::entities::{AppStatus, OperationKind};
use crate::ledger::TxRef;
use crate::value_objects::{AgreementId, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State machine input events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Negotiation produced agreed terms (opens the agreement)
    TermsAccepted,
    /// Needer deposited escrow
    Funded,
    /// Provider accepted
    Accepted,
    /// Provider started work
    WorkStarted,
    /// Provider submitted work for review
    SubmittedForReview,
    /// Needer approved the work
    Approved,
    /// Needer requested changes
    ChangesRequested,
    /// Provider withdrew the escrow
    Withdrawn,
    /// Either party cancelled
    Cancelled,
    /// Either party raised a dispute
    Disputed,
}

impl WorkflowEvent {
    /// Get event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::TermsAccepted => "TermsAccepted",
            WorkflowEvent::Funded => "Funded",
            WorkflowEvent::Accepted => "Accepted",
            WorkflowEvent::WorkStarted => "WorkStarted",
            WorkflowEvent::SubmittedForReview => "SubmittedForReview",
            WorkflowEvent::Approved => "Approved",
            WorkflowEvent::ChangesRequested => "ChangesRequested",
            WorkflowEvent::Withdrawn => "Withdrawn",
            WorkflowEvent::Cancelled => "Cancelled",
            WorkflowEvent::Disputed => "Disputed",
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audit events for the agreement lifecycle
///
/// Events are immutable records of what the orchestrator and reconciler
/// observed. They are never replayed to rebuild the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Mirror status changed
    StatusChanged {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Previous status
        from: AppStatus,
        /// New status
        to: AppStatus,
        /// Role that drove the change (None when applied by the reconciler)
        role: Option<Role>,
        /// When the change was persisted
        timestamp: DateTime<Utc>,
    },

    /// Ledger operation submitted, marker written
    OperationSubmitted {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Ledger transaction reference
        tx_ref: TxRef,
        /// When the submission returned
        timestamp: DateTime<Utc>,
    },

    /// Ledger operation confirmed synchronously
    OperationConfirmed {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Ledger transaction reference
        tx_ref: TxRef,
        /// Block that included the transaction
        block_number: u64,
        /// When confirmation was observed
        timestamp: DateTime<Utc>,
    },

    /// Confirmation wait exhausted; marker left for the reconciler
    OperationPending {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Ledger transaction reference
        tx_ref: TxRef,
        /// When the wait was abandoned
        timestamp: DateTime<Utc>,
    },

    /// Ledger operation failed; marker cleared
    OperationFailed {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Failure description
        reason: String,
        /// When the failure was observed
        timestamp: DateTime<Utc>,
    },

    /// Reconciler started working on a marker
    ReconciliationAttempted {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Recorded transaction reference, if any
        tx_ref: Option<TxRef>,
        /// When the attempt started
        timestamp: DateTime<Utc>,
    },

    /// Reconciler found ledger evidence and applied the transition
    ReconciliationRecovered {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Status after the transition
        app_status: AppStatus,
        /// When the recovery was persisted
        timestamp: DateTime<Utc>,
    },

    /// Reconciler found no evidence either way; marker kept
    ReconciliationUnresolved {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// When the attempt ended
        timestamp: DateTime<Utc>,
    },

    /// Ledger reported a revert; marker cleared, status unchanged
    ReconciliationReverted {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Operation kind
        kind: OperationKind,
        /// Revert reason
        reason: String,
        /// When the revert was observed
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Get the agreement ID associated with this event
    pub fn agreement_id(&self) -> &AgreementId {
        match self {
            LifecycleEvent::StatusChanged { agreement_id, .. }
            | LifecycleEvent::OperationSubmitted { agreement_id, .. }
            | LifecycleEvent::OperationConfirmed { agreement_id, .. }
            | LifecycleEvent::OperationPending { agreement_id, .. }
            | LifecycleEvent::OperationFailed { agreement_id, .. }
            | LifecycleEvent::ReconciliationAttempted { agreement_id, .. }
            | LifecycleEvent::ReconciliationRecovered { agreement_id, .. }
            | LifecycleEvent::ReconciliationUnresolved { agreement_id, .. }
            | LifecycleEvent::ReconciliationReverted { agreement_id, .. } => agreement_id,
        }
    }

    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LifecycleEvent::StatusChanged { timestamp, .. }
            | LifecycleEvent::OperationSubmitted { timestamp, .. }
            | LifecycleEvent::OperationConfirmed { timestamp, .. }
            | LifecycleEvent::OperationPending { timestamp, .. }
            | LifecycleEvent::OperationFailed { timestamp, .. }
            | LifecycleEvent::ReconciliationAttempted { timestamp, .. }
            | LifecycleEvent::ReconciliationRecovered { timestamp, .. }
            | LifecycleEvent::ReconciliationUnresolved { timestamp, .. }
            | LifecycleEvent::ReconciliationReverted { timestamp, .. } => *timestamp,
        }
    }

    /// Get event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::StatusChanged { .. } => "status_changed",
            LifecycleEvent::OperationSubmitted { .. } => "operation_submitted",
            LifecycleEvent::OperationConfirmed { .. } => "operation_confirmed",
            LifecycleEvent::OperationPending { .. } => "operation_pending",
            LifecycleEvent::OperationFailed { .. } => "operation_failed",
            LifecycleEvent::ReconciliationAttempted { .. } => "reconciliation_attempted",
            LifecycleEvent::ReconciliationRecovered { .. } => "reconciliation_recovered",
            LifecycleEvent::ReconciliationUnresolved { .. } => "reconciliation_unresolved",
            LifecycleEvent::ReconciliationReverted { .. } => "reconciliation_reverted",
        }
    }
}
