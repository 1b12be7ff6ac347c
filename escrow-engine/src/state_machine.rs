//! Agreement state machine
//!
//! ```text
//! pending_funding    --Funded(needer)-->              pending_acceptance  [createAgreement]
//! pending_acceptance --Accepted(provider)-->          pending_start       [acceptAgreement]
//! pending_start      --WorkStarted(provider)-->       active
//! active             --SubmittedForReview(provider)--> pending_review
//! pending_review     --ChangesRequested(needer)-->    active
//! pending_review     --Approved(needer)-->            completed           [completeAgreement]
//! completed          --Withdrawn(provider)-->         completed           [withdrawEscrow]
//! any non-terminal   --Cancelled(either)-->           cancelled           [cancelAgreement if funded]
//! any non-terminal   --Disputed(either)-->            disputed
//! ```

use escrow_domain::{AppStatus, MirrorRecord, OperationKind, Role, WorkflowEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The (status, event, role) triple is not an edge of the machine
    #[error("Precondition violated: {event} by {role} in {status}: {reason}")]
    PreconditionViolated {
        /// Current status
        status: AppStatus,
        /// Rejected event
        event: WorkflowEvent,
        /// Acting role
        role: Role,
        /// Human-readable reason
        reason: String,
    },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Escrow custody flags carried alongside the status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowFlags {
    /// Escrow deposited on the ledger
    pub escrow_funded: bool,
    /// Escrow withdrawn by the provider
    pub escrow_released: bool,
}

impl From<&MirrorRecord> for EscrowFlags {
    fn from(record: &MirrorRecord) -> Self {
        Self {
            escrow_funded: record.escrow_funded,
            escrow_released: record.escrow_released,
        }
    }
}

/// An accepted edge of the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Status before
    pub from: AppStatus,
    /// Status after
    pub to: AppStatus,
    /// Event that drove it
    pub event: WorkflowEvent,
    /// Ledger operation that must confirm before the transition applies
    pub ledger_operation: Option<OperationKind>,
    /// escrowFunded flips to true
    pub funds_escrow: bool,
    /// escrowReleased flips to true
    pub releases_escrow: bool,
}

impl Transition {
    fn off_ledger(from: AppStatus, to: AppStatus, event: WorkflowEvent) -> Self {
        Self {
            from,
            to,
            event,
            ledger_operation: None,
            funds_escrow: false,
            releases_escrow: false,
        }
    }

    fn on_ledger(from: AppStatus, to: AppStatus, event: WorkflowEvent, kind: OperationKind) -> Self {
        Self {
            from,
            to,
            event,
            ledger_operation: Some(kind),
            funds_escrow: kind == OperationKind::Funding,
            releases_escrow: kind == OperationKind::Withdrawal,
        }
    }

    /// Apply status and custody flags to a mirror record
    pub fn apply(&self, record: &mut MirrorRecord) {
        record.app_status = self.to;
        if self.funds_escrow {
            record.escrow_funded = true;
        }
        if self.releases_escrow {
            record.escrow_released = true;
        }
    }

    /// Whether the status actually changes
    pub fn changes_status(&self) -> bool {
        self.from != self.to
    }
}

/// Per-role capability snapshot derived from the transition table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Funded is legal
    pub can_fund: bool,
    /// Accepted is legal
    pub can_accept: bool,
    /// WorkStarted is legal
    pub can_start: bool,
    /// SubmittedForReview is legal
    pub can_submit_for_review: bool,
    /// Approved / ChangesRequested are legal
    pub can_review: bool,
    /// Withdrawn is legal
    pub can_withdraw: bool,
    /// Cancelled is legal
    pub can_cancel: bool,
    /// Status is completed
    pub is_completed: bool,
}

impl Capabilities {
    /// Same snapshot with every action disabled (used while an operation is in flight)
    pub fn frozen(self) -> Self {
        Self {
            is_completed: self.is_completed,
            ..Self::default()
        }
    }
}

/// Pure agreement state machine
#[derive(Debug, Clone, Copy, Default)]
pub struct AgreementStateMachine;

impl AgreementStateMachine {
    /// Create a new state machine
    pub fn new() -> Self {
        Self
    }

    /// Status of a freshly opened agreement (TermsAccepted)
    pub fn open(&self) -> AppStatus {
        AppStatus::PendingFunding
    }

    /// Judge a `(status, event, role)` triple.
    ///
    /// # Errors
    /// `EngineError::PreconditionViolated` for any triple that is not an edge.
    pub fn transition(
        &self,
        status: AppStatus,
        event: WorkflowEvent,
        role: Role,
        flags: EscrowFlags,
    ) -> EngineResult<Transition> {
        let reject = |reason: &str| {
            debug!(%status, %event, %role, reason, "Transition rejected");
            EngineError::PreconditionViolated {
                status,
                event,
                role,
                reason: reason.to_string(),
            }
        };

        let require_role = |expected: Role| {
            if role == expected {
                Ok(())
            } else {
                Err(reject(&format!("only the {} may do this", expected)))
            }
        };

        let require_status = |expected: AppStatus| {
            if status == expected {
                Ok(())
            } else {
                Err(reject(&format!("requires status {}", expected)))
            }
        };

        match event {
            WorkflowEvent::TermsAccepted => Err(reject("agreement already exists")),

            WorkflowEvent::Funded => {
                require_role(Role::Needer)?;
                require_status(AppStatus::PendingFunding)?;
                if flags.escrow_funded {
                    return Err(reject("escrow already funded"));
                }
                Ok(Transition::on_ledger(
                    status,
                    AppStatus::PendingAcceptance,
                    event,
                    OperationKind::Funding,
                ))
            }

            WorkflowEvent::Accepted => {
                require_role(Role::Provider)?;
                require_status(AppStatus::PendingAcceptance)?;
                if !flags.escrow_funded {
                    return Err(reject("escrow not funded"));
                }
                Ok(Transition::on_ledger(
                    status,
                    AppStatus::PendingStart,
                    event,
                    OperationKind::Acceptance,
                ))
            }

            WorkflowEvent::WorkStarted => {
                require_role(Role::Provider)?;
                require_status(AppStatus::PendingStart)?;
                Ok(Transition::off_ledger(status, AppStatus::Active, event))
            }

            WorkflowEvent::SubmittedForReview => {
                require_role(Role::Provider)?;
                require_status(AppStatus::Active)?;
                Ok(Transition::off_ledger(status, AppStatus::PendingReview, event))
            }

            WorkflowEvent::ChangesRequested => {
                require_role(Role::Needer)?;
                require_status(AppStatus::PendingReview)?;
                Ok(Transition::off_ledger(status, AppStatus::Active, event))
            }

            WorkflowEvent::Approved => {
                require_role(Role::Needer)?;
                require_status(AppStatus::PendingReview)?;
                Ok(Transition::on_ledger(
                    status,
                    AppStatus::Completed,
                    event,
                    OperationKind::Completion,
                ))
            }

            WorkflowEvent::Withdrawn => {
                require_role(Role::Provider)?;
                require_status(AppStatus::Completed)?;
                if !flags.escrow_funded {
                    return Err(reject("escrow was never funded"));
                }
                if flags.escrow_released {
                    return Err(reject("escrow already released"));
                }
                Ok(Transition::on_ledger(
                    status,
                    AppStatus::Completed,
                    event,
                    OperationKind::Withdrawal,
                ))
            }

            WorkflowEvent::Cancelled => {
                if status.is_terminal() {
                    return Err(reject("agreement is closed"));
                }
                if flags.escrow_released {
                    return Err(reject("escrow already released"));
                }
                if flags.escrow_funded {
                    Ok(Transition::on_ledger(
                        status,
                        AppStatus::Cancelled,
                        event,
                        OperationKind::Cancellation,
                    ))
                } else {
                    Ok(Transition::off_ledger(status, AppStatus::Cancelled, event))
                }
            }

            WorkflowEvent::Disputed => {
                if status.is_terminal() {
                    return Err(reject("agreement is closed"));
                }
                Ok(Transition::off_ledger(status, AppStatus::Disputed, event))
            }
        }
    }

    /// Whether the triple is an edge
    pub fn can(&self, status: AppStatus, event: WorkflowEvent, role: Role, flags: EscrowFlags) -> bool {
        self.transition(status, event, role, flags).is_ok()
    }

    /// Capability snapshot for `role`
    pub fn capabilities(&self, status: AppStatus, role: Role, flags: EscrowFlags) -> Capabilities {
        let can = |event| self.can(status, event, role, flags);
        Capabilities {
            can_fund: can(WorkflowEvent::Funded),
            can_accept: can(WorkflowEvent::Accepted),
            can_start: can(WorkflowEvent::WorkStarted),
            can_submit_for_review: can(WorkflowEvent::SubmittedForReview),
            can_review: can(WorkflowEvent::Approved),
            can_withdraw: can(WorkflowEvent::Withdrawn),
            can_cancel: can(WorkflowEvent::Cancelled),
            is_completed: status == AppStatus::Completed,
        }
    }

    /// Event whose confirmation a ledger operation stands for
    pub fn event_for(kind: OperationKind) -> WorkflowEvent {
        match kind {
            OperationKind::Funding => WorkflowEvent::Funded,
            OperationKind::Acceptance => WorkflowEvent::Accepted,
            OperationKind::Completion => WorkflowEvent::Approved,
            OperationKind::Withdrawal => WorkflowEvent::Withdrawn,
            OperationKind::Cancellation => WorkflowEvent::Cancelled,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
