//! Domain Entities for the escrow workflow
//!
//! The mirror record is the application's own belief about an agreement.
//! It is keyed by [`AgreementId`] and mutated only through compare-and-swap.

use crate::value_objects::{AgreementId, DomainError, EscrowAmount, LedgerAddress, Role};
use crate::ledger::TxRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Application user identifier (resolved to a ledger address by the identity collaborator)
pub type UserId = Uuid;

// =============================================================================
// Application Status
// =============================================================================

/// Application-level agreement status.
///
/// `Cancelled` and `Disputed` are reachable from any non-terminal state.
/// `Completed` stays open for exactly one more ledger operation (withdrawal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    /// Terms agreed, escrow not yet deposited
    PendingFunding,
    /// Escrow deposited, waiting for the provider to accept
    PendingAcceptance,
    /// Provider accepted, work not started
    PendingStart,
    /// Work in progress
    Active,
    /// Provider submitted work, waiting for needer review
    PendingReview,
    /// Needer approved, ledger completed
    Completed,
    /// Agreement cancelled by either party
    Cancelled,
    /// Agreement escalated to dispute
    Disputed,
}

impl AppStatus {
    /// All statuses in lifecycle order
    pub const ALL: [AppStatus; 8] = [
        AppStatus::PendingFunding,
        AppStatus::PendingAcceptance,
        AppStatus::PendingStart,
        AppStatus::Active,
        AppStatus::PendingReview,
        AppStatus::Completed,
        AppStatus::Cancelled,
        AppStatus::Disputed,
    ];

    /// Get status name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            AppStatus::PendingFunding => "pending_funding",
            AppStatus::PendingAcceptance => "pending_acceptance",
            AppStatus::PendingStart => "pending_start",
            AppStatus::Active => "active",
            AppStatus::PendingReview => "pending_review",
            AppStatus::Completed => "completed",
            AppStatus::Cancelled => "cancelled",
            AppStatus::Disputed => "disputed",
        }
    }

    /// Terminal for the cancel/dispute branches.
    ///
    /// `Completed` counts as terminal here even though a withdrawal may still follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AppStatus::Completed | AppStatus::Cancelled | AppStatus::Disputed)
    }
}

impl std::str::FromStr for AppStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppStatus::ALL
            .iter()
            .find(|status| status.name() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownName {
                kind: "app status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Operation Kind
// =============================================================================

/// The five ledger-mutating operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// createAgreement: registers the agreement and deposits escrow
    Funding,
    /// acceptAgreement
    Acceptance,
    /// completeAgreement
    Completion,
    /// withdrawEscrow
    Withdrawal,
    /// cancelAgreement
    Cancellation,
}

impl OperationKind {
    /// All operation kinds
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Funding,
        OperationKind::Acceptance,
        OperationKind::Completion,
        OperationKind::Withdrawal,
        OperationKind::Cancellation,
    ];

    /// Get kind name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Funding => "funding",
            OperationKind::Acceptance => "acceptance",
            OperationKind::Completion => "completion",
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::Cancellation => "cancellation",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownName {
                kind: "operation kind",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// In-flight marker
// =============================================================================

/// A ledger-mutating operation that was submitted but not yet locally confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightOperation {
    /// Which operation is outstanding
    pub kind: OperationKind,
    /// Party that initiated it
    pub initiated_by: Role,
    /// When the marker was written
    pub submitted_at: DateTime<Utc>,
    /// Ledger transaction reference, once submission returned
    pub tx_ref: Option<TxRef>,
}

impl InFlightOperation {
    /// Create a marker for an operation about to be submitted
    pub fn new(kind: OperationKind, initiated_by: Role) -> Self {
        Self {
            kind,
            initiated_by,
            submitted_at: Utc::now(),
            tx_ref: None,
        }
    }

    /// Whether the marker is older than `grace` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now - self.submitted_at >= grace
    }
}

// =============================================================================
// Agreement draft
// =============================================================================

/// Agreed terms handed over by the negotiation collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementDraft {
    /// Application-chosen external id
    pub agreement_id: AgreementId,
    /// User who receives the work and funds the escrow
    pub needer: UserId,
    /// User who performs the work
    pub provider: UserId,
    /// Amount to hold in escrow
    pub escrow_amount: EscrowAmount,
    /// Requirements text (copied to the ledger at funding)
    pub requirements: String,
    /// Terms text (copied to the ledger at funding)
    pub terms: String,
}

impl AgreementDraft {
    /// Validate cross-field rules
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.needer == self.provider {
            return Err(DomainError::InvalidStateTransition(
                "Needer and provider must be different users".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Mirror record
// =============================================================================

/// The application's durable record of an agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    /// Agreement identifier (store key)
    pub agreement_id: AgreementId,
    /// Needer user id
    pub needer: UserId,
    /// Provider user id
    pub provider: UserId,
    /// Escrow amount (set once)
    pub escrow_amount: EscrowAmount,
    /// Requirements text
    pub requirements: String,
    /// Terms text
    pub terms: String,
    /// Application status
    pub app_status: AppStatus,
    /// Escrow has been deposited on the ledger
    pub escrow_funded: bool,
    /// Escrow has been withdrawn by the provider
    pub escrow_released: bool,
    /// Outstanding ledger operation, if any
    pub in_flight: Option<InFlightOperation>,
    /// Latest note attached when submitting for review
    pub review_note: Option<String>,
    /// Latest needer comments when reviewing
    pub review_comments: Option<String>,
    /// Needer account the funding call was sent for
    #[serde(default)]
    pub needer_address: Option<LedgerAddress>,
    /// Provider account the funding call was sent for
    #[serde(default)]
    pub provider_address: Option<LedgerAddress>,
    /// Optimistic-concurrency counter, incremented by every successful write
    pub version: u64,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl MirrorRecord {
    /// Open a mirror record from agreed terms (status `pending_funding`)
    pub fn open(draft: AgreementDraft) -> Self {
        let now = Utc::now();
        Self {
            agreement_id: draft.agreement_id,
            needer: draft.needer,
            provider: draft.provider,
            escrow_amount: draft.escrow_amount,
            requirements: draft.requirements,
            terms: draft.terms,
            app_status: AppStatus::PendingFunding,
            escrow_funded: false,
            escrow_released: false,
            in_flight: None,
            review_note: None,
            review_comments: None,
            needer_address: None,
            provider_address: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// User id of the party holding `role`
    pub fn party(&self, role: Role) -> UserId {
        match role {
            Role::Needer => self.needer,
            Role::Provider => self.provider,
        }
    }

    /// Whether a ledger operation is outstanding
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Immutable once closed and the escrow is released or was never deposited
    pub fn is_closed(&self) -> bool {
        match self.app_status {
            AppStatus::Cancelled | AppStatus::Disputed => true,
            AppStatus::Completed => self.escrow_released,
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
