//! Daemon error types.

use escrow_domain::{AgreementId, DomainError, OperationKind, Role, UserId};
use escrow_engine::EngineError;
use escrow_exec::{ExecError, LedgerError};
use escrow_store::StoreError;
use thiserror::Error;

use crate::workflow::OperationStatus;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// State machine rejected the (status, event, role) triple
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// Ledger failure
    #[error("{0}")]
    Ledger(#[from] LedgerError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Orchestrator-level precondition (e.g. ledger not yet completed)
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// Acting party has no ledger address
    #[error("Identity unbound: {role} {user} has no ledger address")]
    IdentityUnbound {
        /// Role of the unbound party
        role: Role,
        /// Application user id
        user: UserId,
    },

    /// Another operation is outstanding for the agreement, or won the
    /// compare-and-swap on its record
    #[error("Operation already in flight for {agreement_id}")]
    AlreadyInFlight {
        /// Agreement identifier
        agreement_id: AgreementId,
        /// Outstanding ledger operation, if the winner left a marker
        kind: Option<OperationKind>,
    },

    /// Agreement not found
    #[error("Agreement not found: {0}")]
    AgreementNotFound(AgreementId),

    /// Agreement already registered
    #[error("Agreement already exists: {0}")]
    AgreementExists(AgreementId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task died
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl From<ExecError> for DaemonError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Ledger(e) => DaemonError::Ledger(e),
            ExecError::Store(e) => DaemonError::Store(e),
            ExecError::Domain(e) => DaemonError::Domain(e),
            ExecError::Engine(e) => DaemonError::Engine(e),
            ExecError::AgreementNotFound(id) => DaemonError::AgreementNotFound(id),
        }
    }
}

impl DaemonError {
    /// Which of the caller-visible outcomes this error communicates.
    ///
    /// Only an unobserved confirmation is pending; everything else left the
    /// mirror unchanged.
    pub fn outcome_kind(&self) -> OperationStatus {
        match self {
            DaemonError::Ledger(e) if e.is_ambiguous() => OperationStatus::PendingReconciliation,
            _ => OperationStatus::FailedSafe,
        }
    }

    /// Rejected before any ledger call
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DaemonError::Engine(_)
                | DaemonError::PreconditionViolated(_)
                | DaemonError::IdentityUnbound { .. }
                | DaemonError::AlreadyInFlight { .. }
        )
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
