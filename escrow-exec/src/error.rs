//! Execution layer error types.

use escrow_domain::{AgreementId, TxRef};
use thiserror::Error;

/// Failure taxonomy of ledger operations.
///
/// Every ledger failure is reported as one of these; none is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The signer declined to sign or send
    #[error("User declined: {0}")]
    UserDeclined(String),

    /// Sender cannot cover the value and fees
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Ledger or gateway unreachable, or the client is disconnected
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A ledger guard rejected the call (also used for reverted transactions)
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// Confirmation could not be observed within the policy bounds.
    ///
    /// The outcome is unknown, not failed.
    #[error("Confirmation timeout for {tx_ref}")]
    ConfirmationTimeout {
        /// Submitted transaction
        tx_ref: TxRef,
    },

    /// Ledger payload could not be decoded
    #[error("Malformed ledger response: {0}")]
    MalformedResponse(String),
}

impl LedgerError {
    /// The operation may or may not have landed
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LedgerError::ConfirmationTimeout { .. })
    }
}

/// Errors that can occur during execution operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Ledger failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] escrow_store::StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] escrow_domain::DomainError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] escrow_engine::EngineError),

    /// No mirror record for the agreement
    #[error("Agreement not found: {0}")]
    AgreementNotFound(AgreementId),
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
