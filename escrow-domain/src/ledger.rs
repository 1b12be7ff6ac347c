//! Ledger-side types
//!
//! Shapes of the records, calls and receipts exchanged with the external
//! ledger. The ledger is the authority on custody and `LedgerStatus`.

use crate::entities::{MirrorRecord, OperationKind};
use crate::value_objects::{AgreementKey, DomainError, LedgerAddress};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Transaction reference
// =============================================================================

/// Reference to a submitted ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxRef(String);

impl TxRef {
    /// Create a new TxRef
    ///
    /// # Errors
    /// Returns `DomainError::InvalidTxRef` if empty
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::InvalidTxRef("Transaction reference must be non-empty".to_string()));
        }
        Ok(Self(value))
    }

    /// Get the reference as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxRef {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TxRef> for String {
    fn from(tx: TxRef) -> Self {
        tx.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Receipts and transaction status
// =============================================================================

/// Proof that a transaction landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction reference
    pub tx_ref: TxRef,
    /// Block that included the transaction
    pub block_number: u64,
    /// Confirmations observed when the receipt was produced
    pub confirmations: u32,
    /// When the receipt was observed
    pub confirmed_at: DateTime<Utc>,
}

/// Ledger view of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxStatus {
    /// Ledger does not know the reference
    Unknown,
    /// Submitted, not yet included
    Pending,
    /// Included with a receipt
    Confirmed {
        /// Inclusion receipt
        receipt: Receipt,
    },
    /// Included but reverted by the ledger's guards
    Reverted {
        /// Revert reason reported by the ledger
        reason: String,
    },
}

impl TxStatus {
    /// Receipt with at least `confirmations`, if any
    pub fn confirmed_with(&self, confirmations: u32) -> Option<&Receipt> {
        match self {
            TxStatus::Confirmed { receipt } if receipt.confirmations >= confirmations => Some(receipt),
            _ => None,
        }
    }
}

// =============================================================================
// Ledger agreement record
// =============================================================================

/// Authoritative agreement status, resident only on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LedgerStatus {
    /// Registered and funded
    Created = 0,
    /// Accepted by the provider
    Accepted = 1,
    /// Completed by the needer
    Completed = 2,
    /// Cancelled by either party
    Cancelled = 3,
}

impl LedgerStatus {
    /// Get status name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            LedgerStatus::Created => "Created",
            LedgerStatus::Accepted => "Accepted",
            LedgerStatus::Completed => "Completed",
            LedgerStatus::Cancelled => "Cancelled",
        }
    }
}

impl TryFrom<u8> for LedgerStatus {
    type Error = DomainError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(LedgerStatus::Created),
            1 => Ok(LedgerStatus::Accepted),
            2 => Ok(LedgerStatus::Completed),
            3 => Ok(LedgerStatus::Cancelled),
            other => Err(DomainError::InvalidLedgerStatus(other)),
        }
    }
}

impl From<LedgerStatus> for u8 {
    fn from(status: LedgerStatus) -> Self {
        status as u8
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Agreement record as stored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAgreement {
    /// Hash of the external id
    pub key: AgreementKey,
    /// Needer account
    pub needer: LedgerAddress,
    /// Provider account
    pub provider: LedgerAddress,
    /// Requirements text
    pub requirements: String,
    /// Terms text
    pub terms: String,
    /// Authoritative status
    pub status: LedgerStatus,
    /// Ledger creation time
    pub created_at: DateTime<Utc>,
    /// Escrow balance still held (0 once withdrawn)
    pub escrow_amount: Decimal,
}

impl LedgerAgreement {
    /// Whether this record already reflects the post-state of `kind` for `mirror`
    pub fn reflects(&self, kind: OperationKind, mirror: &MirrorRecord) -> bool {
        match kind {
            // A record under the key is only ours if it carries our parties and terms
            OperationKind::Funding => self.belongs_to(mirror),
            OperationKind::Acceptance => {
                matches!(self.status, LedgerStatus::Accepted | LedgerStatus::Completed)
            }
            OperationKind::Completion => self.status == LedgerStatus::Completed,
            OperationKind::Withdrawal => {
                self.status == LedgerStatus::Completed && self.escrow_amount.is_zero()
            }
            OperationKind::Cancellation => self.status == LedgerStatus::Cancelled,
        }
    }

    /// Whether this record was created by `mirror`'s funding call.
    ///
    /// Requires the accounts resolved at funding time; a mirror without them
    /// never matches.
    pub fn belongs_to(&self, mirror: &MirrorRecord) -> bool {
        let amount_matches = self.escrow_amount == mirror.escrow_amount.as_decimal()
            || (self.escrow_amount.is_zero()
                && matches!(self.status, LedgerStatus::Completed | LedgerStatus::Cancelled));

        mirror.needer_address.as_ref() == Some(&self.needer)
            && mirror.provider_address.as_ref() == Some(&self.provider)
            && self.requirements == mirror.requirements
            && self.terms == mirror.terms
            && amount_matches
    }
}

// =============================================================================
// Ledger calls
// =============================================================================

/// The closed set of ledger-mutating calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LedgerCall {
    /// Register the agreement and deposit the escrow (sent by the needer)
    CreateAgreement {
        /// Agreement key
        key: AgreementKey,
        /// Needer account
        needer: LedgerAddress,
        /// Provider account
        provider: LedgerAddress,
        /// Requirements text
        requirements: String,
        /// Terms text
        terms: String,
        /// Amount to deposit
        escrow_amount: Decimal,
    },
    /// Provider accepts
    AcceptAgreement {
        /// Agreement key
        key: AgreementKey,
    },
    /// Needer completes
    CompleteAgreement {
        /// Agreement key
        key: AgreementKey,
    },
    /// Provider withdraws the escrow
    WithdrawEscrow {
        /// Agreement key
        key: AgreementKey,
    },
    /// Either party cancels
    CancelAgreement {
        /// Agreement key
        key: AgreementKey,
    },
}

impl LedgerCall {
    /// Operation kind this call performs
    pub fn kind(&self) -> OperationKind {
        match self {
            LedgerCall::CreateAgreement { .. } => OperationKind::Funding,
            LedgerCall::AcceptAgreement { .. } => OperationKind::Acceptance,
            LedgerCall::CompleteAgreement { .. } => OperationKind::Completion,
            LedgerCall::WithdrawEscrow { .. } => OperationKind::Withdrawal,
            LedgerCall::CancelAgreement { .. } => OperationKind::Cancellation,
        }
    }

    /// Agreement key the call targets
    pub fn key(&self) -> AgreementKey {
        match self {
            LedgerCall::CreateAgreement { key, .. }
            | LedgerCall::AcceptAgreement { key }
            | LedgerCall::CompleteAgreement { key }
            | LedgerCall::WithdrawEscrow { key }
            | LedgerCall::CancelAgreement { key } => *key,
        }
    }

    /// Contract method name
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::CreateAgreement { .. } => "createAgreement",
            LedgerCall::AcceptAgreement { .. } => "acceptAgreement",
            LedgerCall::CompleteAgreement { .. } => "completeAgreement",
            LedgerCall::WithdrawEscrow { .. } => "withdrawEscrow",
            LedgerCall::CancelAgreement { .. } => "cancelAgreement",
        }
    }
}

/// Network the ledger transport is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Human-readable network name
    pub network: String,
    /// Chain identifier
    pub chain_id: u64,
    /// Latest block height
    pub block_height: u64,
}

// =============================================================================
// Tests
// =============================================================================
