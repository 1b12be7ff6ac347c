//! Escrow Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains the mirror record, ledger-side types, value objects and events.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod entities;
pub mod events;
pub mod ledger;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{
    AgreementDraft, AppStatus, InFlightOperation, MirrorRecord, OperationKind, UserId,
};
pub use events::{LifecycleEvent, WorkflowEvent};
pub use ledger::{
    LedgerAgreement, LedgerCall, LedgerStatus, NetworkInfo, Receipt, TxRef, TxStatus,
};
pub use value_objects::{
    AgreementId, AgreementKey, DomainError, EscrowAmount, LedgerAddress, Role,
};
