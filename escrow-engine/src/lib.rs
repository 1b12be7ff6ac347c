//! Escrow Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//! Takes `(status, event, role)` → returns the next status and the ledger
//! operation to perform, or a rejection. The engine never talks to the ledger.

#![warn(clippy::all)]

pub mod state_machine;

pub use state_machine::{
    AgreementStateMachine, Capabilities, EngineError, EngineResult, EscrowFlags, Transition,
};
