//! Escrow Execution Layer
//!
//! Ledger submission, confirmation, and reconciliation of in-flight operations.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator → LedgerClient → LedgerPort (gateway / stub)
//!                     │
//!                     └─ bounded wait, then poll → Receipt | ConfirmationTimeout
//!
//! Reconciler → ledger read / re-poll → Mirror CAS
//! ```
//!
//! # Components
//!
//! - **Ports**: Traits for the ledger transport and the identity collaborator
//! - **Confirm**: Bounded-wait-then-poll combinator
//! - **Client**: Submit / confirm primitives over the agreement operations
//! - **Reconciler**: Resolves in-flight markers from ledger evidence
//! - **Gateway**: `LedgerPort` over the signed REST gateway
//! - **Stub**: In-memory ledger and identity table for development
//!
//! # Example
//!
//! ```rust,ignore
//! use escrow_exec::{ConfirmationPolicy, LedgerClient, Reconciler, StubLedger};
//! use escrow_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let client = Arc::new(LedgerClient::new(Arc::new(StubLedger::new()), ConfirmationPolicy::default()));
//! client.connect().await?;
//!
//! let reconciler = Reconciler::new(client, Arc::new(MemoryStore::new()), poll_policy, grace);
//! let outcome = reconciler.reconcile(&agreement_id).await?;
//! ```

#![warn(clippy::all)]

pub mod audit;
pub mod client;
pub mod confirm;
pub mod error;
pub mod gateway;
pub mod ports;
pub mod reconciler;
pub mod stub;

// Re-exports for convenience
pub use audit::record_event;
pub use client::{LedgerClient, PendingTx};
pub use confirm::{bounded_wait_then_poll, ConfirmationPolicy};
pub use error::{ExecError, ExecResult, LedgerError};
pub use gateway::GatewayLedger;
pub use ports::{IdentityPort, LedgerPort};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use stub::{StubIdentity, StubLedger};
