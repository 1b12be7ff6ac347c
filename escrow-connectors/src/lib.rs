//! Escrow Ledger Connectors
//!
//! Adapters for the ledger gateway REST API.
//! Normalizes gateway payloads to domain types.

#![warn(clippy::all)]

// Public modules
pub mod gateway_rest;

// Re-exports
pub use gateway_rest::{GatewayError, LedgerGatewayClient};
