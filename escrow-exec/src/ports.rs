//! Execution layer port definitions.
//!
//! Ports define the interfaces for external services (ledger, identity).
//! Adapters implement these ports for specific services (gateway, stub, etc.).

use async_trait::async_trait;

use escrow_domain::{
    AgreementKey, LedgerAddress, LedgerAgreement, LedgerCall, NetworkInfo, TxRef, TxStatus, UserId,
};

use crate::error::LedgerError;

// =============================================================================
// Ledger Port
// =============================================================================

/// Port for ledger transport.
///
/// Implementations:
/// - `StubLedger` - In-memory ledger with contract guards (testing)
/// - `GatewayLedger` - REST gateway in front of the ledger node
#[async_trait]
pub trait LedgerPort: Send + Sync {
    /// Attach to the network.
    async fn connect(&self) -> Result<NetworkInfo, LedgerError>;

    /// Detach from the network. Pending transactions are unaffected.
    async fn disconnect(&self) -> Result<(), LedgerError>;

    /// Sign and broadcast a call on behalf of `sender`.
    ///
    /// # Returns
    ///
    /// The transaction reference as soon as the ledger accepted the
    /// submission. Inclusion is not implied.
    async fn submit(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<TxRef, LedgerError>;

    /// Current status of a submitted transaction.
    async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, LedgerError>;

    /// Resolve once the transaction is confirmed with at least
    /// `confirmations`, or reverted.
    ///
    /// May never resolve; callers bound it with a timeout.
    async fn wait_for_receipt(
        &self,
        tx_ref: &TxRef,
        confirmations: u32,
    ) -> Result<TxStatus, LedgerError>;

    /// Read the ledger-resident agreement record.
    async fn read_agreement(&self, key: &AgreementKey) -> Result<Option<LedgerAgreement>, LedgerError>;
}

// =============================================================================
// Identity Port
// =============================================================================

/// Port for the identity collaborator (user id → ledger address).
///
/// Callers fail closed when an identity is unbound.
#[async_trait]
pub trait IdentityPort: Send + Sync {
    /// Ledger address bound to `user`, if any
    async fn resolve(&self, user: UserId) -> Option<LedgerAddress>;
}
