//! Ledger Client
//!
//! Submit / confirm primitives over the fixed agreement operation set.
//!
//! The client turns an [`AgreementId`] into the ledger key before every call,
//! owns the confirmation policy, and keeps no per-operation bookkeeping:
//! in-flight state lives only in the mirror store.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = LedgerClient::new(Arc::new(StubLedger::new()), ConfirmationPolicy::default());
//! client.connect().await?;
//!
//! let pending = client.accept_agreement(&provider, &agreement_id).await?;
//! match client.confirm(&pending).await {
//!     Ok(receipt) => println!("accepted in block {}", receipt.block_number),
//!     Err(e) if e.is_ambiguous() => println!("pending, will reconcile"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use escrow_domain::{
    AgreementId, AgreementKey, EscrowAmount, LedgerAddress, LedgerAgreement, LedgerCall,
    NetworkInfo, OperationKind, Receipt, TxRef, TxStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confirm::{bounded_wait_then_poll, ConfirmationPolicy};
use crate::error::LedgerError;
use crate::ports::LedgerPort;

/// Handle to a submitted, not yet confirmed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    /// Ledger transaction reference
    pub tx_ref: TxRef,
    /// Operation submitted
    pub kind: OperationKind,
    /// Ledger key targeted
    pub key: AgreementKey,
    /// When submission returned
    pub submitted_at: DateTime<Utc>,
}

/// Ledger client over a transport.
pub struct LedgerClient<L: LedgerPort> {
    transport: Arc<L>,
    policy: ConfirmationPolicy,
    connected: AtomicBool,
}

impl<L: LedgerPort> LedgerClient<L> {
    /// Create a disconnected client over `transport`.
    pub fn new(transport: Arc<L>, policy: ConfirmationPolicy) -> Self {
        Self {
            transport,
            policy,
            connected: AtomicBool::new(false),
        }
    }

    /// Default confirmation policy
    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<L> {
        &self.transport
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect the transport.
    pub async fn connect(&self) -> Result<NetworkInfo, LedgerError> {
        let info = self.transport.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!(network = %info.network, chain_id = info.chain_id, block_height = info.block_height, "Ledger connected");
        Ok(info)
    }

    /// Disconnect the transport. Submitted operations keep running on the ledger.
    pub async fn disconnect(&self) -> Result<(), LedgerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.transport.disconnect().await?;
        info!("Ledger disconnected");
        Ok(())
    }

    /// Whether `connect` succeeded and `disconnect` was not called since
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), LedgerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LedgerError::NetworkUnavailable("ledger client is disconnected".to_string()))
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a call signed by `sender`.
    pub async fn submit(&self, sender: &LedgerAddress, call: LedgerCall) -> Result<PendingTx, LedgerError> {
        self.ensure_connected()?;

        let kind = call.kind();
        let key = call.key();

        let tx_ref = self.transport.submit(sender, &call).await.map_err(|e| {
            warn!(%key, ?kind, error = %e, "Ledger submission failed");
            e
        })?;

        info!(%key, ?kind, %tx_ref, method = call.method(), "Ledger operation submitted");

        Ok(PendingTx {
            tx_ref,
            kind,
            key,
            submitted_at: Utc::now(),
        })
    }

    /// `createAgreement`: register the agreement and deposit the escrow (needer).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_agreement(
        &self,
        sender: &LedgerAddress,
        agreement_id: &AgreementId,
        needer: &LedgerAddress,
        provider: &LedgerAddress,
        requirements: &str,
        terms: &str,
        escrow_amount: EscrowAmount,
    ) -> Result<PendingTx, LedgerError> {
        let call = LedgerCall::CreateAgreement {
            key: agreement_id.ledger_key(),
            needer: needer.clone(),
            provider: provider.clone(),
            requirements: requirements.to_string(),
            terms: terms.to_string(),
            escrow_amount: escrow_amount.as_decimal(),
        };
        self.submit(sender, call).await
    }

    /// `acceptAgreement` (provider).
    pub async fn accept_agreement(
        &self,
        sender: &LedgerAddress,
        agreement_id: &AgreementId,
    ) -> Result<PendingTx, LedgerError> {
        self.submit(sender, LedgerCall::AcceptAgreement { key: agreement_id.ledger_key() })
            .await
    }

    /// `completeAgreement` (needer).
    pub async fn complete_agreement(
        &self,
        sender: &LedgerAddress,
        agreement_id: &AgreementId,
    ) -> Result<PendingTx, LedgerError> {
        self.submit(sender, LedgerCall::CompleteAgreement { key: agreement_id.ledger_key() })
            .await
    }

    /// `withdrawEscrow` (provider).
    pub async fn withdraw_escrow(
        &self,
        sender: &LedgerAddress,
        agreement_id: &AgreementId,
    ) -> Result<PendingTx, LedgerError> {
        self.submit(sender, LedgerCall::WithdrawEscrow { key: agreement_id.ledger_key() })
            .await
    }

    /// `cancelAgreement` (either party).
    pub async fn cancel_agreement(
        &self,
        sender: &LedgerAddress,
        agreement_id: &AgreementId,
    ) -> Result<PendingTx, LedgerError> {
        self.submit(sender, LedgerCall::CancelAgreement { key: agreement_id.ledger_key() })
            .await
    }

    // =========================================================================
    // Confirmation
    // =========================================================================

    /// Confirm with the client's policy.
    pub async fn confirm(&self, pending: &PendingTx) -> Result<Receipt, LedgerError> {
        self.confirm_with(pending, &self.policy).await
    }

    /// Confirm with an explicit policy.
    ///
    /// # Errors
    ///
    /// - `LedgerError::ConfirmationTimeout` when nothing settled (outcome unknown)
    /// - `LedgerError::PreconditionViolated` when the transaction reverted
    pub async fn confirm_with(
        &self,
        pending: &PendingTx,
        policy: &ConfirmationPolicy,
    ) -> Result<Receipt, LedgerError> {
        self.ensure_connected()?;

        let tx_ref = &pending.tx_ref;
        debug!(%tx_ref, kind = ?pending.kind, timeout = ?policy.timeout, "Awaiting confirmation");

        let transport = &self.transport;
        let result = bounded_wait_then_poll(
            policy,
            tx_ref,
            transport.wait_for_receipt(tx_ref, policy.confirmations),
            || transport.transaction_status(tx_ref),
        )
        .await;

        match &result {
            Ok(receipt) => {
                info!(%tx_ref, kind = ?pending.kind, block = receipt.block_number, "Ledger operation confirmed")
            },
            Err(e) if e.is_ambiguous() => {
                warn!(%tx_ref, kind = ?pending.kind, "Confirmation not observed within policy bounds")
            },
            Err(e) => warn!(%tx_ref, kind = ?pending.kind, error = %e, "Ledger operation failed"),
        }

        result
    }

    /// Current status of a transaction.
    pub async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, LedgerError> {
        self.ensure_connected()?;
        self.transport.transaction_status(tx_ref).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the authoritative ledger record for an agreement.
    pub async fn read_agreement(
        &self,
        agreement_id: &AgreementId,
    ) -> Result<Option<LedgerAgreement>, LedgerError> {
        self.ensure_connected()?;
        self.transport.read_agreement(&agreement_id.ledger_key()).await
    }
}

// =============================================================================
// Tests
// =============================================================================
