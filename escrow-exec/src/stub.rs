//! Stub implementations for testing.
//!
//! `StubLedger` is an in-memory ledger that enforces the agreement contract
//! guards, tracks escrow balances, and can hold transactions in the mempool
//! to simulate confirmations that land after the caller stopped waiting.
//! `StubIdentity` is a static user → address table.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

use escrow_domain::{
    AgreementKey, LedgerAddress, LedgerAgreement, LedgerCall, LedgerStatus, NetworkInfo,
    OperationKind, Receipt, TxRef, TxStatus, UserId,
};

use crate::error::LedgerError;
use crate::ports::{IdentityPort, LedgerPort};

// =============================================================================
// Stub Ledger
// =============================================================================

#[derive(Debug, Clone)]
enum StubTxState {
    Pending,
    Mined { block_number: u64 },
    Reverted { reason: String },
}

#[derive(Debug, Clone)]
struct StubTx {
    sender: LedgerAddress,
    call: LedgerCall,
    state: StubTxState,
}

#[derive(Debug, Default)]
struct StubState {
    connected: bool,
    agreements: HashMap<AgreementKey, LedgerAgreement>,
    balances: HashMap<LedgerAddress, Decimal>,
    txs: HashMap<TxRef, StubTx>,
    mempool: Vec<TxRef>,
    submissions: Vec<OperationKind>,
    tx_counter: u64,
    block_height: u64,
    hold: bool,
    fail_next: Option<LedgerError>,
    confirmation_delay: Option<Duration>,
}

impl StubState {
    /// Contract guards. `Ok(())` if `call` from `sender` would succeed now.
    fn check(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<(), LedgerError> {
        let reject = |msg: &str| Err(LedgerError::PreconditionViolated(msg.to_string()));

        if let LedgerCall::CreateAgreement {
            key,
            needer,
            provider,
            escrow_amount,
            ..
        } = call
        {
            if self.agreements.contains_key(key) {
                return reject("agreement already exists");
            }
            if sender != needer {
                return reject("only the needer can create the agreement");
            }
            if needer == provider {
                return reject("needer and provider must differ");
            }
            if *escrow_amount <= Decimal::ZERO {
                return reject("escrow amount must be positive");
            }
            if let Some(balance) = self.balances.get(sender) {
                if balance < escrow_amount {
                    return Err(LedgerError::InsufficientFunds(format!(
                        "balance {} below escrow {}",
                        balance, escrow_amount
                    )));
                }
            }
            return Ok(());
        }

        let Some(agreement) = self.agreements.get(&call.key()) else {
            return reject("agreement does not exist");
        };

        match call {
            LedgerCall::CreateAgreement { .. } => Ok(()),
            LedgerCall::AcceptAgreement { .. } => {
                if sender != &agreement.provider {
                    return reject("only the provider can accept");
                }
                if agreement.status != LedgerStatus::Created {
                    return reject("agreement is not in Created status");
                }
                Ok(())
            },
            LedgerCall::CompleteAgreement { .. } => {
                if sender != &agreement.needer {
                    return reject("only the needer can complete");
                }
                if agreement.status != LedgerStatus::Accepted {
                    return reject("agreement is not in Accepted status");
                }
                Ok(())
            },
            LedgerCall::WithdrawEscrow { .. } => {
                if sender != &agreement.provider {
                    return reject("only the provider can withdraw");
                }
                if agreement.status != LedgerStatus::Completed {
                    return reject("agreement is not completed");
                }
                if agreement.escrow_amount.is_zero() {
                    return reject("escrow already withdrawn");
                }
                Ok(())
            },
            LedgerCall::CancelAgreement { .. } => {
                if sender != &agreement.needer && sender != &agreement.provider {
                    return reject("only a party can cancel");
                }
                if !matches!(agreement.status, LedgerStatus::Created | LedgerStatus::Accepted) {
                    return reject("agreement can no longer be cancelled");
                }
                Ok(())
            },
        }
    }

    /// Apply a call whose guards passed.
    fn apply(&mut self, sender: &LedgerAddress, call: &LedgerCall) {
        match call {
            LedgerCall::CreateAgreement {
                key,
                needer,
                provider,
                requirements,
                terms,
                escrow_amount,
            } => {
                if let Some(balance) = self.balances.get_mut(sender) {
                    *balance -= *escrow_amount;
                }
                self.agreements.insert(
                    *key,
                    LedgerAgreement {
                        key: *key,
                        needer: needer.clone(),
                        provider: provider.clone(),
                        requirements: requirements.clone(),
                        terms: terms.clone(),
                        status: LedgerStatus::Created,
                        created_at: Utc::now(),
                        escrow_amount: *escrow_amount,
                    },
                );
            },
            LedgerCall::AcceptAgreement { key } => {
                if let Some(a) = self.agreements.get_mut(key) {
                    a.status = LedgerStatus::Accepted;
                }
            },
            LedgerCall::CompleteAgreement { key } => {
                if let Some(a) = self.agreements.get_mut(key) {
                    a.status = LedgerStatus::Completed;
                }
            },
            LedgerCall::WithdrawEscrow { key } => {
                if let Some(a) = self.agreements.get_mut(key) {
                    let amount = std::mem::take(&mut a.escrow_amount);
                    *self.balances.entry(a.provider.clone()).or_default() += amount;
                }
            },
            LedgerCall::CancelAgreement { key } => {
                if let Some(a) = self.agreements.get_mut(key) {
                    a.status = LedgerStatus::Cancelled;
                    let refund = std::mem::take(&mut a.escrow_amount);
                    if let Some(balance) = self.balances.get_mut(&a.needer) {
                        *balance += refund;
                    }
                }
            },
        }
    }

    /// Include a pending transaction in a new block (re-checking guards).
    fn mine(&mut self, tx_ref: &TxRef) {
        let Some(tx) = self.txs.get(tx_ref).cloned() else {
            return;
        };
        if !matches!(tx.state, StubTxState::Pending) {
            return;
        }

        self.block_height += 1;
        let state = match self.check(&tx.sender, &tx.call) {
            Ok(()) => {
                self.apply(&tx.sender, &tx.call);
                StubTxState::Mined { block_number: self.block_height }
            },
            Err(e) => StubTxState::Reverted { reason: e.to_string() },
        };

        if let Some(stored) = self.txs.get_mut(tx_ref) {
            stored.state = state;
        }
    }

    fn status_of(&self, tx_ref: &TxRef) -> TxStatus {
        match self.txs.get(tx_ref).map(|tx| &tx.state) {
            None => TxStatus::Unknown,
            Some(StubTxState::Pending) => TxStatus::Pending,
            Some(StubTxState::Reverted { reason }) => TxStatus::Reverted { reason: reason.clone() },
            Some(StubTxState::Mined { block_number }) => TxStatus::Confirmed {
                receipt: Receipt {
                    tx_ref: tx_ref.clone(),
                    block_number: *block_number,
                    confirmations: (self.block_height - block_number + 1) as u32,
                    confirmed_at: Utc::now(),
                },
            },
        }
    }
}

/// Stub ledger for testing.
///
/// Transactions are mined on submission unless [`StubLedger::set_hold`] is on.
pub struct StubLedger {
    state: Mutex<StubState>,
    mined: Notify,
}

impl StubLedger {
    /// Create an empty stub ledger.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            mined: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep new transactions in the mempool until [`StubLedger::mine_pending`].
    pub fn set_hold(&self, hold: bool) {
        self.state().hold = hold;
    }

    /// Mine every pending transaction, in submission order. Returns how many.
    pub fn mine_pending(&self) -> usize {
        let count = {
            let mut state = self.state();
            let pending = std::mem::take(&mut state.mempool);
            for tx_ref in &pending {
                state.mine(tx_ref);
            }
            pending.len()
        };
        self.mined.notify_waiters();
        count
    }

    /// Make the next submission fail with `error`.
    pub fn fail_next(&self, error: LedgerError) {
        self.state().fail_next = Some(error);
    }

    /// Delay every receipt wait by `delay`.
    pub fn set_confirmation_delay(&self, delay: Option<Duration>) {
        self.state().confirmation_delay = delay;
    }

    /// Track a balance for `address`; untracked addresses are unlimited.
    pub fn set_balance(&self, address: &LedgerAddress, balance: Decimal) {
        self.state().balances.insert(address.clone(), balance);
    }

    /// Current tracked balance of `address`.
    pub fn balance(&self, address: &LedgerAddress) -> Option<Decimal> {
        self.state().balances.get(address).copied()
    }

    /// Total accepted submissions.
    pub fn submission_count(&self) -> usize {
        self.state().submissions.len()
    }

    /// Accepted submissions of one kind.
    pub fn submissions_of(&self, kind: OperationKind) -> usize {
        self.state().submissions.iter().filter(|k| **k == kind).count()
    }

    /// Ledger record, bypassing the connection check.
    pub fn agreement(&self, key: &AgreementKey) -> Option<LedgerAgreement> {
        self.state().agreements.get(key).cloned()
    }

    fn ensure_connected(state: &StubState) -> Result<(), LedgerError> {
        if state.connected {
            Ok(())
        } else {
            Err(LedgerError::NetworkUnavailable("stub ledger is offline".to_string()))
        }
    }
}

impl Default for StubLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerPort for StubLedger {
    async fn connect(&self) -> Result<NetworkInfo, LedgerError> {
        let mut state = self.state();
        state.connected = true;
        Ok(NetworkInfo {
            network: "stub".to_string(),
            chain_id: 31337,
            block_height: state.block_height,
        })
    }

    async fn disconnect(&self) -> Result<(), LedgerError> {
        self.state().connected = false;
        Ok(())
    }

    async fn submit(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<TxRef, LedgerError> {
        let tx_ref = {
            let mut state = self.state();
            Self::ensure_connected(&state)?;

            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }

            // Rejected at estimation time, nothing broadcast
            state.check(sender, call)?;

            state.tx_counter += 1;
            let tx_ref = TxRef::new(format!("0x{:064x}", state.tx_counter))
                .map_err(|e| LedgerError::MalformedResponse(e.to_string()))?;

            state.txs.insert(
                tx_ref.clone(),
                StubTx {
                    sender: sender.clone(),
                    call: call.clone(),
                    state: StubTxState::Pending,
                },
            );
            state.submissions.push(call.kind());

            if state.hold {
                state.mempool.push(tx_ref.clone());
            } else {
                state.mine(&tx_ref);
            }
            tx_ref
        };

        tracing::debug!(%tx_ref, method = call.method(), "Stub: transaction submitted");
        self.mined.notify_waiters();
        Ok(tx_ref)
    }

    async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, LedgerError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        Ok(state.status_of(tx_ref))
    }

    async fn wait_for_receipt(
        &self,
        tx_ref: &TxRef,
        confirmations: u32,
    ) -> Result<TxStatus, LedgerError> {
        let delay = self.state().confirmation_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        loop {
            let notified = self.mined.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                Self::ensure_connected(&state)?;
                let status = state.status_of(tx_ref);
                match &status {
                    TxStatus::Unknown => return Ok(status),
                    TxStatus::Reverted { .. } => return Ok(status),
                    TxStatus::Confirmed { receipt } if receipt.confirmations >= confirmations => {
                        return Ok(status)
                    },
                    _ => {},
                }
            }

            notified.await;
        }
    }

    async fn read_agreement(&self, key: &AgreementKey) -> Result<Option<LedgerAgreement>, LedgerError> {
        let state = self.state();
        Self::ensure_connected(&state)?;
        Ok(state.agreements.get(key).cloned())
    }
}

// =============================================================================
// Stub Identity
// =============================================================================

/// Static identity table for testing.
#[derive(Default)]
pub struct StubIdentity {
    bindings: RwLock<HashMap<UserId, LedgerAddress>>,
}

impl StubIdentity {
    /// Create an empty identity table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `address`.
    pub fn bind(&self, user: UserId, address: LedgerAddress) {
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.insert(user, address);
        }
    }

    /// Remove the binding of `user`.
    pub fn unbind(&self, user: UserId) {
        if let Ok(mut bindings) = self.bindings.write() {
            bindings.remove(&user);
        }
    }
}

#[async_trait]
impl IdentityPort for StubIdentity {
    async fn resolve(&self, user: UserId) -> Option<LedgerAddress> {
        self.bindings.read().ok()?.get(&user).cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_domain::AgreementId;
    use rust_decimal_macros::dec;

    fn needer() -> LedgerAddress {
        LedgerAddress::new("0x1111111111111111111111111111111111111111").unwrap()
    }

    fn provider() -> LedgerAddress {
        LedgerAddress::new("0x2222222222222222222222222222222222222222").unwrap()
    }

    fn key() -> AgreementKey {
        AgreementId::new("A1").unwrap().ledger_key()
    }

    fn create_call(amount: Decimal) -> LedgerCall {
        LedgerCall::CreateAgreement {
            key: key(),
            needer: needer(),
            provider: provider(),
            requirements: "r".to_string(),
            terms: "t".to_string(),
            escrow_amount: amount,
        }
    }

    async fn connected() -> StubLedger {
        let ledger = StubLedger::new();
        ledger.connect().await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_offline_ledger_rejects() {
        let ledger = StubLedger::new();
        let err = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap_err();
        assert!(matches!(err, LedgerError::NetworkUnavailable(_)));
        assert_eq!(ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_full_contract_lifecycle() {
        let ledger = connected().await;
        ledger.set_balance(&needer(), dec!(1000));

        ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();
        assert_eq!(ledger.balance(&needer()), Some(dec!(500)));

        ledger.submit(&provider(), &LedgerCall::AcceptAgreement { key: key() }).await.unwrap();
        ledger.submit(&needer(), &LedgerCall::CompleteAgreement { key: key() }).await.unwrap();
        ledger.submit(&provider(), &LedgerCall::WithdrawEscrow { key: key() }).await.unwrap();

        let record = ledger.agreement(&key()).unwrap();
        assert_eq!(record.status, LedgerStatus::Completed);
        assert_eq!(record.escrow_amount, dec!(0));
        assert_eq!(ledger.balance(&provider()), Some(dec!(500)));

        // Second withdrawal rejected
        let err = ledger
            .submit(&provider(), &LedgerCall::WithdrawEscrow { key: key() })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionViolated(_)));
        assert_eq!(ledger.submissions_of(OperationKind::Withdrawal), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let ledger = connected().await;
        ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();
        let err = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap_err();
        assert!(matches!(err, LedgerError::PreconditionViolated(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let ledger = connected().await;
        ledger.set_balance(&needer(), dec!(100));
        let err = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_role_guards() {
        let ledger = connected().await;
        assert!(ledger.submit(&provider(), &create_call(dec!(500))).await.is_err());

        ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();
        assert!(ledger.submit(&needer(), &LedgerCall::AcceptAgreement { key: key() }).await.is_err());
        assert!(ledger.submit(&provider(), &LedgerCall::CompleteAgreement { key: key() }).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_refunds_needer() {
        let ledger = connected().await;
        ledger.set_balance(&needer(), dec!(500));
        ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();
        ledger.submit(&provider(), &LedgerCall::CancelAgreement { key: key() }).await.unwrap();

        assert_eq!(ledger.agreement(&key()).unwrap().status, LedgerStatus::Cancelled);
        assert_eq!(ledger.balance(&needer()), Some(dec!(500)));
    }

    #[tokio::test]
    async fn test_held_transaction_pending_until_mined() {
        let ledger = connected().await;
        ledger.set_hold(true);

        let tx = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();
        assert_eq!(ledger.transaction_status(&tx).await.unwrap(), TxStatus::Pending);
        assert!(ledger.agreement(&key()).is_none());

        assert_eq!(ledger.mine_pending(), 1);
        assert!(ledger.transaction_status(&tx).await.unwrap().confirmed_with(1).is_some());
        assert!(ledger.agreement(&key()).is_some());
    }

    #[tokio::test]
    async fn test_wait_for_receipt_wakes_on_mine() {
        let ledger = std::sync::Arc::new(connected().await);
        ledger.set_hold(true);
        let tx = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            let tx = tx.clone();
            tokio::spawn(async move { ledger.wait_for_receipt(&tx, 1).await })
        };

        tokio::task::yield_now().await;
        ledger.mine_pending();

        let status = waiter.await.unwrap().unwrap();
        assert!(status.confirmed_with(1).is_some());
    }

    #[tokio::test]
    async fn test_held_transaction_reverts_if_state_moved() {
        let ledger = connected().await;
        ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap();

        // Both pass the guards at submission; mined in order, accept lands on a cancelled agreement
        ledger.set_hold(true);
        let cancel = ledger.submit(&needer(), &LedgerCall::CancelAgreement { key: key() }).await.unwrap();
        let accept = ledger.submit(&provider(), &LedgerCall::AcceptAgreement { key: key() }).await.unwrap();
        ledger.mine_pending();

        assert!(ledger.transaction_status(&cancel).await.unwrap().confirmed_with(1).is_some());
        assert!(matches!(
            ledger.transaction_status(&accept).await.unwrap(),
            TxStatus::Reverted { .. }
        ));
        assert_eq!(ledger.agreement(&key()).unwrap().status, LedgerStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_next() {
        let ledger = connected().await;
        ledger.fail_next(LedgerError::UserDeclined("rejected in wallet".to_string()));

        let err = ledger.submit(&needer(), &create_call(dec!(500))).await.unwrap_err();
        assert!(matches!(err, LedgerError::UserDeclined(_)));
        assert_eq!(ledger.submission_count(), 0);

        assert!(ledger.submit(&needer(), &create_call(dec!(500))).await.is_ok());
    }

    #[tokio::test]
    async fn test_identity_binding() {
        let identity = StubIdentity::new();
        let user = uuid::Uuid::now_v7();
        assert!(identity.resolve(user).await.is_none());

        identity.bind(user, needer());
        assert_eq!(identity.resolve(user).await, Some(needer()));

        identity.unbind(user);
        assert!(identity.resolve(user).await.is_none());
    }
}
