//! Workflow Orchestrator: drives agreements through their lifecycle.
//!
//! Every mutating operation follows one template:
//!
//! 1. Load the mirror record (reconciling a stale in-flight marker first)
//! 2. Validate role and status with the state machine; reject with zero ledger calls
//! 3. Claim the in-flight marker via compare-and-swap (at most one outstanding operation)
//! 4. Submit through the ledger client and persist the tx reference into the marker.
//!    Steps 3 and 4 run as a detached task, so a caller that stops waiting
//!    cannot strand a marker without its transaction
//! 5. Confirm: success applies the transition and clears the marker; a revert
//!    clears the marker and surfaces the error; anything else keeps the marker
//!    for the reconciler
//!
//! Off-ledger operations skip 3-5 and write the transition with a single
//! compare-and-swap. Losing any compare-and-swap is reported as `AlreadyInFlight`.
//!
//! # Architecture
//!
//! ```text
//! API → WorkflowOrchestrator → AgreementStateMachine (legality)
//!              │                → IdentityPort (addresses)
//!              │                → LedgerClient (submit / confirm)
//!              │                → Store (mirror CAS, lifecycle log)
//!              └──────────────→ Reconciler (stale / interrupted markers)
//!                      ↓
//!               EventBus (status notifications)
//! ```

use std::sync::Arc;

use chrono::Utc;
use escrow_domain::{
    AgreementDraft, AgreementId, AppStatus, InFlightOperation, LedgerAddress, LedgerCall,
    LedgerStatus, LifecycleEvent, MirrorRecord, OperationKind, Role, TxRef, WorkflowEvent,
};
use escrow_engine::{AgreementStateMachine, Capabilities, EscrowFlags, Transition};
use escrow_exec::{
    record_event, IdentityPort, LedgerClient, LedgerError, LedgerPort, PendingTx, ReconcileOutcome,
    Reconciler,
};
use escrow_store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{DaemonEvent, EventBus};

// =============================================================================
// Outcomes
// =============================================================================

/// Which of the three caller-visible results an operation produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Transition applied and persisted
    Succeeded,
    /// Rejected or failed; the mirror is unchanged
    FailedSafe,
    /// Submitted but confirmation not observed; the reconciler will resolve it
    PendingReconciliation,
}

/// Result of a mutating workflow operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Transition applied
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// A stale marker was reconciled before this operation ran
    pub recovered_from_interruption: bool,
    /// Succeeded or pending (failures are returned as errors)
    pub status: OperationStatus,
    /// Mirror status after the operation
    pub app_status: AppStatus,
    /// Ledger transaction, for ledger-backed operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<TxRef>,
}

/// Per-role status snapshot, recomputed on every call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Agreement identifier
    pub agreement_id: AgreementId,
    /// Mirror status
    pub app_status: AppStatus,
    /// Escrow deposited
    pub escrow_funded: bool,
    /// Escrow withdrawn
    pub escrow_released: bool,
    /// Outstanding ledger operation; all actions are disabled while set
    pub in_flight: Option<OperationKind>,
    /// What the role may do now
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

/// Result of `check_interrupted_transactions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionReport {
    /// A marker was present when the check started
    pub has_interrupted: bool,
    /// Kind of the interrupted operation
    pub operation_kind: Option<OperationKind>,
    /// Human-readable summary
    pub message: String,
    /// Reconciliation result, when a marker was found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
}

impl InterruptionReport {
    fn none() -> Self {
        Self {
            has_interrupted: false,
            operation_kind: None,
            message: "No interrupted transactions".to_string(),
            outcome: None,
        }
    }
}

/// Result of `recover_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// The operation was recovered by this call
    pub recovered: bool,
    /// Human-readable summary
    pub message: String,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates the state machine, ledger client, mirror store and reconciler.
pub struct WorkflowOrchestrator<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> {
    /// Pure transition rules
    machine: AgreementStateMachine,
    /// Ledger submit / confirm
    client: Arc<LedgerClient<L>>,
    /// User id → ledger address
    identity: Arc<I>,
    /// Mirror store and lifecycle log
    store: Arc<S>,
    /// In-flight marker resolution
    reconciler: Arc<Reconciler<L, S>>,
    /// Status notifications
    event_bus: Arc<EventBus>,
}

impl<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> WorkflowOrchestrator<L, I, S> {
    /// Create a new orchestrator.
    pub fn new(
        client: Arc<LedgerClient<L>>,
        identity: Arc<I>,
        store: Arc<S>,
        reconciler: Arc<Reconciler<L, S>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            machine: AgreementStateMachine::new(),
            client,
            identity,
            store,
            reconciler,
            event_bus,
        }
    }

    /// Ledger client
    pub fn client(&self) -> &Arc<LedgerClient<L>> {
        &self.client
    }

    /// Reconciler
    pub fn reconciler(&self) -> &Arc<Reconciler<L, S>> {
        &self.reconciler
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Open an agreement from agreed terms (`TermsAccepted`). No ledger call.
    pub async fn register_agreement(&self, draft: AgreementDraft) -> DaemonResult<MirrorRecord> {
        draft.validate()?;

        let mut record = MirrorRecord::open(draft);
        record.app_status = self.machine.open();
        let agreement_id = record.agreement_id.clone();

        match self.store.mirrors().insert(&record).await {
            Ok(()) => {},
            Err(StoreError::Duplicate { .. }) => return Err(DaemonError::AgreementExists(agreement_id)),
            Err(e) => return Err(e.into()),
        }

        info!(
            %agreement_id,
            escrow_amount = %record.escrow_amount,
            "Agreement registered"
        );
        self.event_bus.send(DaemonEvent::AgreementRegistered {
            agreement_id,
            timestamp: Utc::now(),
        });

        Ok(record)
    }

    /// Register the agreement and fund it on behalf of the needer.
    ///
    /// Returns the funding outcome; its `tx_ref` is the `createAgreement`
    /// transaction.
    pub async fn create_agreement(&self, draft: AgreementDraft) -> DaemonResult<OperationOutcome> {
        let record = self.register_agreement(draft).await?;
        self.fund(&record.agreement_id, Role::Needer).await
    }

    // =========================================================================
    // Ledger-backed operations
    // =========================================================================

    /// `fundAgreement` (needer): deposit the escrow via `createAgreement`.
    pub async fn fund(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::Funded, role)?;
        self.ensure_idle(&record)?;

        let needer = self.resolve(&record, Role::Needer).await?;
        let provider = self.resolve(&record, Role::Provider).await?;

        let call = LedgerCall::CreateAgreement {
            key: agreement_id.ledger_key(),
            needer: needer.clone(),
            provider: provider.clone(),
            requirements: record.requirements.clone(),
            terms: record.terms.clone(),
            escrow_amount: record.escrow_amount.as_decimal(),
        };

        // Funding evidence on the ledger must carry these accounts
        let (needer_address, provider_address) = (needer.clone(), provider);
        self.run_ledger_operation(record, transition, role, needer, call, recovered, |r| {
            r.needer_address = Some(needer_address);
            r.provider_address = Some(provider_address);
        })
        .await
    }

    /// `acceptAgreement` (provider).
    pub async fn accept(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::Accepted, role)?;
        self.ensure_idle(&record)?;

        let sender = self.resolve(&record, role).await?;
        let call = LedgerCall::AcceptAgreement {
            key: agreement_id.ledger_key(),
        };

        self.run_ledger_operation(record, transition, role, sender, call, recovered, |_| {})
            .await
    }

    /// `reviewSubmission` (needer).
    ///
    /// Approval completes the agreement on the ledger; rejection sends the work
    /// back to `active` with no ledger call.
    pub async fn review_submission(
        &self,
        agreement_id: &AgreementId,
        role: Role,
        approved: bool,
        comments: Option<String>,
    ) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;

        if !approved {
            let transition = self.check(&record, WorkflowEvent::ChangesRequested, role)?;
            self.ensure_idle(&record)?;
            return self
                .run_off_ledger(record, transition, role, recovered, |r| r.review_comments = comments)
                .await;
        }

        let transition = self.check(&record, WorkflowEvent::Approved, role)?;
        self.ensure_idle(&record)?;

        let sender = self.resolve(&record, role).await?;
        let call = LedgerCall::CompleteAgreement {
            key: agreement_id.ledger_key(),
        };

        self.run_ledger_operation(record, transition, role, sender, call, recovered, |r| {
            r.review_comments = comments
        })
        .await
    }

    /// `withdrawEscrow` (provider). Requires the ledger record to be `Completed`.
    pub async fn withdraw(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::Withdrawn, role)?;
        self.ensure_idle(&record)?;

        let sender = self.resolve(&record, role).await?;

        let ledger = self.client.read_agreement(agreement_id).await?.ok_or_else(|| {
            DaemonError::PreconditionViolated(format!("no ledger record for {}", agreement_id))
        })?;
        if ledger.status != LedgerStatus::Completed {
            return Err(DaemonError::PreconditionViolated(format!(
                "ledger status is {}, withdrawal requires Completed",
                ledger.status
            )));
        }

        let call = LedgerCall::WithdrawEscrow {
            key: agreement_id.ledger_key(),
        };

        self.run_ledger_operation(record, transition, role, sender, call, recovered, |_| {})
            .await
    }

    /// `cancelAgreement` (either party).
    ///
    /// Funded agreements are cancelled on the ledger (refunding the needer);
    /// unfunded ones only in the mirror. Rejected while any operation is in
    /// flight.
    pub async fn cancel(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::Cancelled, role)?;
        self.ensure_idle(&record)?;

        if transition.ledger_operation.is_none() {
            return self.run_off_ledger(record, transition, role, recovered, |_| {}).await;
        }

        let sender = self.resolve(&record, role).await?;
        let call = LedgerCall::CancelAgreement {
            key: agreement_id.ledger_key(),
        };

        self.run_ledger_operation(record, transition, role, sender, call, recovered, |_| {})
            .await
    }

    // =========================================================================
    // Off-ledger operations
    // =========================================================================

    /// `startWork` (provider). No ledger call.
    pub async fn start_work(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::WorkStarted, role)?;
        self.ensure_idle(&record)?;
        self.run_off_ledger(record, transition, role, recovered, |_| {}).await
    }

    /// `submitForReview(note)` (provider). No ledger call.
    pub async fn submit_for_review(
        &self,
        agreement_id: &AgreementId,
        role: Role,
        note: String,
    ) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::SubmittedForReview, role)?;
        self.ensure_idle(&record)?;
        self.run_off_ledger(record, transition, role, recovered, |r| r.review_note = Some(note))
            .await
    }

    /// `raiseDispute` (either party). No ledger call.
    pub async fn raise_dispute(&self, agreement_id: &AgreementId, role: Role) -> DaemonResult<OperationOutcome> {
        let (record, recovered) = self.load_for_operation(agreement_id).await?;
        let transition = self.check(&record, WorkflowEvent::Disputed, role)?;
        self.ensure_idle(&record)?;
        self.run_off_ledger(record, transition, role, recovered, |_| {}).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Load the mirror record.
    pub async fn load(&self, agreement_id: &AgreementId) -> DaemonResult<MirrorRecord> {
        self.store
            .mirrors()
            .find_by_id(agreement_id)
            .await?
            .ok_or_else(|| DaemonError::AgreementNotFound(agreement_id.clone()))
    }

    /// `getWorkflowStatus(agreementId, role)`.
    pub async fn get_workflow_status(
        &self,
        agreement_id: &AgreementId,
        role: Role,
    ) -> DaemonResult<WorkflowStatus> {
        let record = self.load(agreement_id).await?;
        let capabilities =
            self.machine
                .capabilities(record.app_status, role, EscrowFlags::from(&record));

        let in_flight = record.in_flight.as_ref().map(|m| m.kind);
        let capabilities = if in_flight.is_some() {
            capabilities.frozen()
        } else {
            capabilities
        };

        Ok(WorkflowStatus {
            agreement_id: record.agreement_id,
            app_status: record.app_status,
            escrow_funded: record.escrow_funded,
            escrow_released: record.escrow_released,
            in_flight,
            capabilities,
        })
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// `checkInterruptedTransactions(agreementId)`.
    ///
    /// Reports any in-flight marker and reconciles it regardless of age.
    pub async fn check_interrupted_transactions(
        &self,
        agreement_id: &AgreementId,
    ) -> DaemonResult<InterruptionReport> {
        let record = self.load(agreement_id).await?;
        let Some(kind) = record.in_flight.as_ref().map(|m| m.kind) else {
            return Ok(InterruptionReport::none());
        };

        info!(%agreement_id, %kind, "Interrupted transaction found");
        let (outcome, _) = self.reconciler.reconcile_record(record).await?;
        self.publish_reconciled(agreement_id, &outcome);

        Ok(InterruptionReport {
            has_interrupted: true,
            operation_kind: Some(kind),
            message: describe(kind, &outcome),
            outcome: Some(outcome),
        })
    }

    /// Drop a marker that never recorded a transaction.
    ///
    /// Only clears once the marker is past the grace period and the ledger
    /// shows no trace of the operation; otherwise reconciles as usual.
    pub async fn clear_orphaned_marker(&self, agreement_id: &AgreementId) -> DaemonResult<InterruptionReport> {
        let record = self.load(agreement_id).await?;
        let Some(kind) = record.in_flight.as_ref().map(|m| m.kind) else {
            return Ok(InterruptionReport::none());
        };

        let (outcome, _) = self.reconciler.clear_orphaned(agreement_id, Utc::now()).await?;
        self.publish_reconciled(agreement_id, &outcome);

        Ok(InterruptionReport {
            has_interrupted: true,
            operation_kind: Some(kind),
            message: describe(kind, &outcome),
            outcome: Some(outcome),
        })
    }

    /// `recover<Kind>State(agreementId)`. Idempotent.
    ///
    /// Reconciles only if the outstanding marker is of `kind`; a second call
    /// after recovery finds no marker and reports `recovered: false`.
    pub async fn recover_state(
        &self,
        agreement_id: &AgreementId,
        kind: OperationKind,
    ) -> DaemonResult<RecoveryReport> {
        let record = self.load(agreement_id).await?;

        match record.in_flight.as_ref().map(|m| m.kind) {
            Some(found) if found == kind => {},
            Some(found) => {
                return Ok(RecoveryReport {
                    recovered: false,
                    message: format!("Outstanding operation is {}, not {}", found, kind),
                })
            },
            None => {
                return Ok(RecoveryReport {
                    recovered: false,
                    message: format!("No in-flight {} operation", kind),
                })
            },
        }

        let (outcome, _) = self.reconciler.reconcile_record(record).await?;
        self.publish_reconciled(agreement_id, &outcome);

        Ok(RecoveryReport {
            recovered: outcome.is_recovered(),
            message: describe(kind, &outcome),
        })
    }

    /// `recoverFundingState`
    pub async fn recover_funding_state(&self, agreement_id: &AgreementId) -> DaemonResult<RecoveryReport> {
        self.recover_state(agreement_id, OperationKind::Funding).await
    }

    /// `recoverAcceptanceState`
    pub async fn recover_acceptance_state(&self, agreement_id: &AgreementId) -> DaemonResult<RecoveryReport> {
        self.recover_state(agreement_id, OperationKind::Acceptance).await
    }

    /// `recoverCompletionState`
    pub async fn recover_completion_state(&self, agreement_id: &AgreementId) -> DaemonResult<RecoveryReport> {
        self.recover_state(agreement_id, OperationKind::Completion).await
    }

    /// `recoverWithdrawalState`
    pub async fn recover_withdrawal_state(&self, agreement_id: &AgreementId) -> DaemonResult<RecoveryReport> {
        self.recover_state(agreement_id, OperationKind::Withdrawal).await
    }

    /// `recoverCancellationState`
    pub async fn recover_cancellation_state(&self, agreement_id: &AgreementId) -> DaemonResult<RecoveryReport> {
        self.recover_state(agreement_id, OperationKind::Cancellation).await
    }

    /// Reconcile every stale marker. Used by the daemon's startup and periodic sweeps.
    pub async fn sweep_stale(&self) -> DaemonResult<usize> {
        let results = self.reconciler.reconcile_stale(Utc::now()).await?;
        for (agreement_id, outcome) in &results {
            self.publish_reconciled(agreement_id, outcome);
        }
        Ok(results.len())
    }

    // =========================================================================
    // Template steps
    // =========================================================================

    /// Load, reconciling a marker older than the grace period first.
    async fn load_for_operation(&self, agreement_id: &AgreementId) -> DaemonResult<(MirrorRecord, bool)> {
        let record = self.load(agreement_id).await?;
        if !self.reconciler.is_stale(&record, Utc::now()) {
            return Ok((record, false));
        }

        debug!(%agreement_id, "Stale in-flight marker on load");
        let (outcome, record) = self.reconciler.reconcile_record(record).await?;
        self.publish_reconciled(agreement_id, &outcome);
        Ok((record, outcome.is_recovered()))
    }

    fn check(&self, record: &MirrorRecord, event: WorkflowEvent, role: Role) -> DaemonResult<Transition> {
        Ok(self
            .machine
            .transition(record.app_status, event, role, EscrowFlags::from(record))?)
    }

    fn ensure_idle(&self, record: &MirrorRecord) -> DaemonResult<()> {
        match &record.in_flight {
            Some(marker) => Err(DaemonError::AlreadyInFlight {
                agreement_id: record.agreement_id.clone(),
                kind: Some(marker.kind),
            }),
            None => Ok(()),
        }
    }

    async fn resolve(&self, record: &MirrorRecord, role: Role) -> DaemonResult<LedgerAddress> {
        let user = record.party(role);
        self.identity.resolve(user).await.ok_or_else(|| {
            warn!(agreement_id = %record.agreement_id, %role, %user, "Identity unbound");
            DaemonError::IdentityUnbound { role, user }
        })
    }

    /// Apply the transition and clear the marker.
    async fn commit(&self, record: MirrorRecord, transition: &Transition, role: Role) -> DaemonResult<MirrorRecord> {
        let mut next = record.clone();
        transition.apply(&mut next);
        next.in_flight = None;

        let stored = match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => {
                // The reconciler may have applied the same transition already
                let current = self.load(&record.agreement_id).await?;
                if current.in_flight.is_none() && current.app_status == transition.to {
                    debug!(agreement_id = %record.agreement_id, "Transition already applied by reconciler");
                    return Ok(current);
                }
                return Err(e.into());
            },
            Err(e) => return Err(e.into()),
        };

        if transition.changes_status() {
            self.publish_status_change(&stored.agreement_id, transition, Some(role)).await;
        }
        Ok(stored)
    }

    fn submission(&self) -> Submission<L, S> {
        Submission {
            client: self.client.clone(),
            store: self.store.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_ledger_operation(
        &self,
        record: MirrorRecord,
        transition: Transition,
        role: Role,
        sender: LedgerAddress,
        call: LedgerCall,
        recovered: bool,
        edit: impl FnOnce(&mut MirrorRecord),
    ) -> DaemonResult<OperationOutcome> {
        let mut next = record.clone();
        edit(&mut next);
        next.in_flight = Some(InFlightOperation::new(call.kind(), role));

        // Only the confirmation wait below belongs to the caller
        let task = tokio::spawn(self.submission().run(record, next, sender, call));
        let (claimed, pending) = task
            .await
            .map_err(|e| DaemonError::Internal(format!("submission task failed: {}", e)))??;

        self.finish(claimed, transition, role, pending, recovered).await
    }

    async fn finish(
        &self,
        claimed: MirrorRecord,
        transition: Transition,
        role: Role,
        pending: PendingTx,
        recovered: bool,
    ) -> DaemonResult<OperationOutcome> {
        let agreement_id = claimed.agreement_id.clone();
        let kind = pending.kind;

        match self.client.confirm(&pending).await {
            Ok(receipt) => {
                let stored = self.commit(claimed, &transition, role).await?;
                record_event(
                    self.store.as_ref(),
                    LifecycleEvent::OperationConfirmed {
                        agreement_id: agreement_id.clone(),
                        kind,
                        tx_ref: receipt.tx_ref.clone(),
                        block_number: receipt.block_number,
                        timestamp: Utc::now(),
                    },
                )
                .await;

                info!(%agreement_id, %kind, app_status = %stored.app_status, "Operation succeeded");
                Ok(OperationOutcome {
                    success: true,
                    message: format!("{} confirmed in block {}", kind, receipt.block_number),
                    recovered_from_interruption: recovered,
                    status: OperationStatus::Succeeded,
                    app_status: stored.app_status,
                    tx_ref: Some(pending.tx_ref),
                })
            },
            Err(LedgerError::PreconditionViolated(reason)) => {
                let submission = self.submission();
                submission.release(&claimed).await;
                submission.record_failure(&agreement_id, kind, &reason).await;
                Err(LedgerError::PreconditionViolated(reason).into())
            },
            Err(e) => {
                // The transaction exists; without a revert only the reconciler may clear the marker
                let now = Utc::now();
                record_event(
                    self.store.as_ref(),
                    LifecycleEvent::OperationPending {
                        agreement_id: agreement_id.clone(),
                        kind,
                        tx_ref: pending.tx_ref.clone(),
                        timestamp: now,
                    },
                )
                .await;
                self.event_bus.send(DaemonEvent::OperationPending {
                    agreement_id: agreement_id.clone(),
                    kind,
                    tx_ref: pending.tx_ref.clone(),
                    timestamp: now,
                });

                warn!(%agreement_id, %kind, tx_ref = %pending.tx_ref, error = %e, "Confirmation not observed, will reconcile");
                let message = if e.is_ambiguous() {
                    format!("{} submitted, pending confirmation; will reconcile", kind)
                } else {
                    format!("{} submitted, confirmation failed ({}); will reconcile", kind, e)
                };
                Ok(OperationOutcome {
                    success: false,
                    message,
                    recovered_from_interruption: recovered,
                    status: OperationStatus::PendingReconciliation,
                    app_status: claimed.app_status,
                    tx_ref: Some(pending.tx_ref),
                })
            },
        }
    }

    async fn run_off_ledger(
        &self,
        record: MirrorRecord,
        transition: Transition,
        role: Role,
        recovered: bool,
        edit: impl FnOnce(&mut MirrorRecord),
    ) -> DaemonResult<OperationOutcome> {
        let agreement_id = record.agreement_id.clone();
        let mut next = record.clone();
        transition.apply(&mut next);
        edit(&mut next);

        let stored = match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => return Err(lost_race(self.store.as_ref(), &agreement_id).await),
            Err(e) => return Err(e.into()),
        };

        if transition.changes_status() {
            self.publish_status_change(&agreement_id, &transition, Some(role)).await;
        }

        info!(%agreement_id, event = %transition.event, app_status = %stored.app_status, "Off-ledger transition applied");
        Ok(OperationOutcome {
            success: true,
            message: format!("{} -> {}", transition.from, transition.to),
            recovered_from_interruption: recovered,
            status: OperationStatus::Succeeded,
            app_status: stored.app_status,
            tx_ref: None,
        })
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    async fn publish_status_change(&self, agreement_id: &AgreementId, transition: &Transition, role: Option<Role>) {
        let timestamp = Utc::now();
        record_event(
            self.store.as_ref(),
            LifecycleEvent::StatusChanged {
                agreement_id: agreement_id.clone(),
                from: transition.from,
                to: transition.to,
                role,
                timestamp,
            },
        )
        .await;
        self.event_bus.send(DaemonEvent::StatusChanged {
            agreement_id: agreement_id.clone(),
            from: transition.from,
            to: transition.to,
            role,
            timestamp,
        });
    }

    fn publish_reconciled(&self, agreement_id: &AgreementId, outcome: &ReconcileOutcome) {
        self.event_bus.send(DaemonEvent::Reconciled {
            agreement_id: agreement_id.clone(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
        });
    }
}

// =============================================================================
// Submission
// =============================================================================

/// Claim, submit, and record the tx reference as one unit.
///
/// Runs on its own task; dropping the caller does not stop it.
struct Submission<L: LedgerPort + 'static, S: Store + 'static> {
    client: Arc<LedgerClient<L>>,
    store: Arc<S>,
}

impl<L: LedgerPort + 'static, S: Store + 'static> Submission<L, S> {
    async fn run(
        self,
        record: MirrorRecord,
        next: MirrorRecord,
        sender: LedgerAddress,
        call: LedgerCall,
    ) -> DaemonResult<(MirrorRecord, PendingTx)> {
        let kind = call.kind();
        let agreement_id = record.agreement_id.clone();
        let claimed = self.claim(&record, next).await?;

        let pending = match self.client.submit(&sender, call).await {
            Ok(pending) => pending,
            Err(e) => {
                self.release(&claimed).await;
                self.record_failure(&agreement_id, kind, &e.to_string()).await;
                return Err(e.into());
            },
        };

        record_event(
            self.store.as_ref(),
            LifecycleEvent::OperationSubmitted {
                agreement_id,
                kind,
                tx_ref: pending.tx_ref.clone(),
                timestamp: pending.submitted_at,
            },
        )
        .await;

        let claimed = self.persist_tx_ref(claimed, &pending.tx_ref).await?;
        Ok((claimed, pending))
    }

    /// Write the in-flight marker carried by `next`.
    async fn claim(&self, record: &MirrorRecord, next: MirrorRecord) -> DaemonResult<MirrorRecord> {
        match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_conflict() => Err(lost_race(self.store.as_ref(), &record.agreement_id).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the tx reference in the marker so an abandoned wait is reconcilable.
    async fn persist_tx_ref(&self, record: MirrorRecord, tx_ref: &TxRef) -> DaemonResult<MirrorRecord> {
        let mut next = record.clone();
        if let Some(marker) = next.in_flight.as_mut() {
            marker.tx_ref = Some(tx_ref.clone());
        }

        match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_conflict() => {
                warn!(agreement_id = %record.agreement_id, %tx_ref, "Marker changed before tx ref was recorded");
                self.store
                    .mirrors()
                    .find_by_id(&record.agreement_id)
                    .await?
                    .ok_or_else(|| DaemonError::AgreementNotFound(record.agreement_id.clone()))
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the marker after a definite failure.
    async fn release(&self, record: &MirrorRecord) {
        let mut next = record.clone();
        next.in_flight = None;

        if let Err(e) = self.store.mirrors().update(&next, record.version).await {
            warn!(agreement_id = %record.agreement_id, error = %e, "Failed to clear in-flight marker");
        }
    }

    async fn record_failure(&self, agreement_id: &AgreementId, kind: OperationKind, reason: &str) {
        warn!(%agreement_id, %kind, %reason, "Operation failed, marker cleared");
        record_event(
            self.store.as_ref(),
            LifecycleEvent::OperationFailed {
                agreement_id: agreement_id.clone(),
                kind,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }
}

/// Error for a lost compare-and-swap: another operation got there first.
async fn lost_race<S: Store>(store: &S, agreement_id: &AgreementId) -> DaemonError {
    let kind = match store.mirrors().find_by_id(agreement_id).await {
        Ok(Some(current)) => current.in_flight.map(|m| m.kind),
        Ok(None) => return DaemonError::AgreementNotFound(agreement_id.clone()),
        Err(e) => return e.into(),
    };
    debug!(%agreement_id, ?kind, "Lost compare-and-swap");
    DaemonError::AlreadyInFlight {
        agreement_id: agreement_id.clone(),
        kind,
    }
}

fn describe(kind: OperationKind, outcome: &ReconcileOutcome) -> String {
    match outcome {
        ReconcileOutcome::NothingInFlight => format!("No in-flight {} operation", kind),
        ReconcileOutcome::Recovered { app_status, .. } => {
            format!("Recovered {} from ledger; status is now {}", kind, app_status)
        },
        ReconcileOutcome::Unresolved { .. } => {
            format!("{} still unconfirmed on the ledger; will retry", kind)
        },
        ReconcileOutcome::Reverted { reason, .. } => format!("{} reverted on the ledger: {}", kind, reason),
        ReconcileOutcome::Cleared { .. } => format!("{} never reached the ledger; marker cleared", kind),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use escrow_domain::{AgreementKey, EscrowAmount, LedgerAgreement, NetworkInfo, TxStatus};
    use escrow_exec::{ConfirmationPolicy, LedgerError, StubIdentity, StubLedger};
    use escrow_store::{EventRepository, MemoryStore, MirrorRepository};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};
    use uuid::Uuid;

    const GRACE: Duration = Duration::from_secs(60);

    struct Harness<L: LedgerPort + 'static = StubLedger, S: Store + 'static = MemoryStore> {
        ledger: Arc<StubLedger>,
        identity: Arc<StubIdentity>,
        store: Arc<S>,
        orchestrator: WorkflowOrchestrator<L, StubIdentity, S>,
        needer: Uuid,
        provider: Uuid,
    }

    async fn harness() -> Harness {
        let ledger = Arc::new(StubLedger::new());
        harness_over(ledger.clone(), ledger, Arc::new(MemoryStore::new())).await
    }

    /// Orchestrator over any transport and store; `ledger` is the stub behind `transport`.
    async fn harness_over<L: LedgerPort + 'static, S: Store + 'static>(
        ledger: Arc<StubLedger>,
        transport: Arc<L>,
        store: Arc<S>,
    ) -> Harness<L, S> {
        let client = Arc::new(LedgerClient::new(
            transport,
            ConfirmationPolicy {
                timeout: Duration::from_millis(30),
                confirmations: 1,
                poll_attempts: 2,
                poll_delay: Duration::from_millis(5),
            },
        ));
        client.connect().await.unwrap();

        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            store.clone(),
            ConfirmationPolicy::poll_only(1, 2, Duration::from_millis(5)),
            GRACE,
        ));

        let identity = Arc::new(StubIdentity::new());
        let needer = Uuid::now_v7();
        let provider = Uuid::now_v7();
        identity.bind(needer, LedgerAddress::new("0x1111111111111111111111111111111111111111").unwrap());
        identity.bind(provider, LedgerAddress::new("0x2222222222222222222222222222222222222222").unwrap());

        let orchestrator = WorkflowOrchestrator::new(
            client,
            identity.clone(),
            store.clone(),
            reconciler,
            Arc::new(EventBus::new(100)),
        );

        Harness {
            ledger,
            identity,
            store,
            orchestrator,
            needer,
            provider,
        }
    }

    fn draft<L: LedgerPort + 'static, S: Store + 'static>(h: &Harness<L, S>, id: &str) -> AgreementDraft {
        AgreementDraft {
            agreement_id: AgreementId::new(id).unwrap(),
            needer: h.needer,
            provider: h.provider,
            escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
            requirements: "Logo design".to_string(),
            terms: "Two revisions".to_string(),
        }
    }

    /// Stub transport whose `submit` can be parked before or after it reaches the ledger
    struct GatedLedger {
        inner: Arc<StubLedger>,
        park_before: AtomicBool,
        park_after: AtomicBool,
        parked: Notify,
        resume: Notify,
    }

    impl GatedLedger {
        fn new(inner: Arc<StubLedger>) -> Self {
            Self {
                inner,
                park_before: AtomicBool::new(false),
                park_after: AtomicBool::new(false),
                parked: Notify::new(),
                resume: Notify::new(),
            }
        }

        async fn park(&self) {
            self.parked.notify_one();
            self.resume.notified().await;
        }
    }

    #[async_trait]
    impl LedgerPort for GatedLedger {
        async fn connect(&self) -> Result<NetworkInfo, LedgerError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) -> Result<(), LedgerError> {
            self.inner.disconnect().await
        }

        async fn submit(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<TxRef, LedgerError> {
            if self.park_before.swap(false, Ordering::SeqCst) {
                self.park().await;
            }
            let tx_ref = self.inner.submit(sender, call).await?;
            if self.park_after.swap(false, Ordering::SeqCst) {
                self.park().await;
            }
            Ok(tx_ref)
        }

        async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, LedgerError> {
            self.inner.transaction_status(tx_ref).await
        }

        async fn wait_for_receipt(&self, tx_ref: &TxRef, confirmations: u32) -> Result<TxStatus, LedgerError> {
            self.inner.wait_for_receipt(tx_ref, confirmations).await
        }

        async fn read_agreement(&self, key: &AgreementKey) -> Result<Option<LedgerAgreement>, LedgerError> {
            self.inner.read_agreement(key).await
        }
    }

    /// Memory store that holds the next `n` reads until `n` readers arrived
    struct LockstepStore {
        inner: MemoryStore,
        pending_reads: AtomicUsize,
        barrier: Barrier,
    }

    impl LockstepStore {
        fn new(readers: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                pending_reads: AtomicUsize::new(0),
                barrier: Barrier::new(readers),
            }
        }

        fn hold_next_reads(&self, n: usize) {
            self.pending_reads.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MirrorRepository for LockstepStore {
        async fn insert(&self, record: &MirrorRecord) -> Result<(), StoreError> {
            self.inner.mirrors().insert(record).await
        }

        async fn find_by_id(&self, id: &AgreementId) -> Result<Option<MirrorRecord>, StoreError> {
            let held = self
                .pending_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let record = self.inner.mirrors().find_by_id(id).await;
            if held {
                self.barrier.wait().await;
            }
            record
        }

        async fn update(&self, record: &MirrorRecord, expected_version: u64) -> Result<MirrorRecord, StoreError> {
            self.inner.mirrors().update(record, expected_version).await
        }

        async fn find_in_flight(&self) -> Result<Vec<MirrorRecord>, StoreError> {
            self.inner.mirrors().find_in_flight().await
        }

        async fn find_by_status(&self, status: AppStatus) -> Result<Vec<MirrorRecord>, StoreError> {
            self.inner.mirrors().find_by_status(status).await
        }
    }

    impl Store for LockstepStore {
        fn mirrors(&self) -> &dyn MirrorRepository {
            self
        }

        fn events(&self) -> &dyn EventRepository {
            self.inner.events()
        }
    }

    fn id(value: &str) -> AgreementId {
        AgreementId::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate() {
        let h = harness().await;
        let record = h.orchestrator.register_agreement(draft(&h, "A1")).await.unwrap();
        assert_eq!(record.app_status, AppStatus::PendingFunding);

        let err = h.orchestrator.register_agreement(draft(&h, "A1")).await.unwrap_err();
        assert!(matches!(err, DaemonError::AgreementExists(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_same_party() {
        let h = harness().await;
        let mut d = draft(&h, "A1");
        d.provider = d.needer;

        let err = h.orchestrator.register_agreement(d).await.unwrap_err();
        assert!(matches!(err, DaemonError::Domain(_)));
    }

    #[tokio::test]
    async fn test_fund_moves_to_pending_acceptance() {
        let h = harness().await;
        let outcome = h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, OperationStatus::Succeeded);
        assert_eq!(outcome.app_status, AppStatus::PendingAcceptance);
        assert!(outcome.tx_ref.is_some());

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        assert!(record.escrow_funded);
        assert!(record.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_wrong_role_rejected_without_ledger_call() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        let before = h.ledger.submission_count();

        let err = h.orchestrator.accept(&id("A1"), Role::Needer).await.unwrap_err();
        assert!(matches!(err, DaemonError::Engine(_)));
        assert_eq!(h.ledger.submission_count(), before);
    }

    #[tokio::test]
    async fn test_unbound_identity_fails_closed() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.identity.unbind(h.provider);

        let err = h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap_err();
        assert!(matches!(err, DaemonError::IdentityUnbound { role: Role::Provider, .. }));

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        assert!(record.in_flight.is_none());
        assert_eq!(h.ledger.submissions_of(OperationKind::Acceptance), 0);
    }

    #[tokio::test]
    async fn test_declined_submission_clears_marker() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.ledger.fail_next(LedgerError::UserDeclined("rejected in wallet".to_string()));

        let err = h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap_err();
        assert!(matches!(err, DaemonError::Ledger(LedgerError::UserDeclined(_))));
        assert_eq!(err.outcome_kind(), OperationStatus::FailedSafe);

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        assert!(record.in_flight.is_none());
        assert_eq!(record.app_status, AppStatus::PendingAcceptance);

        // Retry succeeds
        let outcome = h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap();
        assert_eq!(outcome.app_status, AppStatus::PendingStart);
    }

    #[tokio::test]
    async fn test_unconfirmed_submission_keeps_marker() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.ledger.set_hold(true);

        let outcome = h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, OperationStatus::PendingReconciliation);

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        let marker = record.in_flight.unwrap();
        assert_eq!(marker.kind, OperationKind::Acceptance);
        assert_eq!(marker.tx_ref, outcome.tx_ref);

        // Any further mutation is rejected locally
        let err = h.orchestrator.cancel(&id("A1"), Role::Needer).await.unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyInFlight { kind: Some(OperationKind::Acceptance), .. }));

        let status = h.orchestrator.get_workflow_status(&id("A1"), Role::Needer).await.unwrap();
        assert_eq!(status.in_flight, Some(OperationKind::Acceptance));
        assert!(!status.capabilities.can_cancel);
    }

    #[tokio::test]
    async fn test_recover_is_idempotent() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.ledger.set_hold(true);
        h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap();
        h.ledger.mine_pending();

        let first = h.orchestrator.recover_acceptance_state(&id("A1")).await.unwrap();
        assert!(first.recovered);

        let second = h.orchestrator.recover_acceptance_state(&id("A1")).await.unwrap();
        assert!(!second.recovered);
        assert_eq!(h.ledger.submissions_of(OperationKind::Acceptance), 1);

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        assert_eq!(record.app_status, AppStatus::PendingStart);
    }

    #[tokio::test]
    async fn test_recover_wrong_kind_is_noop() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.ledger.set_hold(true);
        h.orchestrator.accept(&id("A1"), Role::Provider).await.unwrap();
        h.ledger.mine_pending();

        let report = h.orchestrator.recover_completion_state(&id("A1")).await.unwrap();
        assert!(!report.recovered);
        assert!(h.orchestrator.load(&id("A1")).await.unwrap().in_flight.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_funding_is_off_ledger() {
        let h = harness().await;
        h.orchestrator.register_agreement(draft(&h, "A1")).await.unwrap();

        let outcome = h.orchestrator.cancel(&id("A1"), Role::Provider).await.unwrap();
        assert_eq!(outcome.app_status, AppStatus::Cancelled);
        assert!(outcome.tx_ref.is_none());
        assert_eq!(h.ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_withdraw_requires_completed_ledger() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        let err = h.orchestrator.withdraw(&id("A1"), Role::Provider).await.unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(h.ledger.submissions_of(OperationKind::Withdrawal), 0);
    }

    #[tokio::test]
    async fn test_changes_requested_returns_to_active() {
        let h = harness().await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.orchestrator.accept(&a1, Role::Provider).await.unwrap();
        h.orchestrator.start_work(&a1, Role::Provider).await.unwrap();
        h.orchestrator
            .submit_for_review(&a1, Role::Provider, "delivered v1".to_string())
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .review_submission(&a1, Role::Needer, false, Some("darker blue".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.app_status, AppStatus::Active);

        let record = h.orchestrator.load(&a1).await.unwrap();
        assert_eq!(record.review_note.as_deref(), Some("delivered v1"));
        assert_eq!(record.review_comments.as_deref(), Some("darker blue"));
        assert_eq!(h.ledger.submissions_of(OperationKind::Completion), 0);
    }

    #[tokio::test]
    async fn test_dispute_freezes_agreement() {
        let h = harness().await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        let outcome = h.orchestrator.raise_dispute(&a1, Role::Provider).await.unwrap();
        assert_eq!(outcome.app_status, AppStatus::Disputed);

        let err = h.orchestrator.accept(&a1, Role::Provider).await.unwrap_err();
        assert!(matches!(err, DaemonError::Engine(_)));
    }

    #[tokio::test]
    async fn test_disconnect_during_submission_keeps_marker() {
        let ledger = Arc::new(StubLedger::new());
        let gated = Arc::new(GatedLedger::new(ledger.clone()));
        let h = harness_over(ledger.clone(), gated.clone(), Arc::new(MemoryStore::new())).await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        // The transaction is on the ledger, then the client goes away before confirming
        gated.park_after.store(true, Ordering::SeqCst);
        let (outcome, _) = tokio::join!(h.orchestrator.accept(&a1, Role::Provider), async {
            gated.parked.notified().await;
            h.orchestrator.client().disconnect().await.unwrap();
            gated.resume.notify_one();
        });

        let outcome = outcome.unwrap();
        assert_eq!(outcome.status, OperationStatus::PendingReconciliation);
        assert_eq!(outcome.app_status, AppStatus::PendingAcceptance);

        let record = h.orchestrator.load(&a1).await.unwrap();
        let marker = record.in_flight.unwrap();
        assert_eq!(marker.kind, OperationKind::Acceptance);
        assert_eq!(marker.tx_ref, outcome.tx_ref);

        h.orchestrator.client().connect().await.unwrap();
        let report = h.orchestrator.check_interrupted_transactions(&a1).await.unwrap();
        assert!(report.outcome.unwrap().is_recovered());

        let record = h.orchestrator.load(&a1).await.unwrap();
        assert_eq!(record.app_status, AppStatus::PendingStart);
        assert!(record.in_flight.is_none());
        assert_eq!(ledger.submissions_of(OperationKind::Acceptance), 1);
    }

    #[tokio::test]
    async fn test_revert_on_confirmation_clears_marker() {
        let h = harness().await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        // The needer's cancel is mined ahead of the acceptance
        h.ledger.set_hold(true);
        h.ledger
            .submit(
                &LedgerAddress::new("0x1111111111111111111111111111111111111111").unwrap(),
                &LedgerCall::CancelAgreement { key: a1.ledger_key() },
            )
            .await
            .unwrap();
        let mine = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            h.ledger.mine_pending();
        };
        let (result, _) = tokio::join!(h.orchestrator.accept(&a1, Role::Provider), mine);

        let err = result.unwrap_err();
        assert!(matches!(err, DaemonError::Ledger(LedgerError::PreconditionViolated(_))));
        let record = h.orchestrator.load(&a1).await.unwrap();
        assert!(record.in_flight.is_none());
        assert_eq!(record.app_status, AppStatus::PendingAcceptance);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_strand_marker() {
        let ledger = Arc::new(StubLedger::new());
        let gated = Arc::new(GatedLedger::new(ledger.clone()));
        let h = harness_over(ledger.clone(), gated.clone(), Arc::new(MemoryStore::new())).await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        // Caller gives up while the submission is still on its way to the ledger
        gated.park_before.store(true, Ordering::SeqCst);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), h.orchestrator.accept(&a1, Role::Provider)).await;
        assert!(abandoned.is_err());

        gated.parked.notified().await;
        gated.resume.notify_one();

        let mut recorded = None;
        for _ in 0..200 {
            let record = h.orchestrator.load(&a1).await.unwrap();
            if let Some(tx_ref) = record.in_flight.and_then(|m| m.tx_ref) {
                recorded = Some(tx_ref);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(recorded.is_some());
        assert_eq!(ledger.submissions_of(OperationKind::Acceptance), 1);

        let report = h.orchestrator.check_interrupted_transactions(&a1).await.unwrap();
        assert!(report.outcome.unwrap().is_recovered());

        let outcome = h.orchestrator.start_work(&a1, Role::Provider).await.unwrap();
        assert_eq!(outcome.app_status, AppStatus::Active);
    }

    #[tokio::test]
    async fn test_orphaned_marker_cleared_after_grace() {
        let h = harness().await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        // Claimed long ago, never submitted
        let record = h.orchestrator.load(&a1).await.unwrap();
        let mut next = record.clone();
        let mut marker = InFlightOperation::new(OperationKind::Acceptance, Role::Provider);
        marker.submitted_at = Utc::now() - chrono::Duration::seconds(GRACE.as_secs() as i64 + 1);
        next.in_flight = Some(marker);
        h.store.mirrors().update(&next, record.version).await.unwrap();

        let err = h.orchestrator.cancel(&a1, Role::Needer).await.unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyInFlight { .. }));

        let report = h.orchestrator.clear_orphaned_marker(&a1).await.unwrap();
        assert!(report.has_interrupted);
        assert_eq!(report.outcome, Some(ReconcileOutcome::Cleared { kind: OperationKind::Acceptance }));

        let outcome = h.orchestrator.accept(&a1, Role::Provider).await.unwrap();
        assert_eq!(outcome.app_status, AppStatus::PendingStart);
        assert_eq!(h.ledger.submissions_of(OperationKind::Acceptance), 1);

        let report = h.orchestrator.clear_orphaned_marker(&a1).await.unwrap();
        assert!(!report.has_interrupted);
    }

    #[tokio::test]
    async fn test_concurrent_off_ledger_operations() {
        let ledger = Arc::new(StubLedger::new());
        let store = Arc::new(LockstepStore::new(2));
        let h = harness_over(ledger.clone(), ledger, store.clone()).await;
        let a1 = id("A1");
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();
        h.orchestrator.accept(&a1, Role::Provider).await.unwrap();

        // Both calls read the same version before either writes
        store.hold_next_reads(2);
        let (start, dispute) = tokio::join!(
            h.orchestrator.start_work(&a1, Role::Provider),
            h.orchestrator.raise_dispute(&a1, Role::Needer)
        );

        let results = [&start, &dispute];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(DaemonError::AlreadyInFlight { kind: None, .. })))
                .count(),
            1
        );

        let record = h.orchestrator.load(&a1).await.unwrap();
        assert!(matches!(record.app_status, AppStatus::Active | AppStatus::Disputed));
    }

    #[tokio::test]
    async fn test_funding_records_ledger_accounts() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        let record = h.orchestrator.load(&id("A1")).await.unwrap();
        let on_ledger = h.ledger.agreement(&id("A1").ledger_key()).unwrap();
        assert_eq!(record.needer_address.as_ref(), Some(&on_ledger.needer));
        assert_eq!(record.provider_address.as_ref(), Some(&on_ledger.provider));
        assert!(on_ledger.belongs_to(&record));
    }

    #[tokio::test]
    async fn test_status_changes_are_logged() {
        let h = harness().await;
        h.orchestrator.create_agreement(draft(&h, "A1")).await.unwrap();

        let events = h.store.events().find_by_agreement(&id("A1")).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["operation_submitted", "status_changed", "operation_confirmed"]);
    }
}
