//! Transaction Reconciler
//!
//! Resolves an in-flight marker against the ledger:
//!
//! 1. Re-read the ledger record directly.
//! 2. If it already reflects the operation's post-state, apply the transition,
//!    clear the marker, and report `Recovered`.
//! 3. Otherwise re-poll the recorded transaction a bounded number of times.
//!    A success receipt is handled as in (2); a revert clears the marker
//!    without changing the status.
//! 4. Otherwise leave the marker and report `Unresolved`. Failure is never
//!    inferred from silence.
//!
//! A marker that never recorded a transaction reference (the process died
//! between claiming and submitting) stays `Unresolved` until an operator
//! calls [`Reconciler::clear_orphaned`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use escrow_domain::{
    AgreementId, AppStatus, InFlightOperation, LifecycleEvent, MirrorRecord, OperationKind,
};
use escrow_engine::{AgreementStateMachine, EscrowFlags};
use escrow_store::Store;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::record_event;
use crate::client::{LedgerClient, PendingTx};
use crate::confirm::ConfirmationPolicy;
use crate::error::{ExecError, ExecResult, LedgerError};
use crate::ports::LedgerPort;

/// Result of one reconciliation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No marker on the record
    NothingInFlight,
    /// Ledger evidence found; transition applied and marker cleared
    Recovered {
        /// Operation that was recovered
        kind: OperationKind,
        /// Status after the transition
        app_status: AppStatus,
    },
    /// No evidence either way; marker kept
    Unresolved {
        /// Operation still in flight
        kind: OperationKind,
    },
    /// Ledger reported a revert; marker cleared, status unchanged
    Reverted {
        /// Operation that reverted
        kind: OperationKind,
        /// Revert reason
        reason: String,
    },
    /// Marker without a transaction and without ledger evidence; cleared on request
    Cleared {
        /// Operation that was abandoned
        kind: OperationKind,
    },
}

impl ReconcileOutcome {
    /// Operation kind involved, if any
    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            ReconcileOutcome::NothingInFlight => None,
            ReconcileOutcome::Recovered { kind, .. }
            | ReconcileOutcome::Unresolved { kind }
            | ReconcileOutcome::Reverted { kind, .. }
            | ReconcileOutcome::Cleared { kind } => Some(*kind),
        }
    }

    /// Whether the attempt applied a recovered transition
    pub fn is_recovered(&self) -> bool {
        matches!(self, ReconcileOutcome::Recovered { .. })
    }
}

/// What the ledger says about an in-flight operation
enum Evidence {
    Landed,
    Reverted(String),
    Inconclusive,
}

/// Transaction reconciler.
pub struct Reconciler<L: LedgerPort, S: Store> {
    client: Arc<LedgerClient<L>>,
    store: Arc<S>,
    machine: AgreementStateMachine,
    poll_policy: ConfirmationPolicy,
    grace: chrono::Duration,
}

impl<L: LedgerPort, S: Store> Reconciler<L, S> {
    /// Create a reconciler.
    ///
    /// # Arguments
    ///
    /// * `client` - Shared ledger client
    /// * `store` - Mirror store
    /// * `poll_policy` - Re-poll bounds for recorded transactions
    /// * `grace` - Age after which a marker counts as stale
    pub fn new(
        client: Arc<LedgerClient<L>>,
        store: Arc<S>,
        poll_policy: ConfirmationPolicy,
        grace: Duration,
    ) -> Self {
        Self {
            client,
            store,
            machine: AgreementStateMachine::new(),
            poll_policy,
            grace: chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Whether `record` carries a marker older than the grace period
    pub fn is_stale(&self, record: &MirrorRecord, now: DateTime<Utc>) -> bool {
        record
            .in_flight
            .as_ref()
            .map(|marker| marker.is_stale(now, self.grace))
            .unwrap_or(false)
    }

    /// Reconcile one agreement by id.
    pub async fn reconcile(&self, agreement_id: &AgreementId) -> ExecResult<ReconcileOutcome> {
        let record = self
            .store
            .mirrors()
            .find_by_id(agreement_id)
            .await?
            .ok_or_else(|| ExecError::AgreementNotFound(agreement_id.clone()))?;

        Ok(self.reconcile_record(record).await?.0)
    }

    /// Reconcile a loaded record, returning the outcome and the latest record.
    pub async fn reconcile_record(
        &self,
        record: MirrorRecord,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let Some(marker) = record.in_flight.clone() else {
            return Ok((ReconcileOutcome::NothingInFlight, record));
        };

        let agreement_id = record.agreement_id.clone();
        info!(%agreement_id, kind = ?marker.kind, tx_ref = ?marker.tx_ref, "Reconciling in-flight operation");
        record_event(
            self.store.as_ref(),
            LifecycleEvent::ReconciliationAttempted {
                agreement_id: agreement_id.clone(),
                kind: marker.kind,
                tx_ref: marker.tx_ref.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;

        match self.gather_evidence(&record, &marker).await {
            Evidence::Landed => self.apply_recovery(record, marker).await,
            Evidence::Reverted(reason) => self.apply_revert(record, marker, reason).await,
            Evidence::Inconclusive => {
                warn!(%agreement_id, kind = ?marker.kind, "In-flight operation unresolved, marker kept");
                record_event(
                    self.store.as_ref(),
                    LifecycleEvent::ReconciliationUnresolved {
                        agreement_id,
                        kind: marker.kind,
                        timestamp: Utc::now(),
                    },
                )
                .await;
                Ok((ReconcileOutcome::Unresolved { kind: marker.kind }, record))
            },
        }
    }

    /// Reconcile every record whose marker is older than the grace period.
    pub async fn reconcile_stale(
        &self,
        now: DateTime<Utc>,
    ) -> ExecResult<Vec<(AgreementId, ReconcileOutcome)>> {
        let candidates = self.store.mirrors().find_in_flight().await?;
        let mut results = Vec::new();

        for record in candidates.into_iter().filter(|r| self.is_stale(r, now)) {
            let agreement_id = record.agreement_id.clone();
            match self.reconcile_record(record).await {
                Ok((outcome, _)) => results.push((agreement_id, outcome)),
                Err(e) => warn!(%agreement_id, error = %e, "Reconciliation failed"),
            }
        }

        if !results.is_empty() {
            let recovered = results.iter().filter(|(_, o)| o.is_recovered()).count();
            info!(swept = results.len(), recovered, "Stale in-flight sweep finished");
        }

        Ok(results)
    }

    /// Operator path for a marker that never recorded a transaction.
    ///
    /// Once the marker is past the grace period and the ledger record shows no
    /// trace of the operation, the marker is dropped and the status left as
    /// is. Markers with a transaction reference, fresh markers, and unreadable
    /// ledgers go through [`Reconciler::reconcile_record`] instead.
    pub async fn clear_orphaned(
        &self,
        agreement_id: &AgreementId,
        now: DateTime<Utc>,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let record = self
            .store
            .mirrors()
            .find_by_id(agreement_id)
            .await?
            .ok_or_else(|| ExecError::AgreementNotFound(agreement_id.clone()))?;

        let Some(marker) = record.in_flight.clone() else {
            return Ok((ReconcileOutcome::NothingInFlight, record));
        };
        if marker.tx_ref.is_some() || !marker.is_stale(now, self.grace) {
            return self.reconcile_record(record).await;
        }

        match self.client.read_agreement(agreement_id).await {
            Ok(Some(ledger)) if ledger.reflects(marker.kind, &record) => {
                self.apply_recovery(record, marker).await
            },
            Ok(_) => self.apply_clear(record, marker).await,
            Err(e) => {
                warn!(%agreement_id, error = %e, "Ledger read failed, orphaned marker kept");
                Ok((ReconcileOutcome::Unresolved { kind: marker.kind }, record))
            },
        }
    }

    async fn gather_evidence(&self, record: &MirrorRecord, marker: &InFlightOperation) -> Evidence {
        let agreement_id = &record.agreement_id;

        match self.client.read_agreement(agreement_id).await {
            Ok(Some(ledger)) if ledger.reflects(marker.kind, record) => {
                debug!(%agreement_id, status = %ledger.status, "Ledger already reflects operation");
                return Evidence::Landed;
            },
            Ok(_) => {},
            Err(e) => {
                warn!(%agreement_id, error = %e, "Ledger read failed during reconciliation");
                return Evidence::Inconclusive;
            },
        }

        let Some(tx_ref) = marker.tx_ref.clone() else {
            warn!(%agreement_id, kind = ?marker.kind, "No transaction reference recorded, marker needs clear_orphaned");
            return Evidence::Inconclusive;
        };

        let pending = PendingTx {
            tx_ref,
            kind: marker.kind,
            key: agreement_id.ledger_key(),
            submitted_at: marker.submitted_at,
        };

        match self.client.confirm_with(&pending, &self.poll_policy).await {
            Ok(_) => Evidence::Landed,
            Err(LedgerError::PreconditionViolated(reason)) => Evidence::Reverted(reason),
            Err(_) => Evidence::Inconclusive,
        }
    }

    async fn apply_recovery(
        &self,
        record: MirrorRecord,
        marker: InFlightOperation,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let event = AgreementStateMachine::event_for(marker.kind);
        let transition = self.machine.transition(
            record.app_status,
            event,
            marker.initiated_by,
            EscrowFlags::from(&record),
        )?;

        let mut next = record.clone();
        transition.apply(&mut next);
        next.in_flight = None;

        let stored = match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => return self.after_conflict(&record.agreement_id).await,
            Err(e) => return Err(e.into()),
        };

        info!(
            agreement_id = %stored.agreement_id,
            kind = ?marker.kind,
            from = %transition.from,
            to = %transition.to,
            "Recovered in-flight operation"
        );

        let now = Utc::now();
        record_event(
            self.store.as_ref(),
            LifecycleEvent::ReconciliationRecovered {
                agreement_id: stored.agreement_id.clone(),
                kind: marker.kind,
                app_status: stored.app_status,
                timestamp: now,
            },
        )
        .await;
        if transition.changes_status() {
            record_event(
                self.store.as_ref(),
                LifecycleEvent::StatusChanged {
                    agreement_id: stored.agreement_id.clone(),
                    from: transition.from,
                    to: transition.to,
                    role: None,
                    timestamp: now,
                },
            )
            .await;
        }

        Ok((
            ReconcileOutcome::Recovered {
                kind: marker.kind,
                app_status: stored.app_status,
            },
            stored,
        ))
    }

    async fn apply_revert(
        &self,
        record: MirrorRecord,
        marker: InFlightOperation,
        reason: String,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let mut next = record.clone();
        next.in_flight = None;

        let stored = match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => return self.after_conflict(&record.agreement_id).await,
            Err(e) => return Err(e.into()),
        };

        warn!(agreement_id = %stored.agreement_id, kind = ?marker.kind, %reason, "In-flight operation reverted, marker cleared");
        record_event(
            self.store.as_ref(),
            LifecycleEvent::ReconciliationReverted {
                agreement_id: stored.agreement_id.clone(),
                kind: marker.kind,
                reason: reason.clone(),
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok((
            ReconcileOutcome::Reverted {
                kind: marker.kind,
                reason,
            },
            stored,
        ))
    }

    async fn apply_clear(
        &self,
        record: MirrorRecord,
        marker: InFlightOperation,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let mut next = record.clone();
        next.in_flight = None;

        let stored = match self.store.mirrors().update(&next, record.version).await {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => return self.after_conflict(&record.agreement_id).await,
            Err(e) => return Err(e.into()),
        };

        warn!(agreement_id = %stored.agreement_id, kind = ?marker.kind, "Orphaned in-flight marker cleared");
        record_event(
            self.store.as_ref(),
            LifecycleEvent::OperationFailed {
                agreement_id: stored.agreement_id.clone(),
                kind: marker.kind,
                reason: "no transaction recorded and no ledger evidence".to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;

        Ok((ReconcileOutcome::Cleared { kind: marker.kind }, stored))
    }

    /// Someone else wrote the record first; report what is there now.
    async fn after_conflict(
        &self,
        agreement_id: &AgreementId,
    ) -> ExecResult<(ReconcileOutcome, MirrorRecord)> {
        let current = self
            .store
            .mirrors()
            .find_by_id(agreement_id)
            .await?
            .ok_or_else(|| ExecError::AgreementNotFound(agreement_id.clone()))?;

        debug!(%agreement_id, "Reconciliation lost compare-and-swap");

        let outcome = match &current.in_flight {
            None => ReconcileOutcome::NothingInFlight,
            Some(marker) => ReconcileOutcome::Unresolved { kind: marker.kind },
        };
        Ok((outcome, current))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubLedger;
    use escrow_domain::{AgreementDraft, EscrowAmount, LedgerAddress, LedgerStatus, Role};
    use escrow_store::MemoryStore;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Fixture {
        ledger: Arc<StubLedger>,
        client: Arc<LedgerClient<StubLedger>>,
        store: Arc<MemoryStore>,
        reconciler: Reconciler<StubLedger, MemoryStore>,
    }

    fn needer() -> LedgerAddress {
        LedgerAddress::new("0x1111111111111111111111111111111111111111").unwrap()
    }

    fn provider() -> LedgerAddress {
        LedgerAddress::new("0x2222222222222222222222222222222222222222").unwrap()
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(StubLedger::new());
        let client = Arc::new(LedgerClient::new(
            ledger.clone(),
            ConfirmationPolicy {
                timeout: Duration::from_millis(20),
                confirmations: 1,
                poll_attempts: 2,
                poll_delay: Duration::from_millis(5),
            },
        ));
        client.connect().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            client.clone(),
            store.clone(),
            ConfirmationPolicy::poll_only(1, 2, Duration::from_millis(5)),
            Duration::from_secs(120),
        );
        Fixture {
            ledger,
            client,
            store,
            reconciler,
        }
    }

    /// Funded agreement, mirror in pending_acceptance
    async fn funded(f: &Fixture, id: &str) -> MirrorRecord {
        let agreement_id = AgreementId::new(id).unwrap();
        let pending = f
            .client
            .create_agreement(
                &needer(),
                &agreement_id,
                &needer(),
                &provider(),
                "r",
                "t",
                EscrowAmount::new(dec!(500)).unwrap(),
            )
            .await
            .unwrap();
        f.client.confirm(&pending).await.unwrap();

        let mut record = MirrorRecord::open(AgreementDraft {
            agreement_id,
            needer: Uuid::now_v7(),
            provider: Uuid::now_v7(),
            escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
            requirements: "r".to_string(),
            terms: "t".to_string(),
        });
        record.app_status = AppStatus::PendingAcceptance;
        record.escrow_funded = true;
        f.store.mirrors().insert(&record).await.unwrap();
        record
    }

    /// Submit acceptance and write the marker with its tx ref
    async fn accept_in_flight(f: &Fixture, record: &MirrorRecord) -> MirrorRecord {
        let pending = f.client.accept_agreement(&provider(), &record.agreement_id).await.unwrap();
        let mut marker = InFlightOperation::new(OperationKind::Acceptance, Role::Provider);
        marker.tx_ref = Some(pending.tx_ref);

        let mut next = record.clone();
        next.in_flight = Some(marker);
        f.store.mirrors().update(&next, record.version).await.unwrap()
    }

    #[tokio::test]
    async fn test_nothing_in_flight() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;

        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NothingInFlight);
    }

    #[tokio::test]
    async fn test_unknown_agreement() {
        let f = fixture().await;
        let err = f.reconciler.reconcile(&AgreementId::new("missing").unwrap()).await.unwrap_err();
        assert!(matches!(err, ExecError::AgreementNotFound(_)));
    }

    #[tokio::test]
    async fn test_recovers_when_ledger_reflects_operation() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;
        accept_in_flight(&f, &record).await;

        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Recovered {
                kind: OperationKind::Acceptance,
                app_status: AppStatus::PendingStart,
            }
        );

        let stored = f.store.mirrors().find_by_id(&record.agreement_id).await.unwrap().unwrap();
        assert_eq!(stored.app_status, AppStatus::PendingStart);
        assert!(stored.in_flight.is_none());

        let types: Vec<_> = f
            .store
            .events()
            .find_by_agreement(&record.agreement_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            types,
            vec!["reconciliation_attempted", "reconciliation_recovered", "status_changed"]
        );

        // Second pass is a no-op
        let again = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(again, ReconcileOutcome::NothingInFlight);
        assert_eq!(f.ledger.submissions_of(OperationKind::Acceptance), 1);
    }

    #[tokio::test]
    async fn test_unresolved_keeps_marker() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;
        f.ledger.set_hold(true);
        accept_in_flight(&f, &record).await;

        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved { kind: OperationKind::Acceptance });

        let stored = f.store.mirrors().find_by_id(&record.agreement_id).await.unwrap().unwrap();
        assert_eq!(stored.app_status, AppStatus::PendingAcceptance);
        assert!(stored.in_flight.is_some());

        // Lands later, next pass converges
        f.ledger.mine_pending();
        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert!(outcome.is_recovered());
        assert_eq!(
            f.ledger.agreement(&record.agreement_id.ledger_key()).unwrap().status,
            LedgerStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_revert_clears_marker_without_transition() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;

        // Needer's cancel is mined ahead of the acceptance, which then reverts
        f.ledger.set_hold(true);
        f.ledger
            .submit(&needer(), &escrow_domain::LedgerCall::CancelAgreement {
                key: record.agreement_id.ledger_key(),
            })
            .await
            .unwrap();
        let record = accept_in_flight(&f, &record).await;
        assert_eq!(f.ledger.mine_pending(), 2);

        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Reverted { kind: OperationKind::Acceptance, .. }));

        let stored = f.store.mirrors().find_by_id(&record.agreement_id).await.unwrap().unwrap();
        assert_eq!(stored.app_status, AppStatus::PendingAcceptance);
        assert!(stored.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_ledger_outage_is_unresolved() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;
        accept_in_flight(&f, &record).await;

        f.ledger.disconnect().await.unwrap();
        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved { kind: OperationKind::Acceptance });
    }

    #[tokio::test]
    async fn test_marker_without_tx_ref_and_no_evidence_is_unresolved() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;

        let mut next = record.clone();
        next.in_flight = Some(InFlightOperation::new(OperationKind::Acceptance, Role::Provider));
        f.store.mirrors().update(&next, record.version).await.unwrap();

        let outcome = f.reconciler.reconcile(&record.agreement_id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved { kind: OperationKind::Acceptance });
    }

    #[tokio::test]
    async fn test_clear_orphaned_marker_after_grace() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;

        let mut next = record.clone();
        next.in_flight = Some(InFlightOperation::new(OperationKind::Acceptance, Role::Provider));
        f.store.mirrors().update(&next, record.version).await.unwrap();

        // Inside the grace period the marker is left for the submitter
        let (outcome, _) = f.reconciler.clear_orphaned(&record.agreement_id, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved { kind: OperationKind::Acceptance });

        let later = Utc::now() + chrono::Duration::seconds(121);
        let (outcome, stored) = f.reconciler.clear_orphaned(&record.agreement_id, later).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Cleared { kind: OperationKind::Acceptance });
        assert!(stored.in_flight.is_none());
        assert_eq!(stored.app_status, AppStatus::PendingAcceptance);

        let events = f.store.events().find_by_agreement(&record.agreement_id).await.unwrap();
        assert_eq!(events.last().map(|e| e.event_type()), Some("operation_failed"));
        assert_eq!(f.ledger.submissions_of(OperationKind::Acceptance), 0);
    }

    #[tokio::test]
    async fn test_clear_orphaned_prefers_ledger_evidence() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;

        // Submitted, but the process died before the tx ref was written
        f.client.accept_agreement(&provider(), &record.agreement_id).await.unwrap();
        let mut next = record.clone();
        next.in_flight = Some(InFlightOperation::new(OperationKind::Acceptance, Role::Provider));
        f.store.mirrors().update(&next, record.version).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(121);
        let (outcome, stored) = f.reconciler.clear_orphaned(&record.agreement_id, later).await.unwrap();
        assert!(outcome.is_recovered());
        assert_eq!(stored.app_status, AppStatus::PendingStart);
    }

    #[tokio::test]
    async fn test_foreign_record_is_not_funding_evidence() {
        let f = fixture().await;
        let agreement_id = AgreementId::new("A1").unwrap();
        let foreign_needer = LedgerAddress::new("0x3333333333333333333333333333333333333333").unwrap();
        let foreign_provider = LedgerAddress::new("0x4444444444444444444444444444444444444444").unwrap();

        // Someone else's create at the same key is mined ahead of ours
        f.ledger.set_hold(true);
        f.client
            .create_agreement(
                &foreign_needer,
                &agreement_id,
                &foreign_needer,
                &foreign_provider,
                "r",
                "t",
                EscrowAmount::new(dec!(500)).unwrap(),
            )
            .await
            .unwrap();
        let ours = f
            .client
            .create_agreement(
                &needer(),
                &agreement_id,
                &needer(),
                &provider(),
                "r",
                "t",
                EscrowAmount::new(dec!(500)).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(f.ledger.mine_pending(), 2);

        let mut record = MirrorRecord::open(AgreementDraft {
            agreement_id: agreement_id.clone(),
            needer: Uuid::now_v7(),
            provider: Uuid::now_v7(),
            escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
            requirements: "r".to_string(),
            terms: "t".to_string(),
        });
        record.needer_address = Some(needer());
        record.provider_address = Some(provider());
        let mut marker = InFlightOperation::new(OperationKind::Funding, Role::Needer);
        marker.tx_ref = Some(ours.tx_ref);
        record.in_flight = Some(marker);
        f.store.mirrors().insert(&record).await.unwrap();

        let outcome = f.reconciler.reconcile(&agreement_id).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Reverted { kind: OperationKind::Funding, .. }));

        let stored = f.store.mirrors().find_by_id(&agreement_id).await.unwrap().unwrap();
        assert_eq!(stored.app_status, AppStatus::PendingFunding);
        assert!(!stored.escrow_funded);
        assert!(stored.in_flight.is_none());
    }

    #[tokio::test]
    async fn test_own_funding_record_recovers() {
        let f = fixture().await;
        let agreement_id = AgreementId::new("A1").unwrap();
        f.client
            .create_agreement(
                &needer(),
                &agreement_id,
                &needer(),
                &provider(),
                "r",
                "t",
                EscrowAmount::new(dec!(500)).unwrap(),
            )
            .await
            .unwrap();

        let mut record = MirrorRecord::open(AgreementDraft {
            agreement_id: agreement_id.clone(),
            needer: Uuid::now_v7(),
            provider: Uuid::now_v7(),
            escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
            requirements: "r".to_string(),
            terms: "t".to_string(),
        });
        record.needer_address = Some(needer());
        record.provider_address = Some(provider());
        record.in_flight = Some(InFlightOperation::new(OperationKind::Funding, Role::Needer));
        f.store.mirrors().insert(&record).await.unwrap();

        let outcome = f.reconciler.reconcile(&agreement_id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Recovered {
                kind: OperationKind::Funding,
                app_status: AppStatus::PendingAcceptance,
            }
        );
        let stored = f.store.mirrors().find_by_id(&agreement_id).await.unwrap().unwrap();
        assert!(stored.escrow_funded);
    }

    #[tokio::test]
    async fn test_stale_sweep_respects_grace() {
        let f = fixture().await;
        let record = funded(&f, "A1").await;
        accept_in_flight(&f, &record).await;

        let fresh = f.reconciler.reconcile_stale(Utc::now()).await.unwrap();
        assert!(fresh.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(121);
        let swept = f.reconciler.reconcile_stale(later).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert!(swept[0].1.is_recovered());
    }
}
