//! Reconciliation sweeper.
//!
//! Background task that periodically reconciles every in-flight marker older
//! than the grace period, so interrupted operations converge even if nobody
//! loads the agreement again.

use std::sync::Arc;
use std::time::Duration;

use escrow_exec::{IdentityPort, LedgerPort};
use escrow_store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workflow::WorkflowOrchestrator;

/// Periodic stale-marker sweep.
pub struct ReconcileSweeper<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> {
    orchestrator: Arc<WorkflowOrchestrator<L, I, S>>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> ReconcileSweeper<L, I, S> {
    /// Create a sweeper that stops when `shutdown_token` is cancelled.
    pub fn new(
        orchestrator: Arc<WorkflowOrchestrator<L, I, S>>,
        interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown_token,
        }
    }

    /// Run one sweep. Returns how many markers were examined.
    pub async fn sweep_once(&self) -> usize {
        match self.orchestrator.sweep_stale().await {
            Ok(count) => {
                if count > 0 {
                    info!(count, "Reconciled stale in-flight operations");
                } else {
                    debug!("No stale in-flight operations");
                }
                count
            },
            Err(e) => {
                warn!(error = %e, "Reconciliation sweep failed");
                0
            },
        }
    }

    /// Start the sweeper in the background.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Reconciliation sweeper started");

            let mut ticker = tokio::time::interval(self.interval);
            // First tick fires immediately; startup already swept
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        info!("Reconciliation sweeper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::Daemon;
    use escrow_domain::{AgreementDraft, AgreementId, AppStatus, EscrowAmount, LedgerAddress, Role};
    use escrow_exec::{StubIdentity, StubLedger};
    use escrow_store::MemoryStore;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn pending_acceptance_daemon() -> (Daemon<StubLedger, StubIdentity, MemoryStore>, Arc<StubLedger>) {
        let ledger = Arc::new(StubLedger::new());
        let identity = Arc::new(StubIdentity::new());
        let needer = Uuid::now_v7();
        let provider = Uuid::now_v7();
        identity.bind(needer, LedgerAddress::new("0x1111111111111111111111111111111111111111").unwrap());
        identity.bind(provider, LedgerAddress::new("0x2222222222222222222222222222222222222222").unwrap());

        let mut config = Config::test();
        config.ledger.reconcile_grace = Duration::ZERO;
        let daemon = Daemon::build(config, ledger.clone(), identity, Arc::new(MemoryStore::new()));
        let orchestrator = daemon.orchestrator();
        orchestrator.client().connect().await.unwrap();

        orchestrator
            .create_agreement(AgreementDraft {
                agreement_id: AgreementId::new("A1").unwrap(),
                needer,
                provider,
                escrow_amount: EscrowAmount::new(dec!(500)).unwrap(),
                requirements: "Logo design".to_string(),
                terms: "Two revisions".to_string(),
            })
            .await
            .unwrap();

        ledger.set_hold(true);
        orchestrator
            .accept(&AgreementId::new("A1").unwrap(), Role::Provider)
            .await
            .unwrap();

        (daemon, ledger)
    }

    #[tokio::test]
    async fn test_sweep_once_recovers_landed_operation() {
        let (daemon, ledger) = pending_acceptance_daemon().await;
        let sweeper = ReconcileSweeper::new(
            daemon.orchestrator().clone(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        // Still held: examined but unresolved
        assert_eq!(sweeper.sweep_once().await, 1);
        let id = AgreementId::new("A1").unwrap();
        assert!(daemon.orchestrator().load(&id).await.unwrap().in_flight.is_some());

        ledger.mine_pending();
        assert_eq!(sweeper.sweep_once().await, 1);

        let record = daemon.orchestrator().load(&id).await.unwrap();
        assert_eq!(record.app_status, AppStatus::PendingStart);
        assert!(record.in_flight.is_none());
        assert_eq!(sweeper.sweep_once().await, 0);
    }

    #[tokio::test]
    async fn test_background_sweeper_stops_on_shutdown() {
        let (daemon, ledger) = pending_acceptance_daemon().await;
        ledger.mine_pending();

        let token = CancellationToken::new();
        let sweeper = Arc::new(ReconcileSweeper::new(
            daemon.orchestrator().clone(),
            Duration::from_millis(10),
            token.clone(),
        ));
        let handle = sweeper.start();

        let id = AgreementId::new("A1").unwrap();
        let mut recovered = false;
        for _ in 0..100 {
            if daemon.orchestrator().load(&id).await.unwrap().in_flight.is_none() {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(recovered);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
