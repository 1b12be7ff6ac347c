//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Ledger client (stub or gateway transport)
//! - Workflow orchestrator and reconciler
//! - Event bus (status notifications)
//! - Reconciliation sweeper
//! - API server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Connect the ledger client
//! 2. Reconcile stale in-flight markers left by a previous run
//! 3. Start API server
//! 4. Start the periodic reconciliation sweep
//! 5. Main event loop (log notifications)
//! 6. Graceful shutdown on SIGINT

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use escrow_connectors::LedgerGatewayClient;
use escrow_exec::{GatewayLedger, IdentityPort, LedgerClient, LedgerPort, Reconciler, StubIdentity, StubLedger};
use escrow_store::{MemoryStore, Store};

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{DaemonEvent, EventBus};
use crate::sweeper::ReconcileSweeper;
use crate::workflow::WorkflowOrchestrator;

// =============================================================================
// Daemon
// =============================================================================

/// The main escrow daemon.
pub struct Daemon<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> {
    /// Configuration
    config: Config,
    /// Workflow orchestrator
    orchestrator: Arc<WorkflowOrchestrator<L, I, S>>,
    /// Event bus
    event_bus: Arc<EventBus>,
    /// Cancels background tasks on shutdown
    shutdown_token: CancellationToken,
}

impl Daemon<StubLedger, StubIdentity, MemoryStore> {
    /// Create a new daemon with the stub ledger and in-memory store (testing/development).
    pub fn new_stub(config: Config) -> Self {
        let identity = Arc::new(StubIdentity::new());
        for (user, address) in &config.identity_bindings {
            identity.bind(*user, address.clone());
        }
        Self::build(config, Arc::new(StubLedger::new()), identity, Arc::new(MemoryStore::new()))
    }
}

impl<S: Store + 'static> Daemon<GatewayLedger, StubIdentity, S> {
    /// Create a daemon backed by the REST ledger gateway.
    ///
    /// Identities come from the configured static binding table.
    pub fn new_gateway(config: Config, store: Arc<S>) -> Self {
        let gateway = LedgerGatewayClient::new(
            config.gateway.url.clone(),
            config.gateway.api_key.clone(),
            config.gateway.api_secret.clone(),
        );
        let identity = Arc::new(StubIdentity::new());
        for (user, address) in &config.identity_bindings {
            identity.bind(*user, address.clone());
        }
        Self::build(config, Arc::new(GatewayLedger::new(Arc::new(gateway))), identity, store)
    }
}

impl<L: LedgerPort + 'static, I: IdentityPort + 'static, S: Store + 'static> Daemon<L, I, S> {
    /// Wire a daemon from its collaborators.
    pub fn build(config: Config, transport: Arc<L>, identity: Arc<I>, store: Arc<S>) -> Self {
        let client = Arc::new(LedgerClient::new(transport, config.ledger.confirmation_policy()));
        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            store.clone(),
            config.ledger.reconcile_policy(),
            config.ledger.reconcile_grace,
        ));
        let event_bus = Arc::new(EventBus::new(1000));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            client,
            identity,
            store,
            reconciler,
            event_bus.clone(),
        ));

        Self {
            config,
            orchestrator,
            event_bus,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Workflow orchestrator
    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator<L, I, S>> {
        &self.orchestrator
    }

    /// Event bus
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT or the shutdown token).
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting escrow daemon"
        );

        // 1. Connect ledger
        let network = self.orchestrator.client().connect().await?;
        info!(network = %network.network, chain_id = network.chain_id, "Ledger ready");

        // 2. Reconcile markers left by a previous run
        self.recover_interrupted().await;

        // 3. Start API server
        let api_addr = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 4. Periodic reconciliation
        let sweeper = Arc::new(ReconcileSweeper::new(
            self.orchestrator.clone(),
            self.config.ledger.reconcile_interval,
            self.shutdown_token.clone(),
        ));
        let sweeper_handle = sweeper.start();

        // 5. Main event loop
        let mut event_receiver = self.event_bus.subscribe();
        info!("Entering main event loop");
        loop {
            tokio::select! {
                Some(event_result) = event_receiver.recv() => {
                    match event_result {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event) {
                                if matches!(e, DaemonError::Shutdown) {
                                    break;
                                }
                                error!(error = %e, "Error handling event");
                            }
                        }
                        Err(lagged) => {
                            warn!(missed = lagged.missed, "Event receiver lagged");
                        }
                    }
                }

                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown token cancelled");
                    break;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // 6. Graceful shutdown
        self.shutdown_token.cancel();
        if let Err(e) = sweeper_handle.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
        self.shutdown().await
    }

    /// Startup sweep over markers older than the grace period.
    async fn recover_interrupted(&self) {
        match self.orchestrator.sweep_stale().await {
            Ok(0) => info!("No interrupted operations to recover"),
            Ok(count) => info!(count, "Reconciled interrupted operations from previous run"),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }
    }

    /// Start the API server.
    async fn start_api_server(&self) -> DaemonResult<SocketAddr> {
        let state = Arc::new(ApiState {
            orchestrator: self.orchestrator.clone(),
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!(error = %e, "API server error");
            }
        });

        Ok(local_addr)
    }

    /// Handle an event from the event bus.
    fn handle_event(&self, event: DaemonEvent) -> DaemonResult<()> {
        match event {
            DaemonEvent::AgreementRegistered { agreement_id, .. } => {
                info!(%agreement_id, "Agreement registered");
            },

            DaemonEvent::StatusChanged {
                agreement_id,
                from,
                to,
                role,
                ..
            } => {
                info!(%agreement_id, %from, %to, ?role, "Agreement status changed");
            },

            DaemonEvent::OperationPending {
                agreement_id,
                kind,
                tx_ref,
                ..
            } => {
                info!(%agreement_id, %kind, %tx_ref, "Operation awaiting reconciliation");
            },

            DaemonEvent::Reconciled { agreement_id, outcome, .. } => {
                info!(%agreement_id, ?outcome, "Reconciliation finished");
            },

            DaemonEvent::Shutdown => {
                info!("Shutdown event received");
                return Err(DaemonError::Shutdown);
            },
        }

        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Submitted ledger operations keep running; their markers are picked up
    /// by the next start.
    async fn shutdown(&self) -> DaemonResult<()> {
        info!("Initiating graceful shutdown");

        if let Err(e) = self.orchestrator.client().disconnect().await {
            warn!(error = %e, "Ledger disconnect failed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
