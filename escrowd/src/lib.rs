//! Escrow Workflow Daemon Library
//!
//! Runtime orchestrator for escrow-backed agreements between a needer and a
//! provider. The ledger holds the funds; this daemon keeps the application's
//! mirror of each agreement consistent with it.
//!
//! # Architecture
//!
//! ```text
//! HTTP API → Workflow Orchestrator → State Machine (escrow-engine)
//!                    │             → Ledger Client (escrow-exec) → Ledger
//!                    │             → Mirror Store (escrow-store)
//!                    ↓
//!               Event Bus (status notifications)
//!                    ↑
//!          Reconciliation Sweeper (stale in-flight markers)
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Workflow Orchestrator**: Validates, submits, confirms and persists lifecycle operations
//! - **Reconciliation Sweeper**: Periodically resolves interrupted operations
//! - **Event Bus**: Status-change notifications
//! - **API**: HTTP endpoints
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use escrowd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config);
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event_bus;
pub mod sweeper;
pub mod workflow;

// Re-exports for convenience
pub use config::{ApiConfig, Config, Environment, GatewayConfig, LedgerConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{DaemonEvent, EventBus, EventReceiver, Lagged};
pub use sweeper::ReconcileSweeper;
pub use workflow::{
    InterruptionReport, OperationOutcome, OperationStatus, RecoveryReport, WorkflowOrchestrator,
    WorkflowStatus,
};
