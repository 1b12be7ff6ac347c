//! Event bus for internal daemon communication.
//!
//! Carries status-change notifications from the orchestrator and reconciler
//! to whoever listens (the daemon's event loop logs them; the notification
//! collaborator would subscribe here).
//!
//! Uses tokio broadcast channels for fan-out to multiple receivers.

use chrono::{DateTime, Utc};
use escrow_domain::{AgreementId, AppStatus, OperationKind, Role, TxRef};
use escrow_exec::ReconcileOutcome;
use tokio::sync::broadcast;

// =============================================================================
// Event Types
// =============================================================================

/// Events that flow through the daemon event bus.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// Agreement registered in pending_funding
    AgreementRegistered {
        agreement_id: AgreementId,
        timestamp: DateTime<Utc>,
    },

    /// Mirror status changed
    StatusChanged {
        agreement_id: AgreementId,
        from: AppStatus,
        to: AppStatus,
        role: Option<Role>,
        timestamp: DateTime<Utc>,
    },

    /// Ledger operation submitted but not yet confirmed
    OperationPending {
        agreement_id: AgreementId,
        kind: OperationKind,
        tx_ref: TxRef,
        timestamp: DateTime<Utc>,
    },

    /// Reconciler resolved (or failed to resolve) a marker
    Reconciled {
        agreement_id: AgreementId,
        outcome: ReconcileOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Shutdown signal
    Shutdown,
}

impl DaemonEvent {
    /// Agreement the event concerns, if any
    pub fn agreement_id(&self) -> Option<&AgreementId> {
        match self {
            DaemonEvent::AgreementRegistered { agreement_id, .. }
            | DaemonEvent::StatusChanged { agreement_id, .. }
            | DaemonEvent::OperationPending { agreement_id, .. }
            | DaemonEvent::Reconciled { agreement_id, .. } => Some(agreement_id),
            DaemonEvent::Shutdown => None,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
///
/// Multiple producers can send events, and multiple consumers can receive.
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Slow receivers start missing events (lagging) past `capacity`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of receivers; 0 if nobody is listening.
    pub fn send(&self, event: DaemonEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events sent after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// A receiver fell behind the channel capacity and skipped events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event receiver lagged, missed {missed} events")]
pub struct Lagged {
    /// Number of skipped events
    pub missed: u64,
}

/// Receiver for daemon events.
///
/// Notifications are advisory: a lagging listener loses them, the mirror
/// store and its event log stay authoritative.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DaemonEvent>,
}

impl EventReceiver {
    /// Next event, `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Result<DaemonEvent, Lagged>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Err(Lagged { missed })),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Result<DaemonEvent, Lagged>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(Err(Lagged { missed })),
        }
    }

    /// Wait for the next event concerning `agreement_id`, skipping lag reports.
    pub async fn recv_for(&mut self, agreement_id: &AgreementId) -> Option<DaemonEvent> {
        while let Some(next) = self.recv().await {
            if let Ok(event) = next {
                if event.agreement_id() == Some(agreement_id) {
                    return Some(event);
                }
            }
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
