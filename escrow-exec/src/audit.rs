//! Lifecycle event recording.

use escrow_domain::LifecycleEvent;
use escrow_store::Store;
use tracing::warn;

/// Append `event` to the store's event log.
///
/// Audit failures never abort the operation that produced the event.
pub async fn record_event<S: Store + ?Sized>(store: &S, event: LifecycleEvent) {
    if let Err(e) = store.events().append(&event).await {
        warn!(
            agreement_id = %event.agreement_id(),
            event_type = event.event_type(),
            error = %e,
            "Failed to append lifecycle event"
        );
    }
}
