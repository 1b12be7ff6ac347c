//! Bounded-wait-then-poll confirmation.
//!
//! Wait up to `timeout` for the transport's receipt future. If it has not
//! settled by then, keep waiting on it while a fallback loop re-queries the
//! transaction status `poll_attempts` times, `poll_delay` apart. Whichever
//! settles first wins. If neither does, the result is
//! [`LedgerError::ConfirmationTimeout`], never a failure.
//!
//! The ledger client uses this for submissions; the reconciler uses it with a
//! zero timeout to re-poll a recorded transaction.

use std::future::Future;
use std::time::Duration;

use escrow_domain::{Receipt, TxRef, TxStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LedgerError;

/// Confirmation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    /// Bound on the primary receipt wait
    pub timeout: Duration,
    /// Confirmations required for success
    pub confirmations: u32,
    /// Fallback status queries after the primary wait expires
    pub poll_attempts: u32,
    /// Spacing between fallback queries
    pub poll_delay: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            confirmations: 1,
            poll_attempts: 10,
            poll_delay: Duration::from_secs(3),
        }
    }
}

impl ConfirmationPolicy {
    /// Policy that skips the primary wait and only re-polls
    pub fn poll_only(confirmations: u32, poll_attempts: u32, poll_delay: Duration) -> Self {
        Self {
            timeout: Duration::ZERO,
            confirmations,
            poll_attempts,
            poll_delay,
        }
    }
}

/// Decide whether a status settles the confirmation.
///
/// `Some(Ok)` on enough confirmations, `Some(Err)` on revert, `None` otherwise.
fn settle(status: TxStatus, confirmations: u32) -> Option<Result<Receipt, LedgerError>> {
    match status {
        TxStatus::Confirmed { receipt } if receipt.confirmations >= confirmations => Some(Ok(receipt)),
        TxStatus::Reverted { reason } => Some(Err(LedgerError::PreconditionViolated(format!(
            "transaction reverted: {}",
            reason
        )))),
        _ => None,
    }
}

async fn poll_until_settled<P, Fut>(
    policy: ConfirmationPolicy,
    tx_ref: &TxRef,
    mut poll: P,
) -> Option<Result<Receipt, LedgerError>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<TxStatus, LedgerError>>,
{
    for attempt in 1..=policy.poll_attempts {
        match poll().await {
            Ok(status) => {
                debug!(%tx_ref, attempt, ?status, "Fallback poll");
                if let Some(outcome) = settle(status, policy.confirmations) {
                    return Some(outcome);
                }
            },
            Err(e) => warn!(%tx_ref, attempt, error = %e, "Fallback poll failed"),
        }

        if attempt < policy.poll_attempts {
            tokio::time::sleep(policy.poll_delay).await;
        }
    }
    None
}

/// Run the bounded-wait-then-poll combinator.
///
/// # Arguments
///
/// * `policy` - Timeout, confirmations, poll count and poll delay
/// * `tx_ref` - Transaction being confirmed (for the timeout error and logs)
/// * `wait` - Primary receipt wait (e.g. [`crate::LedgerPort::wait_for_receipt`])
/// * `poll` - Produces one independent status query per call
///
/// # Errors
///
/// - `LedgerError::PreconditionViolated` if the transaction reverted
/// - `LedgerError::ConfirmationTimeout` if nothing settled
pub async fn bounded_wait_then_poll<W, P, Fut>(
    policy: &ConfirmationPolicy,
    tx_ref: &TxRef,
    wait: W,
    poll: P,
) -> Result<Receipt, LedgerError>
where
    W: Future<Output = Result<TxStatus, LedgerError>>,
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<TxStatus, LedgerError>>,
{
    tokio::pin!(wait);
    let mut wait_done = false;

    match tokio::time::timeout(policy.timeout, &mut wait).await {
        Ok(result) => {
            wait_done = true;
            match result {
                Ok(status) => {
                    if let Some(outcome) = settle(status, policy.confirmations) {
                        return outcome;
                    }
                },
                Err(e) => warn!(%tx_ref, error = %e, "Receipt wait failed, falling back to polling"),
            }
        },
        Err(_) => debug!(%tx_ref, timeout = ?policy.timeout, "Receipt wait timed out, polling"),
    }

    let fallback = poll_until_settled(*policy, tx_ref, poll);
    tokio::pin!(fallback);

    loop {
        tokio::select! {
            result = &mut wait, if !wait_done => {
                wait_done = true;
                if let Ok(status) = result {
                    if let Some(outcome) = settle(status, policy.confirmations) {
                        return outcome;
                    }
                }
            }
            outcome = &mut fallback => {
                return outcome.unwrap_or_else(|| Err(LedgerError::ConfirmationTimeout {
                    tx_ref: tx_ref.clone(),
                }));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn tx() -> TxRef {
        TxRef::new("0xfeed").unwrap()
    }

    fn confirmed(confirmations: u32) -> TxStatus {
        TxStatus::Confirmed {
            receipt: Receipt {
                tx_ref: tx(),
                block_number: 10,
                confirmations,
                confirmed_at: Utc::now(),
            },
        }
    }

    fn policy() -> ConfirmationPolicy {
        ConfirmationPolicy {
            timeout: Duration::from_secs(60),
            confirmations: 1,
            poll_attempts: 10,
            poll_delay: Duration::from_secs(3),
        }
    }

    fn counting_poll(
        counter: Arc<AtomicU32>,
        confirm_on: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<TxStatus, LedgerError>> + Send>> {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= confirm_on {
                    Ok(confirmed(1))
                } else {
                    Ok(TxStatus::Pending)
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_wait_confirms() {
        let polls = Arc::new(AtomicU32::new(0));
        let receipt = bounded_wait_then_poll(
            &policy(),
            &tx(),
            async { Ok::<_, LedgerError>(confirmed(1)) },
            counting_poll(polls.clone(), 1),
        )
        .await
        .unwrap();

        assert_eq!(receipt.block_number, 10);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_poll_confirms_after_timeout() {
        let polls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let receipt = bounded_wait_then_poll(
            &policy(),
            &tx(),
            std::future::pending::<Result<TxStatus, LedgerError>>(),
            counting_poll(polls.clone(), 3),
        )
        .await
        .unwrap();

        assert_eq!(receipt.tx_ref, tx());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        // 60s wait + two 3s gaps
        assert_eq!(started.elapsed(), Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_returns_timeout_not_failure() {
        let polls = Arc::new(AtomicU32::new(0));
        let err = bounded_wait_then_poll(
            &policy(),
            &tx(),
            std::future::pending::<Result<TxStatus, LedgerError>>(),
            counting_poll(polls.clone(), u32::MAX),
        )
        .await
        .unwrap_err();

        assert_eq!(err, LedgerError::ConfirmationTimeout { tx_ref: tx() });
        assert!(err.is_ambiguous());
        assert_eq!(polls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revert_is_precondition_violation() {
        let err = bounded_wait_then_poll(
            &policy(),
            &tx(),
            async {
                Ok::<_, LedgerError>(TxStatus::Reverted {
                    reason: "status is not Created".to_string(),
                })
            },
            counting_poll(Arc::new(AtomicU32::new(0)), 1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LedgerError::PreconditionViolated(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_confirmations_keep_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut p = policy();
        p.confirmations = 2;

        // Primary wait returns a receipt with too few confirmations
        let err = bounded_wait_then_poll(&p, &tx(), async { Ok::<_, LedgerError>(confirmed(1)) }, counting_poll(polls.clone(), 1))
            .await
            .unwrap_err();

        assert!(err.is_ambiguous());
        assert_eq!(polls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_error_falls_back_to_polling() {
        let polls = Arc::new(AtomicU32::new(0));
        let receipt = bounded_wait_then_poll(
            &policy(),
            &tx(),
            async { Err::<TxStatus, _>(LedgerError::NetworkUnavailable("socket closed".to_string())) },
            counting_poll(polls.clone(), 1),
        )
        .await
        .unwrap();

        assert_eq!(receipt.confirmations, 1);
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_primary_wait_wins_race() {
        let polls = Arc::new(AtomicU32::new(0));
        let late = async {
            tokio::time::sleep(Duration::from_secs(64)).await;
            Ok::<_, LedgerError>(confirmed(1))
        };

        let started = tokio::time::Instant::now();
        let receipt = bounded_wait_then_poll(&policy(), &tx(), late, counting_poll(polls.clone(), u32::MAX))
            .await
            .unwrap();

        assert_eq!(receipt.block_number, 10);
        assert_eq!(started.elapsed(), Duration::from_secs(64));
        assert!(polls.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_only_policy() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = ConfirmationPolicy::poll_only(1, 5, Duration::from_millis(100));

        let err = bounded_wait_then_poll(&p, &tx(), std::future::pending::<Result<TxStatus, LedgerError>>(), counting_poll(polls.clone(), u32::MAX))
            .await
            .unwrap_err();

        assert!(err.is_ambiguous());
        assert_eq!(polls.load(Ordering::SeqCst), 5);
    }
}
