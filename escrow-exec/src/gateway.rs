//! Gateway ledger adapter.
//!
//! Implements [`LedgerPort`] over the signed REST gateway client.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use escrow_connectors::gateway_rest::codes;
use escrow_connectors::{GatewayError, LedgerGatewayClient};
use escrow_domain::{
    AgreementKey, LedgerAddress, LedgerAgreement, LedgerCall, NetworkInfo, TxRef, TxStatus,
};

use crate::error::LedgerError;
use crate::ports::LedgerPort;

/// Ledger transport backed by the REST gateway.
pub struct GatewayLedger {
    client: Arc<LedgerGatewayClient>,
}

impl GatewayLedger {
    /// Wrap a gateway client.
    pub fn new(client: Arc<LedgerGatewayClient>) -> Self {
        Self { client }
    }
}

impl From<GatewayError> for LedgerError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ApiError { code, msg } => match code {
                codes::USER_DECLINED => LedgerError::UserDeclined(msg),
                codes::INSUFFICIENT_FUNDS => LedgerError::InsufficientFunds(msg),
                codes::PRECONDITION_FAILED | codes::NOT_FOUND => LedgerError::PreconditionViolated(msg),
                codes::NODE_UNAVAILABLE => LedgerError::NetworkUnavailable(msg),
                other => LedgerError::NetworkUnavailable(format!("gateway error {}: {}", other, msg)),
            },
            GatewayError::ParseError(msg) => LedgerError::MalformedResponse(msg),
            GatewayError::RequestFailed(msg) | GatewayError::SignatureError(msg) => {
                LedgerError::NetworkUnavailable(msg)
            },
            GatewayError::Timeout => LedgerError::NetworkUnavailable("gateway request timed out".to_string()),
        }
    }
}

#[async_trait]
impl LedgerPort for GatewayLedger {
    async fn connect(&self) -> Result<NetworkInfo, LedgerError> {
        Ok(self.client.network().await?)
    }

    async fn disconnect(&self) -> Result<(), LedgerError> {
        // Stateless HTTP; nothing to tear down
        Ok(())
    }

    async fn submit(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<TxRef, LedgerError> {
        Ok(self.client.submit(sender, call).await?)
    }

    async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, LedgerError> {
        Ok(self.client.transaction_status(tx_ref).await?)
    }

    async fn wait_for_receipt(
        &self,
        tx_ref: &TxRef,
        confirmations: u32,
    ) -> Result<TxStatus, LedgerError> {
        loop {
            match self.client.await_receipt(tx_ref, confirmations).await {
                Ok(TxStatus::Confirmed { receipt }) if receipt.confirmations >= confirmations => {
                    return Ok(TxStatus::Confirmed { receipt });
                },
                Ok(status @ TxStatus::Reverted { .. }) => return Ok(status),
                Ok(status) => debug!(%tx_ref, ?status, "Receipt long-poll returned unsettled"),
                Err(GatewayError::Timeout) => debug!(%tx_ref, "Receipt long-poll timed out"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read_agreement(&self, key: &AgreementKey) -> Result<Option<LedgerAgreement>, LedgerError> {
        Ok(self.client.agreement(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_mapping() {
        let api = |code| GatewayError::ApiError {
            code,
            msg: "m".to_string(),
        };

        assert!(matches!(LedgerError::from(api(codes::USER_DECLINED)), LedgerError::UserDeclined(_)));
        assert!(matches!(
            LedgerError::from(api(codes::INSUFFICIENT_FUNDS)),
            LedgerError::InsufficientFunds(_)
        ));
        assert!(matches!(
            LedgerError::from(api(codes::PRECONDITION_FAILED)),
            LedgerError::PreconditionViolated(_)
        ));
        assert!(matches!(
            LedgerError::from(api(codes::NODE_UNAVAILABLE)),
            LedgerError::NetworkUnavailable(_)
        ));
        assert!(matches!(LedgerError::from(api(9999)), LedgerError::NetworkUnavailable(_)));
        assert!(matches!(
            LedgerError::from(GatewayError::ParseError("x".to_string())),
            LedgerError::MalformedResponse(_)
        ));
        assert!(matches!(LedgerError::from(GatewayError::Timeout), LedgerError::NetworkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_network_unavailable() {
        let client = LedgerGatewayClient::new("http://127.0.0.1:1", "key".to_string(), "secret".to_string());
        let ledger = GatewayLedger::new(Arc::new(client));

        let err = ledger.connect().await.unwrap_err();
        assert!(matches!(err, LedgerError::NetworkUnavailable(_)));
    }
}
