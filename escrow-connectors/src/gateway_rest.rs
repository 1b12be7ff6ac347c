//! Ledger Gateway REST Client
//!
//! Provides REST integration with the gateway that fronts the ledger node:
//! - Network info
//! - Transaction submission for the five agreement calls
//! - Transaction status and long-poll receipts
//! - Reading the ledger-resident agreement record
//!
//! # Authentication
//!
//! All requests are signed with the API key + secret:
//! - `X-ESCROW-APIKEY` header
//! - `timestamp` query parameter (unix millis)
//! - `signature` query parameter: hex HMAC SHA256 of the query string
//!   (without `signature`) followed by the request body

use chrono::{DateTime, Utc};
use escrow_domain::{
    AgreementKey, LedgerAddress, LedgerAgreement, LedgerCall, LedgerStatus, NetworkInfo, Receipt,
    TxRef, TxStatus,
};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Server-side hold for the receipt long-poll
const RECEIPT_LONG_POLL_SECS: u64 = 20;

/// Gateway error codes
pub mod codes {
    /// Signer rejected the transaction
    pub const USER_DECLINED: i64 = 4001;
    /// Sender balance cannot cover value + fees
    pub const INSUFFICIENT_FUNDS: i64 = 4002;
    /// Contract guard rejected the call
    pub const PRECONDITION_FAILED: i64 = 4003;
    /// Unknown agreement or transaction
    pub const NOT_FOUND: i64 = 4040;
    /// Ledger node unreachable
    pub const NODE_UNAVAILABLE: i64 = 5030;
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the gateway REST client.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Failed to build request signature
    #[error("Failed to build signature: {0}")]
    SignatureError(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// Gateway returned error
    #[error("Gateway API error: {code} - {msg}")]
    ApiError {
        /// Gateway error code (see [`codes`])
        code: i64,
        /// Gateway error message
        msg: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,
}

impl GatewayError {
    /// Transport-level failure (the gateway may not have seen the request)
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::RequestFailed(_) | GatewayError::Timeout)
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct GatewayErrorResponse {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkResponse {
    network: String,
    chain_id: u64,
    block_height: u64,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    sender: &'a LedgerAddress,
    call: &'a LedgerCall,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    tx_ref: String,
}

/// Transaction status as reported by `/v1/transactions/:ref`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxStatusResponse {
    tx_ref: String,
    state: String,
    block_number: Option<u64>,
    confirmations: Option<u32>,
    confirmed_at: Option<i64>,
    reason: Option<String>,
}

impl TxStatusResponse {
    fn into_domain(self) -> Result<TxStatus, GatewayError> {
        match self.state.as_str() {
            "unknown" => Ok(TxStatus::Unknown),
            "pending" => Ok(TxStatus::Pending),
            "reverted" => Ok(TxStatus::Reverted {
                reason: self.reason.unwrap_or_else(|| "reverted".to_string()),
            }),
            "confirmed" => {
                let tx_ref = TxRef::new(self.tx_ref).map_err(|e| GatewayError::ParseError(e.to_string()))?;
                let block_number = self
                    .block_number
                    .ok_or_else(|| GatewayError::ParseError("confirmed without blockNumber".to_string()))?;
                let confirmed_at = match self.confirmed_at {
                    Some(secs) => parse_unix(secs)?,
                    None => Utc::now(),
                };
                Ok(TxStatus::Confirmed {
                    receipt: Receipt {
                        tx_ref,
                        block_number,
                        confirmations: self.confirmations.unwrap_or(1),
                        confirmed_at,
                    },
                })
            },
            other => Err(GatewayError::ParseError(format!("unknown transaction state: {}", other))),
        }
    }
}

/// Agreement record as returned by `/v1/agreements/:key`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgreementResponse {
    key: String,
    needer: String,
    provider: String,
    requirements: String,
    terms: String,
    status: u8,
    created_at: i64,
    escrow_amount: Decimal,
}

impl AgreementResponse {
    fn into_domain(self) -> Result<LedgerAgreement, GatewayError> {
        let parse = |e: escrow_domain::DomainError| GatewayError::ParseError(e.to_string());
        Ok(LedgerAgreement {
            key: AgreementKey::from_hex(&self.key).map_err(parse)?,
            needer: LedgerAddress::new(&self.needer).map_err(parse)?,
            provider: LedgerAddress::new(&self.provider).map_err(parse)?,
            requirements: self.requirements,
            terms: self.terms,
            status: LedgerStatus::try_from(self.status).map_err(parse)?,
            created_at: parse_unix(self.created_at)?,
            escrow_amount: self.escrow_amount,
        })
    }
}

fn parse_unix(secs: i64) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| GatewayError::ParseError(format!("invalid timestamp: {}", secs)))
}

/// Hex HMAC SHA256 of `payload` under `secret`.
pub fn sign(secret: &str, payload: &str) -> Result<String, GatewayError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::SignatureError(format!("HMAC error: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// =============================================================================
// Gateway REST Client
// =============================================================================

/// Ledger gateway REST client.
pub struct LedgerGatewayClient {
    /// HTTP client
    client: Client,
    /// Gateway base URL (no trailing slash)
    base_url: String,
    /// API key
    api_key: String,
    /// API secret
    api_secret: String,
}

impl LedgerGatewayClient {
    /// Create a new gateway client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Gateway URL, e.g. `https://gateway.example.net`
    /// * `api_key` - Gateway API key
    /// * `api_secret` - Gateway API secret
    pub fn new(base_url: impl Into<String>, api_key: String, api_secret: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }

    /// Build the signed query string for a request.
    fn build_signed_query(
        &self,
        mut params: Vec<(&str, String)>,
        body: &str,
    ) -> Result<String, GatewayError> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        params.push(("timestamp", timestamp));
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let signature = sign(&self.api_secret, &format!("{}{}", query_string, body))?;

        Ok(format!("{}&signature={}", query_string, signature))
    }

    /// Send a signed request. `Ok(None)` on HTTP 404.
    async fn send_signed(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
        body: Option<String>,
        request_timeout: Duration,
    ) -> Result<Option<String>, GatewayError> {
        let body_str = body.unwrap_or_default();
        let query = self.build_signed_query(params, &body_str)?;
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        debug!(%method, endpoint, "Gateway request");

        let mut request = self
            .client
            .request(method, &url)
            .header("X-ESCROW-APIKEY", &self.api_key);
        if !body_str.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_str);
        }

        let response = timeout(request_timeout, request.send())
            .await
            .map_err(|_| GatewayError::Timeout)?
            .map_err(|e| GatewayError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| GatewayError::ParseError(e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<GatewayErrorResponse>(&text) {
                return Err(GatewayError::ApiError { code: err.code, msg: err.msg });
            }
            return Err(GatewayError::RequestFailed(format!("HTTP {}: {}", status, text)));
        }

        Ok(Some(text))
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }

    fn require_found(body: Option<String>, what: &str) -> Result<String, GatewayError> {
        body.ok_or_else(|| GatewayError::ApiError {
            code: codes::NOT_FOUND,
            msg: format!("{} not found", what),
        })
    }

    // =========================================================================
    // Network API
    // =========================================================================

    /// Get the network the gateway is attached to.
    ///
    /// # Endpoint
    ///
    /// `GET /v1/network`
    pub async fn network(&self) -> Result<NetworkInfo, GatewayError> {
        let body = self
            .send_signed(Method::GET, "/v1/network", vec![], None, Self::default_timeout())
            .await?;
        let body = Self::require_found(body, "network")?;

        let resp: NetworkResponse =
            serde_json::from_str(&body).map_err(|e| GatewayError::ParseError(e.to_string()))?;

        Ok(NetworkInfo {
            network: resp.network,
            chain_id: resp.chain_id,
            block_height: resp.block_height,
        })
    }

    // =========================================================================
    // Transaction API
    // =========================================================================

    /// Submit an agreement call signed by `sender`.
    ///
    /// # Endpoint
    ///
    /// `POST /v1/transactions`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let tx = client.submit(&provider, &LedgerCall::AcceptAgreement { key }).await?;
    /// println!("submitted {}", tx);
    /// ```
    pub async fn submit(&self, sender: &LedgerAddress, call: &LedgerCall) -> Result<TxRef, GatewayError> {
        let body = serde_json::to_string(&SubmitRequest { sender, call })
            .map_err(|e| GatewayError::ParseError(e.to_string()))?;

        let resp = self
            .send_signed(Method::POST, "/v1/transactions", vec![], Some(body), Self::default_timeout())
            .await?;
        let resp = Self::require_found(resp, "transactions endpoint")?;

        let parsed: SubmitResponse =
            serde_json::from_str(&resp).map_err(|e| GatewayError::ParseError(e.to_string()))?;

        TxRef::new(parsed.tx_ref).map_err(|e| GatewayError::ParseError(e.to_string()))
    }

    /// Get the current status of a transaction.
    ///
    /// # Endpoint
    ///
    /// `GET /v1/transactions/:ref`
    pub async fn transaction_status(&self, tx_ref: &TxRef) -> Result<TxStatus, GatewayError> {
        let endpoint = format!("/v1/transactions/{}", tx_ref);
        let body = self
            .send_signed(Method::GET, &endpoint, vec![], None, Self::default_timeout())
            .await?;

        match body {
            None => Ok(TxStatus::Unknown),
            Some(body) => serde_json::from_str::<TxStatusResponse>(&body)
                .map_err(|e| GatewayError::ParseError(e.to_string()))?
                .into_domain(),
        }
    }

    /// Long-poll for a receipt with at least `confirmations`.
    ///
    /// The gateway holds the request for up to its long-poll window and then
    /// answers with the current status, which may still be pending.
    ///
    /// # Endpoint
    ///
    /// `GET /v1/transactions/:ref/receipt?confirmations=N&waitSecs=S`
    pub async fn await_receipt(&self, tx_ref: &TxRef, confirmations: u32) -> Result<TxStatus, GatewayError> {
        let endpoint = format!("/v1/transactions/{}/receipt", tx_ref);
        let params = vec![
            ("confirmations", confirmations.to_string()),
            ("waitSecs", RECEIPT_LONG_POLL_SECS.to_string()),
        ];
        let body = self
            .send_signed(
                Method::GET,
                &endpoint,
                params,
                None,
                Duration::from_secs(RECEIPT_LONG_POLL_SECS + REQUEST_TIMEOUT_SECS),
            )
            .await?;

        match body {
            None => Ok(TxStatus::Unknown),
            Some(body) => serde_json::from_str::<TxStatusResponse>(&body)
                .map_err(|e| GatewayError::ParseError(e.to_string()))?
                .into_domain(),
        }
    }

    // =========================================================================
    // Agreement API
    // =========================================================================

    /// Read the ledger-resident agreement record. `Ok(None)` if absent.
    ///
    /// # Endpoint
    ///
    /// `GET /v1/agreements/:key`
    pub async fn agreement(&self, key: &AgreementKey) -> Result<Option<LedgerAgreement>, GatewayError> {
        let endpoint = format!("/v1/agreements/{}", key.to_hex());
        let body = self
            .send_signed(Method::GET, &endpoint, vec![], None, Self::default_timeout())
            .await?;

        body.map(|body| {
            serde_json::from_str::<AgreementResponse>(&body)
                .map_err(|e| GatewayError::ParseError(e.to_string()))?
                .into_domain()
        })
        .transpose()
    }
}

// =============================================================================
// Tests
// =============================================================================
