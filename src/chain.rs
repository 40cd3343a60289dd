//! Ledger RPC client
//!
//! JSON-RPC 2.0 client for the ledger service that reads balances and sends
//! transfers. Configured from `[ledger]` and LEDGER_RPC_URL.
//!
//! Transfer failures are classified for the payout processor:
//! - transport errors, HTTP 429/5xx and unknown server errors are transient
//! - invalid params, invalid destination and insufficient funds are permanent

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::eligibility::ChainReader;
use crate::payout::{TransferError, TransferRequest, TransferSender};
use crate::types::TokenAmount;

const ERR_INVALID_PARAMS: i64 = -32602;
const ERR_INVALID_DESTINATION: i64 = -32010;
const ERR_INSUFFICIENT_FUNDS: i64 = -32011;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, thiserror::Error)]
enum RpcFailure {
    #[error("ledger rpc unreachable: {0}")]
    Transport(String),
    #[error("ledger rpc returned HTTP {0}")]
    Status(u16),
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger rpc returned an empty result")]
    Empty,
}

impl From<RpcFailure> for TransferError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Rpc { code, message }
                if matches!(
                    code,
                    ERR_INVALID_PARAMS | ERR_INVALID_DESTINATION | ERR_INSUFFICIENT_FUNDS
                ) =>
            {
                TransferError::Permanent(message)
            }
            RpcFailure::Status(status) if (400..500).contains(&status) && status != 429 => {
                TransferError::Permanent(format!("ledger rejected the request (HTTP {})", status))
            }
            other => TransferError::Transient(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    amount: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct WalletAgeResult {
    days: u32,
}

#[derive(Debug, Deserialize)]
struct DailyBalancesResult {
    balances: Vec<Option<TokenAmount>>,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    signature: Option<String>,
}

pub struct LedgerClient {
    client: reqwest::Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl LedgerClient {
    pub fn new(config: &LedgerConfig) -> Self {
        // Build HTTP client with timeout, falling back to default client if builder fails
        let client = reqwest::Client::builder()
            .timeout(config.call_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        info!("Ledger RPC client initialized ({})", config.rpc_url);
        Self {
            client,
            rpc_url: config.rpc_url.clone(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<Option<T>, RpcFailure> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!("Ledger RPC {} (id {})", method, request.id);

        let response = self
            .client
            .post(&self.rpc_url)
            .header("User-Agent", "action-rewards/0.1.0")
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Status(status.as_u16()));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("malformed response: {}", e)))?;

        if let Some(error) = body.error {
            return Err(RpcFailure::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(body.result)
    }

    async fn call_required<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<T, RpcFailure> {
        self.call(method, params).await?.ok_or(RpcFailure::Empty)
    }
}

#[async_trait]
impl ChainReader for LedgerClient {
    async fn balance(&self, wallet: &str, mint: Option<&str>) -> Result<TokenAmount> {
        let result: BalanceResult = self
            .call_required("getBalance", json!({ "wallet": wallet, "mint": mint }))
            .await?;
        Ok(result.amount)
    }

    async fn wallet_age_days(&self, wallet: &str) -> Result<u32> {
        let result: WalletAgeResult = self
            .call_required("getWalletAge", json!({ "wallet": wallet }))
            .await?;
        Ok(result.days)
    }

    async fn daily_balances(
        &self,
        wallet: &str,
        mint: Option<&str>,
        days: u32,
    ) -> Result<Vec<Option<TokenAmount>>> {
        let result: DailyBalancesResult = self
            .call_required(
                "getDailyBalances",
                json!({ "wallet": wallet, "mint": mint, "days": days }),
            )
            .await?;
        Ok(result.balances)
    }
}

#[async_trait]
impl TransferSender for LedgerClient {
    async fn send_transfer(&self, request: &TransferRequest) -> std::result::Result<String, TransferError> {
        let result: TransferResult = self
            .call_required(
                "sendTransfer",
                json!({
                    "reference": request.reference,
                    "destination": request.destination,
                    "mint": request.mint,
                    "amount": request.amount,
                }),
            )
            .await?;
        result
            .signature
            .ok_or_else(|| TransferError::Transient("transfer returned no signature".to_string()))
    }

    async fn lookup_transfer(&self, reference: &str) -> std::result::Result<Option<String>, TransferError> {
        let result: Option<TransferResult> = self
            .call("getTransferByReference", json!({ "reference": reference }))
            .await?;
        Ok(result.and_then(|r| r.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_failure_classification() {
        let permanent = TransferError::from(RpcFailure::Rpc {
            code: ERR_INSUFFICIENT_FUNDS,
            message: "hot wallet empty".to_string(),
        });
        assert_eq!(permanent, TransferError::Permanent("hot wallet empty".to_string()));

        assert!(matches!(
            TransferError::from(RpcFailure::Rpc {
                code: -32005,
                message: "node is behind".to_string()
            }),
            TransferError::Transient(_)
        ));
        assert!(matches!(
            TransferError::from(RpcFailure::Status(503)),
            TransferError::Transient(_)
        ));
        assert!(matches!(
            TransferError::from(RpcFailure::Status(429)),
            TransferError::Transient(_)
        ));
        assert!(matches!(
            TransferError::from(RpcFailure::Status(400)),
            TransferError::Permanent(_)
        ));
        assert!(matches!(
            TransferError::from(RpcFailure::Transport("connection reset".to_string())),
            TransferError::Transient(_)
        ));
    }

    #[test]
    fn test_response_parsing() {
        let body: RpcResponse<BalanceResult> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"amount":"2.5"}}"#).unwrap();
        assert_eq!(
            body.result.unwrap().amount,
            "2.5".parse::<TokenAmount>().unwrap()
        );

        let body: RpcResponse<DailyBalancesResult> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"result":{"balances":["1",null,"3"]}}"#,
        )
        .unwrap();
        assert_eq!(body.result.unwrap().balances[1], None);
    }
}
