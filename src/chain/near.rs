//! NEAR adapter over the JSON-RPC API
//!
//! Escrows on NEAR are sub-accounts of the escrow factory and expose their
//! parameters and state through the `get_escrow_info` view method.

use super::{ChainAdapter, ChainFamily, EscrowSnapshot, TxStatus};
use crate::config::NearChainConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::OrderHash;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Error causes that mean "the thing does not exist" rather than "the node
/// failed"
const MISSING_CAUSES: [&str; 4] = [
    "UNKNOWN_ACCOUNT",
    "UNKNOWN_TRANSACTION",
    "NO_CONTRACT_CODE",
    "CONTRACT_EXECUTION_ERROR",
];

/// Code hash of an account without a contract
const EMPTY_CODE_HASH: &str = "11111111111111111111111111111111";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'a str,
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    message: String,
    cause: Option<ErrorCause>,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorCause {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CallResult {
    result: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ViewAccount {
    amount: String,
    code_hash: String,
}

/// `EscrowInfo` as returned by the escrow contracts
#[derive(Debug, Deserialize)]
pub(crate) struct EscrowInfo {
    pub order_hash: String,
    pub maker: String,
    pub taker: String,
    pub token: String,
    pub amount: u128,
    pub safety_deposit: u128,
    pub state: EscrowInfoState,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EscrowInfoState {
    pub is_withdrawn: bool,
    pub is_cancelled: bool,
}

impl From<EscrowInfo> for EscrowSnapshot {
    fn from(info: EscrowInfo) -> Self {
        EscrowSnapshot {
            order_hash: info.order_hash.parse::<OrderHash>().ok(),
            // The view does not expose the hashlock; the factory binds it
            hashlock: None,
            maker: Some(info.maker),
            taker: Some(info.taker),
            token: Some(info.token),
            amount: Some(info.amount),
            safety_deposit: Some(info.safety_deposit),
            is_withdrawn: info.state.is_withdrawn,
            is_cancelled: info.state.is_cancelled,
            deployed_at: None,
        }
    }
}

fn parse_yocto(raw: &str) -> Option<u128> {
    raw.trim_matches('"').parse().ok()
}

pub struct NearAdapter {
    config: NearChainConfig,
    client: Client,
}

impl NearAdapter {
    pub fn new(config: NearChainConfig) -> CoordinatorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoordinatorError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn escrow_factory(&self) -> &str {
        &self.config.escrow_factory
    }

    fn unavailable(&self, message: impl std::fmt::Display) -> CoordinatorError {
        CoordinatorError::ChainUnavailable {
            chain: format!("near:{}", self.config.network_id),
            message: message.to_string(),
        }
    }

    /// Send one request; `Ok(None)` when the node says the target is missing
    async fn rpc(&self, method: &str, params: Value) -> CoordinatorResult<Option<Value>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "fusion-coordinator",
            method,
            params,
        };

        let response: JsonRpcResponse = self
            .client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(format!("{} request failed: {}", method, e)))?
            .json()
            .await
            .map_err(|e| self.unavailable(format!("{} response unreadable: {}", method, e)))?;

        if let Some(error) = response.error {
            let cause = error.cause.as_ref().map(|c| c.name.as_str()).unwrap_or("");
            if MISSING_CAUSES.contains(&cause) {
                debug!("NEAR {} reported {}", method, cause);
                return Ok(None);
            }
            return Err(self.unavailable(format!(
                "{} failed: {} {} {}",
                method,
                cause,
                error.message,
                error.data.map(|d| d.to_string()).unwrap_or_default()
            )));
        }

        let result = response
            .result
            .ok_or_else(|| self.unavailable(format!("{} returned no result", method)))?;

        // Older nodes report query failures inside the result
        if let Some(message) = result.get("error").and_then(|e| e.as_str()) {
            if message.contains("does not exist") || message.contains("MethodNotFound") {
                return Ok(None);
            }
            return Err(self.unavailable(format!("{} failed: {}", method, message)));
        }

        Ok(Some(result))
    }

    fn decode<T: DeserializeOwned>(&self, method: &str, value: Value) -> CoordinatorResult<T> {
        serde_json::from_value(value)
            .map_err(|e| self.unavailable(format!("{} result malformed: {}", method, e)))
    }

    /// Call a view method, returning the raw JSON bytes it produced
    async fn view_call(
        &self,
        account_id: &str,
        method_name: &str,
        args: Value,
    ) -> CoordinatorResult<Option<Vec<u8>>> {
        let params = json!({
            "request_type": "call_function",
            "finality": "final",
            "account_id": account_id,
            "method_name": method_name,
            "args_base64": STANDARD.encode(args.to_string()),
        });
        match self.rpc("query", params).await? {
            Some(value) => {
                let call: CallResult = self.decode("call_function", value)?;
                Ok(Some(call.result))
            }
            None => Ok(None),
        }
    }

    async fn view_account(&self, account_id: &str) -> CoordinatorResult<Option<ViewAccount>> {
        let params = json!({
            "request_type": "view_account",
            "finality": "final",
            "account_id": account_id,
        });
        match self.rpc("query", params).await? {
            Some(value) => self.decode("view_account", value).map(Some),
            None => Ok(None),
        }
    }

    async fn block_height(&self, block_id: Value) -> CoordinatorResult<Option<u64>> {
        Ok(self
            .rpc("block", block_id)
            .await?
            .and_then(|b| b.pointer("/header/height").and_then(|h| h.as_u64())))
    }
}

#[async_trait]
impl ChainAdapter for NearAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Near
    }

    fn chain_id(&self) -> String {
        self.config.network_id.clone()
    }

    async fn get_balance(&self, account: &str, token: &str) -> CoordinatorResult<u128> {
        if token == "near" || token == "native" {
            let view = match self.view_account(account).await? {
                Some(view) => view,
                None => return Ok(0),
            };
            return parse_yocto(&view.amount)
                .ok_or_else(|| self.unavailable(format!("bad balance {}", view.amount)));
        }

        let raw = match self
            .view_call(token, "ft_balance_of", json!({ "account_id": account }))
            .await?
        {
            Some(raw) => raw,
            None => return Ok(0),
        };
        let balance: String = serde_json::from_slice(&raw)
            .map_err(|e| self.unavailable(format!("ft_balance_of malformed: {}", e)))?;
        parse_yocto(&balance).ok_or_else(|| self.unavailable(format!("bad balance {}", balance)))
    }

    async fn code_exists(&self, address: &str) -> CoordinatorResult<bool> {
        Ok(self
            .view_account(address)
            .await?
            .map(|view| view.code_hash != EMPTY_CODE_HASH)
            .unwrap_or(false))
    }

    async fn get_block_number(&self) -> CoordinatorResult<u64> {
        self.block_height(json!({ "finality": "final" }))
            .await?
            .ok_or_else(|| self.unavailable("no final block"))
    }

    async fn get_transaction(
        &self,
        tx_hash: &str,
        sender: &str,
    ) -> CoordinatorResult<Option<TxStatus>> {
        let outcome = match self.rpc("tx", json!([tx_hash, sender])).await? {
            Some(outcome) => outcome,
            None => return Ok(None),
        };

        let success = outcome
            .pointer("/status/SuccessValue")
            .is_some();
        let block_hash = match outcome
            .pointer("/transaction_outcome/block_hash")
            .and_then(|h| h.as_str())
        {
            Some(hash) => hash.to_string(),
            None => return Ok(None),
        };

        Ok(self
            .block_height(json!({ "block_id": block_hash }))
            .await?
            .map(|block_number| TxStatus {
                block_number,
                success,
            }))
    }

    async fn get_escrow_state(
        &self,
        address: &str,
        _deploy_tx: &str,
    ) -> CoordinatorResult<Option<EscrowSnapshot>> {
        let raw = match self.view_call(address, "get_escrow_info", json!({})).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let info: EscrowInfo = serde_json::from_slice(&raw)
            .map_err(|e| self.unavailable(format!("get_escrow_info malformed: {}", e)))?;
        Ok(Some(info.into()))
    }

    async fn get_base_fee(&self) -> CoordinatorResult<Option<u128>> {
        Ok(self
            .rpc("gas_price", json!([null]))
            .await?
            .and_then(|r| r.get("gas_price").and_then(|p| p.as_str()).and_then(parse_yocto)))
    }
}
