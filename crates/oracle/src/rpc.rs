//! Solana JSON-RPC transaction source
//!
//! Uses two methods:
//!
//! - `getSignaturesForAddress` for the newest signatures touching a merchant
//! - `getTransaction` (jsonParsed, v0 transactions allowed) for balances
//!
//! SOL deltas come from `pre/postBalances` in lamports. SPL deltas come
//! from `pre/postTokenBalances`, grouped by owner and mint. A non-null
//! `meta.err` marks the transaction as not confirmed.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::payment::{validate_address, validate_signature};
use crate::source::{BalanceChange, ObservedTransaction, TransactionSource};
use crate::{OracleError, OracleResult};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Public mainnet endpoint
pub const MAINNET_URL: &str = "https://api.mainnet-beta.solana.com";
/// Public devnet endpoint
pub const DEVNET_URL: &str = "https://api.devnet.solana.com";

/// Transaction source backed by a Solana RPC node
pub struct SolanaRpcSource {
    rpc_url: String,
    commitment: String,
    client: reqwest::Client,
}

impl SolanaRpcSource {
    /// Create a client with a per-request timeout
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> OracleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::TransactionSource(format!("http client: {}", e)))?;

        Ok(Self {
            rpc_url: rpc_url.into(),
            commitment: "confirmed".to_string(),
            client,
        })
    }

    /// Use a different commitment level ("confirmed" by default)
    pub fn with_commitment(mut self, commitment: impl Into<String>) -> Self {
        self.commitment = commitment.into();
        self
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn rpc_call(&self, method: &str, params: Value) -> OracleResult<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::TransactionSource(format!("{}: {}", method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::TransactionSource(format!(
                "{}: HTTP {}",
                method, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OracleError::TransactionSource(format!("{}: {}", method, e)))?;

        extract_result(method, body)
    }
}

#[async_trait]
impl TransactionSource for SolanaRpcSource {
    async fn recent_signatures(&self, address: &str, limit: usize) -> OracleResult<Vec<String>> {
        validate_address(address)?;

        let result = self
            .rpc_call(
                "getSignaturesForAddress",
                json!([address, { "limit": limit, "commitment": self.commitment }]),
            )
            .await?;

        let entries: Vec<SignatureInfo> = decode("getSignaturesForAddress", result)?;
        debug!("Fetched {} signatures for {}", entries.len(), address);
        Ok(entries.into_iter().map(|entry| entry.signature).collect())
    }

    async fn transaction(&self, signature: &str) -> OracleResult<Option<ObservedTransaction>> {
        validate_signature(signature)?;

        let result = self
            .rpc_call(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "jsonParsed",
                        "maxSupportedTransactionVersion": 0,
                        "commitment": self.commitment,
                    }
                ]),
            )
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let tx: RpcTransaction = decode("getTransaction", result)?;
        Ok(Some(tx.into_observed(signature)))
    }
}

fn extract_result(method: &str, mut body: Value) -> OracleResult<Value> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(OracleError::TransactionSource(format!(
            "{}: {}",
            method, error
        )));
    }

    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(OracleError::TransactionSource(format!(
            "{}: missing result in response",
            method
        ))),
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> OracleResult<T> {
    serde_json::from_value(value)
        .map_err(|e| OracleError::TransactionSource(format!("{}: unexpected shape: {}", method, e)))
}

#[derive(Deserialize)]
struct SignatureInfo {
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    block_time: Option<i64>,
    meta: Option<RpcMeta>,
    transaction: RpcTransactionBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<RpcTokenBalance>,
    #[serde(default)]
    post_token_balances: Vec<RpcTokenBalance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTokenBalance {
    account_index: usize,
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    ui_token_amount: RpcTokenAmount,
}

#[derive(Deserialize)]
struct RpcTokenAmount {
    amount: String,
    decimals: u32,
}

impl RpcTokenAmount {
    fn value(&self) -> f64 {
        let raw: f64 = self.amount.parse().unwrap_or(0.0);
        raw / 10f64.powi(self.decimals as i32)
    }
}

#[derive(Deserialize)]
struct RpcTransactionBody {
    message: RpcMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<AccountKey>,
}

/// jsonParsed returns objects, other encodings return bare strings
#[derive(Deserialize)]
#[serde(untagged)]
enum AccountKey {
    Parsed { pubkey: String },
    Raw(String),
}

impl AccountKey {
    fn pubkey(&self) -> &str {
        match self {
            AccountKey::Parsed { pubkey } => pubkey,
            AccountKey::Raw(pubkey) => pubkey,
        }
    }
}

impl RpcTransaction {
    fn into_observed(self, signature: &str) -> ObservedTransaction {
        let keys: Vec<&str> = self
            .transaction
            .message
            .account_keys
            .iter()
            .map(AccountKey::pubkey)
            .collect();

        let (confirmed, balance_changes) = match &self.meta {
            Some(meta) => (meta.err.is_none(), balance_changes(meta, &keys)),
            None => (false, Vec::new()),
        };

        ObservedTransaction {
            signature: signature.to_string(),
            confirmed,
            block_time: self.block_time,
            balance_changes,
        }
    }
}

fn balance_changes(meta: &RpcMeta, keys: &[&str]) -> Vec<BalanceChange> {
    let mut changes = Vec::new();

    for (index, key) in keys.iter().enumerate() {
        let (Some(pre), Some(post)) = (meta.pre_balances.get(index), meta.post_balances.get(index))
        else {
            continue;
        };
        let lamports = *post as i128 - *pre as i128;
        if lamports != 0 {
            changes.push(BalanceChange {
                account: key.to_string(),
                mint: None,
                delta: lamports as f64 / LAMPORTS_PER_SOL,
            });
        }
    }

    // Token balances are reported per token account; fold them by owner
    let mut tokens: BTreeMap<(String, String), f64> = BTreeMap::new();
    let owner_of = |balance: &RpcTokenBalance| -> String {
        balance
            .owner
            .clone()
            .or_else(|| keys.get(balance.account_index).map(|k| k.to_string()))
            .unwrap_or_default()
    };
    for balance in &meta.pre_token_balances {
        *tokens
            .entry((owner_of(balance), balance.mint.clone()))
            .or_default() -= balance.ui_token_amount.value();
    }
    for balance in &meta.post_token_balances {
        *tokens
            .entry((owner_of(balance), balance.mint.clone()))
            .or_default() += balance.ui_token_amount.value();
    }

    changes.extend(
        tokens
            .into_iter()
            .filter(|(_, delta)| *delta != 0.0)
            .map(|((account, mint), delta)| BalanceChange {
                account,
                mint: Some(mint),
                delta,
            }),
    );

    changes
}
