//! Transaction sources
//!
//! The engine sees the chain only through [`TransactionSource`]: recent
//! signatures touching an address, and the balance changes of a single
//! transaction. [`crate::rpc::SolanaRpcSource`] talks to a JSON-RPC node;
//! [`MemorySource`] serves transfers pushed in-process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::{OracleError, OracleResult};

/// Net balance change of one account in one token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChange {
    /// Owner address
    pub account: String,
    /// SPL mint, `None` for native SOL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint: Option<String>,
    /// Change in whole token units (SOL, not lamports)
    pub delta: f64,
}

/// A transaction as seen by the oracle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedTransaction {
    pub signature: String,
    /// Landed without an execution error
    pub confirmed: bool,
    /// Unix seconds
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub balance_changes: Vec<BalanceChange>,
}

impl ObservedTransaction {
    /// Confirmed transaction moving `amount` SOL into `to`
    pub fn sol_transfer(signature: impl Into<String>, to: &str, amount: f64, block_time: i64) -> Self {
        Self {
            signature: signature.into(),
            confirmed: true,
            block_time: Some(block_time),
            balance_changes: vec![BalanceChange {
                account: to.to_string(),
                mint: None,
                delta: amount,
            }],
        }
    }

    /// Confirmed transaction moving `amount` of `mint` into `to`
    pub fn token_transfer(
        signature: impl Into<String>,
        to: &str,
        mint: &str,
        amount: f64,
        block_time: i64,
    ) -> Self {
        Self {
            signature: signature.into(),
            confirmed: true,
            block_time: Some(block_time),
            balance_changes: vec![BalanceChange {
                account: to.to_string(),
                mint: Some(mint.to_string()),
                delta: amount,
            }],
        }
    }

    /// Block time in milliseconds
    pub fn block_time_ms(&self) -> Option<i64> {
        self.block_time.map(|secs| secs * 1000)
    }

    /// Amount received by `account` in the given token.
    ///
    /// Sums positive deltas only, so outgoing fees never reduce the total.
    pub fn received_by(&self, account: &str, mint: Option<&str>) -> f64 {
        self.balance_changes
            .iter()
            .filter(|change| change.account == account && change.mint.as_deref() == mint)
            .map(|change| change.delta)
            .filter(|delta| *delta > 0.0)
            .sum()
    }
}

/// Read access to on-chain transactions
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Most recent signatures involving `address`, newest first
    async fn recent_signatures(&self, address: &str, limit: usize) -> OracleResult<Vec<String>>;

    /// Fetch one transaction. `Ok(None)` when it is not visible yet.
    async fn transaction(&self, signature: &str) -> OracleResult<Option<ObservedTransaction>>;
}

/// In-process transaction source
#[derive(Default)]
pub struct MemorySource {
    /// (address, transaction), oldest first
    transactions: RwLock<Vec<(String, ObservedTransaction)>>,
    /// Upcoming calls that fail with a transient error
    failures: AtomicU32,
    calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction touching `address`
    pub async fn push(&self, address: &str, tx: ObservedTransaction) {
        self.transactions
            .write()
            .await
            .push((address.to_string(), tx));
    }

    /// Make the next `count` calls fail
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total calls served, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> OracleResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if injected.is_ok() {
            return Err(OracleError::TransactionSource("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for MemorySource {
    async fn recent_signatures(&self, address: &str, limit: usize) -> OracleResult<Vec<String>> {
        self.begin_call()?;
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .rev()
            .filter(|(owner, _)| owner == address)
            .take(limit)
            .map(|(_, tx)| tx.signature.clone())
            .collect())
    }

    async fn transaction(&self, signature: &str) -> OracleResult<Option<ObservedTransaction>> {
        self.begin_call()?;
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .find(|(_, tx)| tx.signature == signature)
            .map(|(_, tx)| tx.clone()))
    }
}
