//! Payment Oracle
//!
//! Reconciles merchant payment intents against transactions observed on
//! Solana and attaches a [`zk::ZkProof`] to every settled payment.
//!
//! ## Flow
//!
//! ```text
//! create_payment ──> PENDING
//!                      │  poll every 30s: last 100 signatures per merchant
//!                      │  fuzzy match (±5%, time window, unclaimed signature)
//!                      ▼
//!                  generate proof ──> VERIFIED ──refund──> REFUNDED
//! ```
//!
//! All collaborators are injected into [`ReconciliationEngine`]:
//!
//! - [`TransactionSource`]: chain access ([`SolanaRpcSource`], [`MemorySource`])
//! - [`PaymentStore`]: persistence ([`JsonFileStore`], [`MemoryStore`])
//! - [`Notifier`]: event delivery ([`WebhookNotifier`], [`ChannelNotifier`], [`NoopNotifier`])
//!
//! A transaction signature settles at most one payment. Claims are taken
//! before proof generation and released if settlement does not complete.

pub mod config;
pub mod engine;
pub mod events;
pub mod matching;
pub mod payment;
pub mod retry;
pub mod rpc;
pub mod source;
pub mod store;

pub use config::OracleConfig;
pub use engine::{PollerHandle, ReconcileReport, ReconciliationEngine};
pub use events::{ChannelNotifier, NoopNotifier, Notifier, PaymentEvent, WebhookNotifier};
pub use payment::{
    validate_address, validate_signature, PaymentRecord, PaymentRequest, PaymentStatus,
    NATIVE_TOKEN,
};
pub use rpc::SolanaRpcSource;
pub use source::{BalanceChange, MemorySource, ObservedTransaction, TransactionSource};
pub use store::{JsonFileStore, MemoryStore, PaymentStore};

use std::time::Duration;

/// Oracle error types
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("Transaction source error: {0}")]
    TransactionSource(String),

    #[error("Transaction source timed out after {0:?}")]
    Timeout(Duration),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Proof error: {0}")]
    Proof(#[from] zk::ZkError),
}

impl OracleError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::TransactionSource(_) | OracleError::Timeout(_)
        )
    }
}

pub type OracleResult<T> = Result<T, OracleError>;
