//! Payment Records
//!
//! A payment intent is created for an order and waits for an on-chain
//! transfer to the merchant address.
//!
//! ## Lifecycle
//!
//! ```text
//! PENDING ──match + proof──> VERIFIED ──refund──> REFUNDED
//!    │
//!    └──ttl elapsed──> (deleted)
//! ```
//!
//! `Failed` is carried for records written by external flows; nothing in
//! the oracle moves a record into it.

use serde::{Deserialize, Serialize};
use zk::ZkProof;

use crate::{OracleError, OracleResult};

/// Token symbol for native SOL transfers
pub const NATIVE_TOKEN: &str = "SOL";

/// Current state of a payment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Waiting for a matching transfer
    Pending,
    /// Matched to a transaction and proven
    Verified,
    /// Payment failed outside the oracle
    Failed,
    /// Refunded after verification
    Refunded,
}

impl PaymentStatus {
    /// Check whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Verified)
                | (PaymentStatus::Verified, PaymentStatus::Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Verified => "verified",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        };
        f.write_str(name)
    }
}

/// Payment intent and its settlement state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    /// Quoted amount in `currency`
    pub amount: f64,
    pub currency: String,
    /// "SOL" or an SPL mint address
    pub token: String,
    /// Expected amount in SOL
    pub sol_amount: f64,
    /// Expected amount in token units, for SPL payments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub merchant_address: String,
    pub status: PaymentStatus,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_signature: Option<String>,
    /// Full proof including its witness. Never leaves the merchant side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ZkProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<i64>,
}

impl PaymentRecord {
    /// Whether this payment is settled in native SOL
    pub fn is_native(&self) -> bool {
        self.token == NATIVE_TOKEN
    }

    /// Amount a matching transfer must carry, in the payment's token
    pub fn expected_amount(&self) -> f64 {
        if self.is_native() {
            self.sol_amount
        } else {
            self.token_amount.unwrap_or(self.sol_amount)
        }
    }

    /// Mint to match against, `None` for SOL
    pub fn mint(&self) -> Option<&str> {
        if self.is_native() {
            None
        } else {
            Some(&self.token)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    /// Pending and past its expiry
    pub fn is_expired(&self, now: i64) -> bool {
        self.is_pending() && now > self.expires_at
    }

    /// Move to a new status, rejecting illegal transitions
    pub fn transition(&mut self, next: PaymentStatus) -> OracleResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OracleError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Request to create a payment intent
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: f64,
    pub currency: String,
    /// Defaults to "SOL" when empty
    #[serde(default)]
    pub token: String,
    pub sol_amount: f64,
    #[serde(default)]
    pub token_amount: Option<f64>,
    #[serde(default)]
    pub order_id: Option<String>,
    pub merchant_address: String,
}

impl PaymentRequest {
    /// Native SOL request
    pub fn sol(merchant_address: impl Into<String>, sol_amount: f64) -> Self {
        Self {
            amount: sol_amount,
            currency: NATIVE_TOKEN.to_string(),
            token: NATIVE_TOKEN.to_string(),
            sol_amount,
            merchant_address: merchant_address.into(),
            ..Default::default()
        }
    }

    /// Attach an order id
    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Settle in an SPL token instead of SOL
    pub fn with_token(mut self, mint: impl Into<String>, token_amount: f64) -> Self {
        self.token = mint.into();
        self.token_amount = Some(token_amount);
        self
    }

    /// Check amounts and addresses before a record is created
    pub fn validate(&self) -> OracleResult<()> {
        validate_address(&self.merchant_address)?;
        if !self.sol_amount.is_finite() || self.sol_amount <= 0.0 {
            return Err(OracleError::InvalidInput(format!(
                "sol amount must be positive, got {}",
                self.sol_amount
            )));
        }
        if !self.token.is_empty() && self.token != NATIVE_TOKEN {
            validate_address(&self.token)?;
            match self.token_amount {
                Some(amount) if amount.is_finite() && amount > 0.0 => {}
                _ => {
                    return Err(OracleError::InvalidInput(
                        "token payments need a positive token amount".into(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Check that a string is a base58 32-byte account address
pub fn validate_address(address: &str) -> OracleResult<()> {
    decode_exact(address, 32, "address")
}

/// Check that a string is a base58 64-byte transaction signature
pub fn validate_signature(signature: &str) -> OracleResult<()> {
    decode_exact(signature, 64, "transaction signature")
}

fn decode_exact(value: &str, len: usize, what: &str) -> OracleResult<()> {
    let bytes = bs58::decode(value)
        .into_vec()
        .map_err(|e| OracleError::InvalidInput(format!("{} is not base58: {}", what, e)))?;
    if bytes.len() != len {
        return Err(OracleError::InvalidInput(format!(
            "{} must be {} bytes, got {}",
            what,
            len,
            bytes.len()
        )));
    }
    Ok(())
}
