//! Payment events and notifiers
//!
//! Every state change emits a [`PaymentEvent`]. Delivery is fire and
//! forget: a notifier never blocks or fails the operation that emitted it.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zk::PublicProof;

use crate::payment::PaymentRecord;
use crate::{OracleError, OracleResult};

/// Events emitted by the reconciliation engine
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum PaymentEvent {
    /// New intent registered
    Created { record: PaymentRecord },
    /// Intent matched and proven. Carries no transaction signature, so a
    /// receiver cannot link the proof to its transaction.
    #[serde(rename_all = "camelCase")]
    Verified {
        payment_id: String,
        order_id: Option<String>,
        amount: f64,
        /// Witness-free view of the proof
        proof: PublicProof,
    },
    /// Pending intent passed its expiry and was removed
    #[serde(rename_all = "camelCase")]
    Expired { payment_id: String, order_id: Option<String> },
    /// Verified payment refunded
    #[serde(rename_all = "camelCase")]
    Refunded { payment_id: String, refunded_at: i64 },
    /// Record removed by request or as a duplicate
    #[serde(rename_all = "camelCase")]
    Deleted { payment_id: String, reason: String },
}

impl PaymentEvent {
    /// Dotted event name used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            PaymentEvent::Created { .. } => "payment.created",
            PaymentEvent::Verified { .. } => "payment.verified",
            PaymentEvent::Expired { .. } => "payment.expired",
            PaymentEvent::Refunded { .. } => "payment.refunded",
            PaymentEvent::Deleted { .. } => "payment.deleted",
        }
    }

    pub fn payment_id(&self) -> &str {
        match self {
            PaymentEvent::Created { record } => &record.id,
            PaymentEvent::Verified { payment_id, .. }
            | PaymentEvent::Expired { payment_id, .. }
            | PaymentEvent::Refunded { payment_id, .. }
            | PaymentEvent::Deleted { payment_id, .. } => payment_id,
        }
    }

    /// `{ "event": name, "payload": {...} }`
    pub fn to_envelope(&self) -> Value {
        json!({
            "event": self.name(),
            "payload": self,
        })
    }
}

/// Sink for payment events
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: PaymentEvent);
}

/// Drops every event
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, event: PaymentEvent) {
        debug!("Dropping event {} for {}", event.name(), event.payment_id());
    }
}

/// Forwards events into an in-process channel
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<PaymentEvent>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver that drains it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PaymentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: PaymentEvent) {
        // Receiver may be gone
        let _ = self.tx.send(event);
    }
}

/// Posts events as JSON to a webhook URL
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> OracleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::InvalidInput(format!("webhook client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: PaymentEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = event.to_envelope();
        let name = event.name();

        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Delivered {} to {}", name, url);
                }
                Ok(response) => {
                    warn!("Webhook {} answered {} for {}", url, response.status(), name);
                }
                Err(e) => {
                    warn!("Webhook delivery of {} failed: {}", name, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let expired = PaymentEvent::Expired {
            payment_id: "pay_1".into(),
            order_id: Some("order-9".into()),
        };
        assert_eq!(expired.name(), "payment.expired");
        assert_eq!(expired.payment_id(), "pay_1");

        let deleted = PaymentEvent::Deleted {
            payment_id: "pay_2".into(),
            reason: "duplicate".into(),
        };
        assert_eq!(deleted.name(), "payment.deleted");
    }

    #[test]
    fn test_envelope_shape() {
        let event = PaymentEvent::Refunded {
            payment_id: "pay_1".into(),
            refunded_at: 42,
        };
        let envelope = event.to_envelope();

        assert_eq!(envelope["event"], "payment.refunded");
        assert_eq!(envelope["payload"]["paymentId"], "pay_1");
        assert_eq!(envelope["payload"]["refundedAt"], 42);
    }

    #[tokio::test]
    async fn test_channel_notifier() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier
            .notify(PaymentEvent::Expired {
                payment_id: "pay_1".into(),
                order_id: None,
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payment_id(), "pay_1");

        // Sending after the receiver is dropped is silent
        drop(rx);
        notifier
            .notify(PaymentEvent::Expired {
                payment_id: "pay_2".into(),
                order_id: None,
            })
            .await;
    }
}
