//! End-to-end reconciliation against in-memory collaborators

use async_trait::async_trait;
use oracle::{
    ChannelNotifier, MemorySource, MemoryStore, NoopNotifier, ObservedTransaction, OracleConfig,
    OracleError, OracleResult, PaymentEvent, PaymentRecord, PaymentRequest, PaymentStatus,
    PaymentStore, ReconciliationEngine, NATIVE_TOKEN,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use zk::{ProofConfig, ProofService};

struct Harness {
    engine: Arc<ReconciliationEngine>,
    source: Arc<MemorySource>,
    store: Arc<MemoryStore>,
    events: UnboundedReceiver<PaymentEvent>,
}

fn test_config() -> OracleConfig {
    OracleConfig::default().with_retry(Duration::from_millis(200), 3, Duration::from_millis(5))
}

fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryStore::new()))
}

fn harness_with(config: OracleConfig, store: Arc<MemoryStore>) -> Harness {
    let proofs = Arc::new(ProofService::ephemeral(ProofConfig::default()).unwrap());
    let source = Arc::new(MemorySource::new());
    let (notifier, events) = ChannelNotifier::new();

    let engine = Arc::new(
        ReconciliationEngine::new(config, proofs, source.clone(), store.clone(), Arc::new(notifier))
            .unwrap(),
    );

    Harness {
        engine,
        source,
        store,
        events,
    }
}

fn merchant() -> String {
    bs58::encode([7u8; 32]).into_string()
}

fn signature(n: u8) -> String {
    bs58::encode([n; 64]).into_string()
}

/// Names of every event emitted so far
fn drain(events: &mut UnboundedReceiver<PaymentEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    names
}

/// SOL transfer to the merchant a minute after the intent was created
fn transfer_for(record: &PaymentRecord, sig: &str, amount: f64) -> ObservedTransaction {
    ObservedTransaction::sol_transfer(sig, &merchant(), amount, record.created_at / 1000 + 60)
}

#[tokio::test]
async fn test_two_percent_overpayment_matches() {
    let mut h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0).with_order("order-1"))
        .await
        .unwrap();

    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.02))
        .await;

    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 1);
    assert_eq!(report.scanned, 1);
    assert_eq!(report.errors, 0);

    let settled = h.engine.get(&record.id).await.unwrap();
    assert_eq!(settled.status, PaymentStatus::Verified);
    assert_eq!(settled.transaction_signature, Some(signature(1)));
    assert!(settled.confirmed_at.is_some());

    let proof = settled.proof.clone().unwrap();
    assert!(proof.verified);
    assert_eq!(proof.expected_amount, 1.0);
    assert!(h.engine.proofs().verify_proof(&proof).await.unwrap());

    // Written through to the store
    let stored = h.store.get(&record.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Verified);

    assert_eq!(drain(&mut h.events), vec!["payment.created", "payment.verified"]);
}

#[tokio::test]
async fn test_ten_percent_overpayment_rejected() {
    let mut h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.10))
        .await;

    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 0);
    assert_eq!(report.pending, 1);

    let current = h.engine.get(&record.id).await.unwrap();
    assert_eq!(current.status, PaymentStatus::Pending);
    assert!(current.proof.is_none());
    assert!(h.engine.claimed_signatures().await.is_empty());
    assert_eq!(drain(&mut h.events), vec!["payment.created"]);
}

#[tokio::test]
async fn test_transfer_before_intent_not_matched() {
    let h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    // Ten minutes before the intent, outside the clock-skew allowance
    let early = ObservedTransaction::sol_transfer(
        signature(1),
        &merchant(),
        1.0,
        record.created_at / 1000 - 600,
    );
    h.source.push(&merchant(), early).await;

    assert_eq!(h.engine.reconcile_once().await.verified, 0);
}

#[tokio::test]
async fn test_expired_pending_is_removed() {
    let mut h = harness();
    let stale = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    let paid = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 2.0))
        .await
        .unwrap();
    h.source
        .push(&merchant(), transfer_for(&paid, &signature(2), 2.0))
        .await;
    h.engine.reconcile_once().await;

    // Not yet past expiry
    assert_eq!(h.engine.cleanup_expired(stale.expires_at).await, 0);

    let removed = h.engine.cleanup_expired(stale.expires_at + 1).await;
    assert_eq!(removed, 1);
    assert!(h.engine.get(&stale.id).await.is_none());
    assert!(h.store.get(&stale.id).await.is_none());

    // Verified payments never expire
    let kept = h.engine.get(&paid.id).await.unwrap();
    assert_eq!(kept.status, PaymentStatus::Verified);

    let names = drain(&mut h.events);
    assert_eq!(names.last(), Some(&"payment.expired"));
}

#[tokio::test]
async fn test_signature_settles_only_one_payment() {
    let h = harness();
    let first = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    let second = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    h.source
        .push(&merchant(), transfer_for(&first, &signature(1), 1.0))
        .await;

    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 1);

    let records = h.engine.records().await;
    let verified: Vec<_> = records
        .iter()
        .filter(|r| r.status == PaymentStatus::Verified)
        .collect();
    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].transaction_signature, Some(signature(1)));

    // The same transaction seen again does not settle the other intent
    assert_eq!(h.engine.reconcile_once().await.verified, 0);

    // A second transfer does
    h.source
        .push(&merchant(), transfer_for(&second, &signature(2), 0.99))
        .await;
    assert_eq!(h.engine.reconcile_once().await.verified, 1);

    let claims = h.engine.claimed_signatures().await;
    assert_eq!(claims.len(), 2);
    assert_ne!(claims[&signature(1)], claims[&signature(2)]);
}

#[tokio::test]
async fn test_refund_transitions() {
    let mut h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    // Pending cannot be refunded
    assert!(matches!(
        h.engine.refund(&record.id).await,
        Err(OracleError::InvalidTransition {
            from: PaymentStatus::Pending,
            to: PaymentStatus::Refunded
        })
    ));

    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;
    h.engine.reconcile_once().await;

    let refunded = h.engine.refund(&record.id).await.unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert!(refunded.refunded_at.is_some());
    assert_eq!(
        h.store.get(&record.id).await.unwrap().status,
        PaymentStatus::Refunded
    );

    // Terminal
    assert!(matches!(
        h.engine.refund(&record.id).await,
        Err(OracleError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.engine.refund("pay_missing").await,
        Err(OracleError::NotFound(_))
    ));

    assert_eq!(drain(&mut h.events).last(), Some(&"payment.refunded"));
}

#[tokio::test]
async fn test_manual_verification() {
    let h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 0.5))
        .await
        .unwrap();
    let other = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 0.5))
        .await
        .unwrap();

    h.source
        .push(&merchant(), transfer_for(&record, &signature(3), 0.5))
        .await;

    let verified = h
        .engine
        .verify_payment(&record.id, &signature(3))
        .await
        .unwrap();
    assert_eq!(verified.status, PaymentStatus::Verified);
    assert_eq!(verified.transaction_signature, Some(signature(3)));

    // Idempotent for the same signature
    let again = h
        .engine
        .verify_payment(&record.id, &signature(3))
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Verified);

    // The signature cannot be reused by another payment
    assert!(matches!(
        h.engine.verify_payment(&other.id, &signature(3)).await,
        Err(OracleError::InvalidInput(_))
    ));

    assert!(matches!(
        h.engine.verify_payment(&other.id, "not-a-signature").await,
        Err(OracleError::InvalidInput(_))
    ));
    assert!(matches!(
        h.engine.verify_payment("pay_missing", &signature(4)).await,
        Err(OracleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_bound_signature_rechecked_on_later_pass() {
    let h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    // Transaction not visible yet: the binding is kept
    let bound = h
        .engine
        .verify_payment(&record.id, &signature(5))
        .await
        .unwrap();
    assert_eq!(bound.status, PaymentStatus::Pending);
    assert_eq!(bound.transaction_signature, Some(signature(5)));

    // A different signature cannot replace it
    assert!(matches!(
        h.engine.verify_payment(&record.id, &signature(6)).await,
        Err(OracleError::InvalidInput(_))
    ));
    assert!(!h.engine.claimed_signatures().await.contains_key(&signature(6)));

    h.source
        .push(&merchant(), transfer_for(&record, &signature(5), 1.0))
        .await;

    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 1);
    assert_eq!(
        h.engine.get(&record.id).await.unwrap().status,
        PaymentStatus::Verified
    );
}

#[tokio::test]
async fn test_spl_token_payment() {
    let h = harness();
    let mint = bs58::encode([11u8; 32]).into_string();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 0.1).with_token(mint.clone(), 20.0))
        .await
        .unwrap();

    // SOL of the right size is ignored for a token payment
    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 20.0))
        .await;
    assert_eq!(h.engine.reconcile_once().await.verified, 0);

    h.source
        .push(
            &merchant(),
            ObservedTransaction::token_transfer(
                signature(2),
                &merchant(),
                &mint,
                20.4,
                record.created_at / 1000 + 30,
            ),
        )
        .await;
    assert_eq!(h.engine.reconcile_once().await.verified, 1);

    let settled = h.engine.get(&record.id).await.unwrap();
    assert_eq!(settled.transaction_signature, Some(signature(2)));
    assert_eq!(settled.proof.unwrap().expected_amount, 20.0);
}

#[tokio::test]
async fn test_transient_source_failures_are_retried() {
    let h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;

    h.source.fail_next(2);
    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 1);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn test_source_outage_does_not_abort_pass() {
    let h = harness();
    h.engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    h.source.fail_next(100);
    let report = h.engine.reconcile_once().await;
    assert_eq!(report.verified, 0);
    assert_eq!(report.pending, 1);
    assert!(report.errors >= 1);
}

#[tokio::test]
async fn test_persistence_failure_keeps_memory() {
    let store = Arc::new(MemoryStore::new());
    store.set_failing(true);
    let h = harness_with(test_config(), store);

    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    assert!(h.engine.get(&record.id).await.is_some());

    h.store.set_failing(false);
    assert!(h.store.is_empty().await);
}

fn stored(id: &str, status: PaymentStatus, created_at: i64) -> PaymentRecord {
    PaymentRecord {
        id: id.into(),
        amount: 1.0,
        currency: "SOL".into(),
        token: NATIVE_TOKEN.into(),
        sol_amount: 1.0,
        token_amount: None,
        order_id: None,
        merchant_address: merchant(),
        status,
        created_at,
        expires_at: created_at + 3_600_000,
        transaction_signature: None,
        proof: None,
        confirmed_at: None,
        refunded_at: None,
    }
}

#[tokio::test]
async fn test_load_drops_duplicates() {
    let store = Arc::new(MemoryStore::new());

    // Same signature: the verified record wins over an earlier pending one
    let mut verified = stored("pay_verified", PaymentStatus::Verified, 2_000);
    verified.transaction_signature = Some(signature(1));
    let mut shadow = stored("pay_shadow", PaymentStatus::Pending, 1_000);
    shadow.transaction_signature = Some(signature(1));

    // Same pending order: the earliest wins
    let mut early = stored("pay_early", PaymentStatus::Pending, 3_000);
    early.order_id = Some("order-7".into());
    let mut late = stored("pay_late", PaymentStatus::Pending, 4_000);
    late.order_id = Some("order-7".into());

    for record in [&verified, &shadow, &early, &late] {
        store.save(record).await.unwrap();
    }

    let mut h = harness_with(test_config(), store);
    assert_eq!(h.engine.load().await.unwrap(), 2);

    let ids: Vec<String> = h.engine.records().await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["pay_verified", "pay_early"]);
    assert_eq!(h.store.len().await, 2);

    let claims = h.engine.claimed_signatures().await;
    assert_eq!(claims.get(&signature(1)).map(String::as_str), Some("pay_verified"));

    assert_eq!(
        drain(&mut h.events),
        vec!["payment.deleted", "payment.deleted"]
    );
}

#[tokio::test]
async fn test_delete() {
    let mut h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();

    h.engine.delete(&record.id).await.unwrap();
    assert!(h.engine.get(&record.id).await.is_none());
    assert!(h.store.get(&record.id).await.is_none());
    assert!(matches!(
        h.engine.delete(&record.id).await,
        Err(OracleError::NotFound(_))
    ));

    assert_eq!(
        drain(&mut h.events),
        vec!["payment.created", "payment.deleted"]
    );
}

#[tokio::test]
async fn test_poller_settles_and_stops() {
    let mut h = harness_with(
        test_config().with_poll_interval(Duration::from_secs(1)),
        Arc::new(MemoryStore::new()),
    );
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;
    assert_eq!(h.events.recv().await.unwrap().name(), "payment.created");

    let poller = h.engine.clone().start();
    assert!(poller.is_running());

    // First tick fires immediately
    let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name(), "payment.verified");
    assert_eq!(event.payment_id(), record.id);

    tokio::time::timeout(Duration::from_secs(5), poller.stop())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_verified_event_carries_public_proof() {
    let mut h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;
    h.engine.reconcile_once().await;

    let mut verified = None;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, PaymentEvent::Verified { .. }) {
            verified = Some(event);
        }
    }
    let event = verified.unwrap();

    // Nothing in the delivered payload links the proof to its transaction
    let envelope = event.to_envelope().to_string();
    assert!(!envelope.contains("_witness"));
    assert!(!envelope.contains(&signature(1)));

    let PaymentEvent::Verified { proof, .. } = event else {
        unreachable!()
    };
    assert_eq!(proof.amount, None);
}

/// Store whose saves of verified records stall, like a slow disk
struct SlowVerifiedStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl PaymentStore for SlowVerifiedStore {
    async fn save(&self, record: &PaymentRecord) -> OracleResult<()> {
        if record.status == PaymentStatus::Verified {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.save(record).await
    }

    async fn load_all(&self) -> OracleResult<Vec<PaymentRecord>> {
        self.inner.load_all().await
    }

    async fn delete(&self, id: &str) -> OracleResult<()> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn test_refund_during_slow_verified_write_is_not_lost() {
    let store = Arc::new(SlowVerifiedStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(300),
    });
    let source = Arc::new(MemorySource::new());
    let proofs = Arc::new(ProofService::ephemeral(ProofConfig::default()).unwrap());
    let engine = Arc::new(
        ReconciliationEngine::new(
            test_config(),
            proofs,
            source.clone(),
            store.clone(),
            Arc::new(NoopNotifier),
        )
        .unwrap(),
    );

    let record = engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;

    let pass = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reconcile_once().await }
    });

    // Refund as soon as memory shows the payment verified, while the
    // verified write is still in flight
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.get(&record.id).await.unwrap().status != PaymentStatus::Verified {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let refunded = engine.refund(&record.id).await.unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(pass.await.unwrap().verified, 1);

    let persisted = store.inner.get(&record.id).await.unwrap();
    assert_eq!(persisted.status, PaymentStatus::Refunded);
    assert_eq!(persisted.refunded_at, refunded.refunded_at);
}

#[tokio::test]
async fn test_delete_during_slow_verified_write_stays_deleted() {
    let store = Arc::new(SlowVerifiedStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(300),
    });
    let source = Arc::new(MemorySource::new());
    let proofs = Arc::new(ProofService::ephemeral(ProofConfig::default()).unwrap());
    let engine = Arc::new(
        ReconciliationEngine::new(
            test_config(),
            proofs,
            source.clone(),
            store.clone(),
            Arc::new(NoopNotifier),
        )
        .unwrap(),
    );

    let record = engine
        .create_payment(PaymentRequest::sol(merchant(), 1.0))
        .await
        .unwrap();
    source
        .push(&merchant(), transfer_for(&record, &signature(1), 1.0))
        .await;

    let pass = tokio::spawn({
        let engine = engine.clone();
        async move { engine.reconcile_once().await }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.get(&record.id).await.unwrap().status != PaymentStatus::Verified {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    engine.delete(&record.id).await.unwrap();
    pass.await.unwrap();

    assert!(engine.get(&record.id).await.is_none());
    assert!(store.inner.get(&record.id).await.is_none());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let config: OracleConfig = serde_json::from_str(r#"{"poll_interval_secs": 0}"#).unwrap();
    let proofs = Arc::new(ProofService::ephemeral(ProofConfig::default()).unwrap());

    let result = ReconciliationEngine::new(
        config,
        proofs,
        Arc::new(MemorySource::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(NoopNotifier),
    );
    assert!(matches!(result, Err(OracleError::InvalidInput(_))));
}

#[tokio::test]
async fn test_unprovable_tiny_payment_issues_no_proofs() {
    let h = harness();
    let record = h
        .engine
        .create_payment(PaymentRequest::sol(merchant(), 0.000_001))
        .await
        .unwrap();

    // Inside the absolute matching floor, outside the ±5% range proof
    h.source
        .push(&merchant(), transfer_for(&record, &signature(1), 0.000_0015))
        .await;

    for _ in 0..3 {
        let report = h.engine.reconcile_once().await;
        assert_eq!(report.verified, 0);
        assert_eq!(report.errors, 0);
    }

    assert!(h.engine.get(&record.id).await.unwrap().is_pending());
    assert_eq!(h.engine.proofs().proof_count().await, 0);
    assert!(h.engine.claimed_signatures().await.is_empty());
}
