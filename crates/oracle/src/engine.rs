//! Reconciliation Engine
//!
//! Owns the in-memory payment records and the set of claimed transaction
//! signatures. Each pass:
//!
//! 1. removes pending intents past their expiry
//! 2. re-checks intents that already carry a bound signature
//! 3. fetches recent signatures for every merchant with pending intents
//! 4. matches unbound intents against the fetched transactions
//!
//! Settlement is compare-and-set: a signature is claimed for one payment,
//! the proof is generated, and the record is updated only if it is still
//! pending. Any failure releases the claim.
//!
//! Writes to one record are serialized by a per-record lock held from the
//! in-memory change until the store has the new state, so the store never
//! ends up behind memory.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use zk::{now_millis, selective_disclosure, ProofOptions, ProofService};

use crate::config::OracleConfig;
use crate::events::{Notifier, PaymentEvent};
use crate::matching::{candidates, match_amount};
use crate::payment::{validate_signature, PaymentRecord, PaymentRequest, PaymentStatus, NATIVE_TOKEN};
use crate::retry::with_retry;
use crate::source::{ObservedTransaction, TransactionSource};
use crate::store::PaymentStore;
use crate::{OracleError, OracleResult};

/// Outcome of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending intents after expiry cleanup
    pub pending: usize,
    /// Intents settled in this pass
    pub verified: usize,
    /// Intents removed as expired
    pub expired: usize,
    /// Transactions fetched and examined
    pub scanned: usize,
    /// Source or settlement errors, logged and skipped
    pub errors: usize,
}

/// Handle to the background poller
pub struct PollerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling. A pass already running completes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            error!("Payment poller task failed: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Matches payment intents to transactions and settles them with proofs
pub struct ReconciliationEngine {
    config: OracleConfig,
    proofs: Arc<ProofService>,
    source: Arc<dyn TransactionSource>,
    store: Arc<dyn PaymentStore>,
    notifier: Arc<dyn Notifier>,
    /// Records by payment id
    records: RwLock<HashMap<String, PaymentRecord>>,
    /// Transaction signature -> payment id holding it
    claims: Mutex<HashMap<String, String>>,
    /// Per-record write locks, held across the in-memory change and the save
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReconciliationEngine {
    /// Create an engine with injected collaborators
    pub fn new(
        config: OracleConfig,
        proofs: Arc<ProofService>,
        source: Arc<dyn TransactionSource>,
        store: Arc<dyn PaymentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> OracleResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            proofs,
            source,
            store,
            notifier,
            records: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Proof service used for settlement
    pub fn proofs(&self) -> &Arc<ProofService> {
        &self.proofs
    }

    /// Get a payment by id
    pub async fn get(&self, id: &str) -> Option<PaymentRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// All payments, oldest first
    pub async fn records(&self) -> Vec<PaymentRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Pending payments, oldest first
    pub async fn pending(&self) -> Vec<PaymentRecord> {
        let mut pending = self.records().await;
        pending.retain(PaymentRecord::is_pending);
        pending
    }

    /// Signature -> payment id for every claimed signature
    pub async fn claimed_signatures(&self) -> HashMap<String, String> {
        self.claims.lock().await.clone()
    }

    // ========================================
    // Startup
    // ========================================

    /// Load persisted records, dropping duplicates.
    ///
    /// Records sharing a transaction signature, or pending records sharing
    /// an order id, collapse to one: verified or refunded first, then the
    /// earliest created. Returns the number of records kept.
    pub async fn load(&self) -> OracleResult<usize> {
        let mut loaded = self.store.load_all().await?;
        loaded.sort_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let mut kept: Vec<PaymentRecord> = Vec::new();
        let mut duplicates: Vec<PaymentRecord> = Vec::new();
        let mut seen_signatures = HashSet::new();
        let mut seen_orders = HashSet::new();

        for record in loaded {
            let signature_taken = record
                .transaction_signature
                .as_ref()
                .is_some_and(|sig| seen_signatures.contains(sig));
            let order_taken = record.is_pending()
                && record
                    .order_id
                    .as_ref()
                    .is_some_and(|order| seen_orders.contains(order));

            if signature_taken || order_taken {
                duplicates.push(record);
                continue;
            }

            if let Some(sig) = &record.transaction_signature {
                seen_signatures.insert(sig.clone());
            }
            if let (true, Some(order)) = (record.is_pending(), &record.order_id) {
                seen_orders.insert(order.clone());
            }
            kept.push(record);
        }

        {
            let mut locks = self.write_locks.lock().await;
            let mut records = self.records.write().await;
            let mut claims = self.claims.lock().await;
            locks.clear();
            records.clear();
            claims.clear();
            for record in &kept {
                if let Some(sig) = &record.transaction_signature {
                    claims.insert(sig.clone(), record.id.clone());
                }
                records.insert(record.id.clone(), record.clone());
            }
        }

        for duplicate in duplicates {
            warn!(
                "Dropping duplicate payment {} (order {:?}, signature {:?})",
                duplicate.id, duplicate.order_id, duplicate.transaction_signature
            );
            if let Err(e) = self.store.delete(&duplicate.id).await {
                error!("Failed to delete duplicate {}: {}", duplicate.id, e);
            }
            self.notifier
                .notify(PaymentEvent::Deleted {
                    payment_id: duplicate.id,
                    reason: "duplicate".into(),
                })
                .await;
        }

        info!("Loaded {} payments", kept.len());
        Ok(kept.len())
    }

    // ========================================
    // Payment Operations
    // ========================================

    /// Register a new pending payment
    pub async fn create_payment(&self, request: PaymentRequest) -> OracleResult<PaymentRecord> {
        request.validate()?;

        let now = now_millis();
        let token = if request.token.is_empty() {
            NATIVE_TOKEN.to_string()
        } else {
            request.token
        };

        let record = PaymentRecord {
            id: format!("pay_{}", crypto::random_hex(12)),
            amount: request.amount,
            currency: request.currency,
            token,
            sol_amount: request.sol_amount,
            token_amount: request.token_amount,
            order_id: request.order_id,
            merchant_address: request.merchant_address,
            status: PaymentStatus::Pending,
            created_at: now,
            expires_at: now + self.config.payment_ttl_ms(),
            transaction_signature: None,
            proof: None,
            confirmed_at: None,
            refunded_at: None,
        };

        let lock = Arc::new(Mutex::new(()));
        let guard = lock.clone().lock_owned().await;
        {
            let mut locks = self.write_locks.lock().await;
            locks.insert(record.id.clone(), lock);
            self.records
                .write()
                .await
                .insert(record.id.clone(), record.clone());
        }
        self.persist(&record).await;
        drop(guard);

        info!(
            "Created payment {} for {} {} (order {:?})",
            record.id,
            record.expected_amount(),
            record.token,
            record.order_id
        );
        self.notifier
            .notify(PaymentEvent::Created {
                record: record.clone(),
            })
            .await;

        Ok(record)
    }

    /// Bind a caller-supplied signature to a pending payment and try to
    /// settle it right away.
    ///
    /// The binding is kept when the transaction is not visible yet or does
    /// not match; later passes re-check it. Returns the record as it stands.
    pub async fn verify_payment(&self, id: &str, signature: &str) -> OracleResult<PaymentRecord> {
        validate_signature(signature)?;

        let current = self
            .get(id)
            .await
            .ok_or_else(|| OracleError::NotFound(id.to_string()))?;

        if current.transaction_signature.as_deref() == Some(signature) && !current.is_pending() {
            return Ok(current);
        }
        if !current.is_pending() {
            return Err(OracleError::InvalidTransition {
                from: current.status,
                to: PaymentStatus::Verified,
            });
        }

        if let Some(owner) = self.claim_signature(signature, id).await {
            return Err(OracleError::InvalidInput(format!(
                "signature already used by payment {}",
                owner
            )));
        }

        let Some(guard) = self.lock_record(id).await else {
            self.release_signature(signature, id).await;
            return Err(OracleError::NotFound(id.to_string()));
        };
        let bound = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .filter(|r| r.is_pending())
                .filter(|r| r.transaction_signature.as_deref().map_or(true, |s| s == signature));
            match record {
                Some(record) => {
                    let previous = record.transaction_signature.replace(signature.to_string());
                    Some((record.clone(), previous))
                }
                None => None,
            }
        };

        let Some((record, previous)) = bound else {
            drop(guard);
            self.release_signature(signature, id).await;
            let record = self
                .get(id)
                .await
                .ok_or_else(|| OracleError::NotFound(id.to_string()))?;
            if record.is_pending() {
                return Err(OracleError::InvalidInput(format!(
                    "payment {} is bound to another signature",
                    id
                )));
            }
            return Err(OracleError::InvalidTransition {
                from: record.status,
                to: PaymentStatus::Verified,
            });
        };

        if previous.is_none() {
            self.persist(&record).await;
            info!("Bound signature {} to payment {}", short_sig(signature), id);
        }
        drop(guard);

        self.settle_bound(&record).await?;

        self.get(id)
            .await
            .ok_or_else(|| OracleError::NotFound(id.to_string()))
    }

    /// Refund a verified payment
    pub async fn refund(&self, id: &str) -> OracleResult<PaymentRecord> {
        let guard = self
            .lock_record(id)
            .await
            .ok_or_else(|| OracleError::NotFound(id.to_string()))?;
        let record = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(id)
                .ok_or_else(|| OracleError::NotFound(id.to_string()))?;
            record.transition(PaymentStatus::Refunded)?;
            record.refunded_at = Some(now_millis());
            record.clone()
        };

        self.persist(&record).await;
        drop(guard);
        info!("Refunded payment {}", id);

        self.notifier
            .notify(PaymentEvent::Refunded {
                payment_id: record.id.clone(),
                refunded_at: record.refunded_at.unwrap_or_default(),
            })
            .await;

        Ok(record)
    }

    /// Remove a payment on request
    pub async fn delete(&self, id: &str) -> OracleResult<()> {
        let guard = self
            .lock_record(id)
            .await
            .ok_or_else(|| OracleError::NotFound(id.to_string()))?;
        let record = self
            .records
            .write()
            .await
            .remove(id)
            .ok_or_else(|| OracleError::NotFound(id.to_string()))?;
        let deleted = self.store.delete(id).await;
        drop(guard);
        self.forget_lock(id).await;

        if record.is_pending() {
            if let Some(sig) = &record.transaction_signature {
                self.release_signature(sig, id).await;
            }
        }

        info!("Deleted payment {}", id);
        self.notifier
            .notify(PaymentEvent::Deleted {
                payment_id: id.to_string(),
                reason: "deleted".into(),
            })
            .await;

        deleted
    }

    /// Remove pending payments past their expiry. Returns how many went.
    pub async fn cleanup_expired(&self, now: i64) -> usize {
        let ids: Vec<String> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id.clone())
            .collect();

        let mut expired = Vec::new();
        for id in ids {
            let Some(guard) = self.lock_record(&id).await else {
                continue;
            };
            let removed = {
                let mut records = self.records.write().await;
                let still_expired = records.get(&id).is_some_and(|r| r.is_expired(now));
                if still_expired {
                    records.remove(&id)
                } else {
                    None
                }
            };
            let Some(record) = removed else {
                continue;
            };
            if let Err(e) = self.store.delete(&record.id).await {
                error!("Failed to delete expired payment {}: {}", record.id, e);
            }
            drop(guard);
            self.forget_lock(&id).await;
            expired.push(record);
        }

        for record in &expired {
            if let Some(sig) = &record.transaction_signature {
                self.release_signature(sig, &record.id).await;
            }
            info!("Payment {} expired", record.id);
            self.notifier
                .notify(PaymentEvent::Expired {
                    payment_id: record.id.clone(),
                    order_id: record.order_id.clone(),
                })
                .await;
        }

        if !expired.is_empty() {
            info!("Cleanup complete: {} expired payments removed", expired.len());
        }
        expired.len()
    }

    // ========================================
    // Reconciliation
    // ========================================

    /// Run one reconciliation pass
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport {
            expired: self.cleanup_expired(now_millis()).await,
            ..Default::default()
        };

        let pending = self.pending().await;
        report.pending = pending.len();
        if pending.is_empty() {
            return report;
        }

        let (bound, unbound): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|r| r.transaction_signature.is_some());

        for record in &bound {
            match self.settle_bound(record).await {
                Ok(true) => report.verified += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Re-check of payment {} failed: {}", record.id, e);
                    report.errors += 1;
                }
            }
        }

        if unbound.is_empty() {
            return report;
        }

        let transactions = self.fetch_recent(&unbound, &mut report).await;
        report.scanned = transactions.len();

        for record in &unbound {
            match self.settle_from(record, &transactions).await {
                Ok(true) => report.verified += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Settlement of payment {} failed: {}", record.id, e);
                    report.errors += 1;
                }
            }
        }

        debug!(
            "Reconcile pass: {} pending, {} verified, {} expired, {} scanned, {} errors",
            report.pending, report.verified, report.expired, report.scanned, report.errors
        );
        report
    }

    /// Start polling in the background
    pub fn start(self: Arc<Self>) -> PollerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.config.poll_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Payment poller started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.reconcile_once().await;
                        if report.verified > 0 || report.expired > 0 || report.errors > 0 {
                            info!(
                                "Reconciled: {} verified, {} expired, {} errors, {} still pending",
                                report.verified,
                                report.expired,
                                report.errors,
                                report.pending.saturating_sub(report.verified)
                            );
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Payment poller stopped");
        });

        PollerHandle { stop_tx, task }
    }

    /// Recent transactions for every merchant with unbound intents
    async fn fetch_recent(
        &self,
        unbound: &[PaymentRecord],
        report: &mut ReconcileReport,
    ) -> Vec<ObservedTransaction> {
        let merchants: BTreeSet<&str> = unbound
            .iter()
            .map(|r| r.merchant_address.as_str())
            .collect();

        let mut seen = HashSet::new();
        let mut transactions = Vec::new();

        for merchant in merchants {
            let limit = self.config.fetch_limit;
            let signatures = match with_retry(&self.config, "getSignaturesForAddress", || {
                self.source.recent_signatures(merchant, limit)
            })
            .await
            {
                Ok(signatures) => signatures,
                Err(e) => {
                    warn!("Could not list signatures for {}: {}", merchant, e);
                    report.errors += 1;
                    continue;
                }
            };

            let claimed = self.claimed_signatures().await;
            for signature in signatures {
                if claimed.contains_key(&signature) || !seen.insert(signature.clone()) {
                    continue;
                }
                match self.fetch_transaction(&signature).await {
                    Ok(Some(tx)) => transactions.push(tx),
                    Ok(None) => debug!("Transaction {} not visible yet", short_sig(&signature)),
                    Err(e) => {
                        warn!("Could not fetch {}: {}", short_sig(&signature), e);
                        report.errors += 1;
                    }
                }
            }
        }

        transactions
    }

    async fn fetch_transaction(&self, signature: &str) -> OracleResult<Option<ObservedTransaction>> {
        with_retry(&self.config, "getTransaction", || {
            self.source.transaction(signature)
        })
        .await
    }

    /// Try each matching candidate in order until one settles
    async fn settle_from(
        &self,
        record: &PaymentRecord,
        transactions: &[ObservedTransaction],
    ) -> OracleResult<bool> {
        let claims = self.claimed_signatures().await;
        let matches: Vec<(String, f64)> = candidates(record, transactions, &claims, &self.config)
            .map(|(tx, amount)| (tx.signature.clone(), amount))
            .collect();

        for (signature, amount) in matches {
            if self.claim_signature(&signature, &record.id).await.is_some() {
                continue;
            }
            if self.settle(record, &signature, amount, true).await? {
                return Ok(true);
            }
            if !self.get(&record.id).await.is_some_and(|r| r.is_pending()) {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// Re-check a record's bound signature
    async fn settle_bound(&self, record: &PaymentRecord) -> OracleResult<bool> {
        let Some(signature) = record.transaction_signature.as_deref() else {
            return Ok(false);
        };

        let Some(tx) = self.fetch_transaction(signature).await? else {
            debug!("Bound transaction {} not visible yet", short_sig(signature));
            return Ok(false);
        };

        let Some(amount) = match_amount(record, &tx, &self.config) else {
            debug!(
                "Bound transaction {} does not satisfy payment {}",
                short_sig(signature),
                record.id
            );
            return Ok(false);
        };

        self.settle(record, signature, amount, false).await
    }

    /// Generate a proof and move the record to verified.
    ///
    /// The caller holds the claim on `signature`. With `release` set the
    /// claim is dropped on every path that does not end in verified.
    async fn settle(
        &self,
        record: &PaymentRecord,
        signature: &str,
        amount: f64,
        release: bool,
    ) -> OracleResult<bool> {
        let (min, max) = self.proofs.config().bounds(record.expected_amount());
        if amount < min || amount > max {
            debug!(
                "Amount {} for payment {} is outside the provable range [{}, {}]",
                amount, record.id, min, max
            );
            if release {
                self.release_signature(signature, &record.id).await;
            }
            return Ok(false);
        }

        let proof = match self
            .proofs
            .generate_proof(signature, amount, record.expected_amount(), ProofOptions::default())
            .await
        {
            Ok(proof) => proof,
            Err(e) => {
                if release {
                    self.release_signature(signature, &record.id).await;
                }
                return Err(e.into());
            }
        };

        if !proof.verified {
            warn!(
                "Proof {} for payment {} did not verify, leaving it pending",
                proof.id, record.id
            );
            if release {
                self.release_signature(signature, &record.id).await;
            }
            return Ok(false);
        }

        let public = selective_disclosure(&proof, false);

        let Some(guard) = self.lock_record(&record.id).await else {
            debug!("Payment {} is gone, releasing {}", record.id, short_sig(signature));
            if release {
                self.release_signature(signature, &record.id).await;
            }
            return Ok(false);
        };
        let updated = {
            let mut records = self.records.write().await;
            match records.get_mut(&record.id) {
                Some(current)
                    if current.is_pending()
                        && current
                            .transaction_signature
                            .as_deref()
                            .map_or(true, |s| s == signature) =>
                {
                    current.transaction_signature = Some(signature.to_string());
                    current.proof = Some(proof);
                    current.confirmed_at = Some(now_millis());
                    current.transition(PaymentStatus::Verified)?;
                    Some(current.clone())
                }
                _ => None,
            }
        };

        let Some(updated) = updated else {
            drop(guard);
            debug!("Payment {} settled elsewhere, releasing {}", record.id, short_sig(signature));
            if release {
                self.release_signature(signature, &record.id).await;
            }
            return Ok(false);
        };

        self.persist(&updated).await;
        drop(guard);
        info!(
            "Payment {} verified by {} ({} {})",
            updated.id,
            short_sig(signature),
            amount,
            updated.token
        );

        self.notifier
            .notify(PaymentEvent::Verified {
                payment_id: updated.id.clone(),
                order_id: updated.order_id.clone(),
                amount,
                proof: public,
            })
            .await;

        Ok(true)
    }

    /// Claim a signature for a payment. Returns the other owner on conflict.
    async fn claim_signature(&self, signature: &str, payment_id: &str) -> Option<String> {
        let mut claims = self.claims.lock().await;
        match claims.get(signature) {
            Some(owner) if owner == payment_id => None,
            Some(owner) => Some(owner.clone()),
            None => {
                claims.insert(signature.to_string(), payment_id.to_string());
                None
            }
        }
    }

    async fn release_signature(&self, signature: &str, payment_id: &str) {
        let mut claims = self.claims.lock().await;
        if claims.get(signature).is_some_and(|owner| owner == payment_id) {
            claims.remove(signature);
        }
    }

    /// Take the write lock for one record. `None` when the record is gone.
    async fn lock_record(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.write_locks.lock().await;
            if !self.records.read().await.contains_key(id) {
                return None;
            }
            locks.entry(id.to_string()).or_default().clone()
        };
        Some(lock.lock_owned().await)
    }

    /// Drop the write lock of a record that left memory
    async fn forget_lock(&self, id: &str) {
        self.write_locks.lock().await.remove(id);
    }

    async fn persist(&self, record: &PaymentRecord) {
        if let Err(e) = self.store.save(record).await {
            error!("Failed to persist payment {}: {}", record.id, e);
        }
    }
}

/// Sort key for duplicate resolution: settled records win
fn rank(record: &PaymentRecord) -> u8 {
    match record.status {
        PaymentStatus::Verified | PaymentStatus::Refunded => 0,
        PaymentStatus::Pending => 1,
        PaymentStatus::Failed => 2,
    }
}

fn short_sig(signature: &str) -> &str {
    signature.get(..8).unwrap_or(signature)
}
