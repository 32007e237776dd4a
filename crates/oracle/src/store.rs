//! Payment persistence
//!
//! The engine keeps every record in memory and writes through to a
//! [`PaymentStore`]. Store failures are logged by the caller; the in-memory
//! copy stays authoritative until the next successful write.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::payment::PaymentRecord;
use crate::{OracleError, OracleResult};

/// Durable storage for payment records
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert or replace a record by id
    async fn save(&self, record: &PaymentRecord) -> OracleResult<()>;

    /// Every stored record
    async fn load_all(&self) -> OracleResult<Vec<PaymentRecord>>;

    /// Remove a record. Missing ids are not an error.
    async fn delete(&self, id: &str) -> OracleResult<()>;
}

/// Volatile store, mainly for tests and demos
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, PaymentRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<PaymentRecord> {
        self.records.read().await.get(id).cloned()
    }

    fn check(&self) -> OracleResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Persistence("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn save(&self, record: &PaymentRecord) -> OracleResult<()> {
        self.check()?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> OracleResult<Vec<PaymentRecord>> {
        self.check()?;
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> OracleResult<()> {
        self.check()?;
        self.records.write().await.remove(id);
        Ok(())
    }
}

/// Records kept as a JSON array in a single file
pub struct JsonFileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> OracleResult<Vec<PaymentRecord>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn write(&self, records: &[PaymentRecord]) -> OracleResult<()> {
        write_json(&self.path, &records).await
    }
}

#[async_trait]
impl PaymentStore for JsonFileStore {
    async fn save(&self, record: &PaymentRecord) -> OracleResult<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        match records.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write(&records).await
    }

    async fn load_all(&self) -> OracleResult<Vec<PaymentRecord>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn delete(&self, id: &str) -> OracleResult<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() != before {
            self.write(&records).await?;
        }
        Ok(())
    }
}

/// Read a JSON file, `None` if it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> OracleResult<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(OracleError::Persistence(format!(
                "read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| OracleError::Persistence(format!("parse {}: {}", path.display(), e)))
}

/// Write a JSON file through a temporary sibling and a rename
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> OracleResult<()> {
    let persistence = |e: std::io::Error| {
        OracleError::Persistence(format!("write {}: {}", path.display(), e))
    };

    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| OracleError::Persistence(format!("encode: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(persistence)?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await.map_err(persistence)?;
    tokio::fs::rename(&tmp, path).await.map_err(persistence)?;
    Ok(())
}
