//! Cache-aside facade over a [`KeyValueStore`].
//!
//! Reads distinguish three outcomes: a valid record, a genuine miss, and a
//! store failure. An entry that cannot be decoded, or decodes into a record
//! without a subject id or name, is deleted before the miss is reported so
//! the same poisoned entry is never served twice.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::store::{KeyValueStore, StoreError};

/// A lookup result as cached and as returned to callers.
///
/// Field names on the wire follow the upstream service's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(rename = "cpf")]
    pub subject_id: String,
    #[serde(rename = "nome")]
    pub name: String,
    #[serde(rename = "nome_mae", default, skip_serializing_if = "Option::is_none")]
    pub mother_name: Option<String>,
    #[serde(rename = "sexo", default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(rename = "situacao")]
    pub status: String,
    #[serde(rename = "data_nasc", default)]
    pub birth_date: String,
    #[serde(default)]
    pub score: i64,
    #[serde(rename = "last_check")]
    pub last_checked: DateTime<Utc>,
}

impl CacheRecord {
    /// A record is usable only with a non-blank subject id and name.
    pub fn is_valid(&self) -> bool {
        !self.subject_id.trim().is_empty() && !self.name.trim().is_empty()
    }
}

/// Outcome of a successful cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(CacheRecord),
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The store failed or did not answer within the store timeout.
    StoreUnavailable(String),
    /// The record could not be serialized.
    Encode(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Encode(msg) => write!(f, "failed to encode record: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Cache-aside access to lookup records.
#[derive(Debug)]
pub struct LookupCache<S> {
    store: S,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl<S: KeyValueStore> LookupCache<S> {
    /// Wraps `store`, bounding every store call by `timeout`.
    pub fn new(store: S, timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            timeout,
            metrics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reads the record under `key`.
    ///
    /// Corrupt or invalid entries are deleted and reported as
    /// [`CacheLookup::Miss`]; only store failures surface as errors.
    pub async fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        let Some(bytes) = self.timed("get", self.store.get(key)).await? else {
            debug!(key, "cache miss");
            return Ok(CacheLookup::Miss);
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) if record.is_valid() => {
                debug!(key, "cache hit");
                Ok(CacheLookup::Hit(record))
            }
            Ok(_) => {
                self.heal(key, "record lacks subject id or name").await;
                Ok(CacheLookup::Miss)
            }
            Err(e) => {
                self.heal(key, &e.to_string()).await;
                Ok(CacheLookup::Miss)
            }
        }
    }

    /// Writes `record` under `key`, replacing any previous entry. The TTL is
    /// fixed here and never refreshed by reads.
    pub async fn put(&self, key: &str, record: &CacheRecord, ttl: Duration) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(record).map_err(|e| CacheError::Encode(e.to_string()))?;
        self.timed("set", self.store.set(key, bytes, ttl)).await
    }

    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.timed("delete", self.store.delete(key)).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.timed("ping", self.store.ping()).await
    }

    async fn heal(&self, key: &str, reason: &str) {
        self.metrics.record_corrupt_entry();
        warn!(key, reason, "discarding corrupt cache entry");
        if let Err(e) = self.timed("delete", self.store.delete(key)).await {
            warn!(key, error = %e, "failed to delete corrupt cache entry");
        }
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "store operation failed");
                Err(CacheError::StoreUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(op, timeout = ?self.timeout, "store operation timed out");
                Err(CacheError::StoreUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}
