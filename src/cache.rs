use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::DEFAULT_INCIDENT_CACHE_TTL_SECS;
use crate::coords::{IncidentListKey, INCIDENT_KEY_PREFIX};
use crate::jobs::JobKind;
use crate::store::KvStore;

pub const GEOCODE_KEY_PREFIX: &str = "geocode:";
const INVALIDATION_ATTEMPTS: u32 = 3;
const INVALIDATION_BACKOFF_MS: u64 = 50;

/// Which group of cached entries an invalidation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    IncidentLists,
    Geocode,
    Prefix(String),
}

impl CacheScope {
    fn prefix(&self) -> &str {
        match self {
            CacheScope::IncidentLists => INCIDENT_KEY_PREFIX,
            CacheScope::Geocode => GEOCODE_KEY_PREFIX,
            CacheScope::Prefix(prefix) => prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Removed(usize),
    Failed(String),
}

/// Handle to a background invalidation. Dropping it leaves the task running.
#[derive(Debug)]
pub struct Invalidation {
    scope: CacheScope,
    handle: JoinHandle<InvalidationOutcome>,
}

impl Invalidation {
    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    pub async fn outcome(self) -> InvalidationOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => InvalidationOutcome::Failed(err.to_string()),
        }
    }
}

/// Read-through result cache. Store failures never reach the caller: reads
/// degrade to a miss and writes are logged and dropped.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    incident_ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            incident_ttl: Duration::from_secs(DEFAULT_INCIDENT_CACHE_TTL_SECS),
        }
    }

    pub fn with_incident_ttl(mut self, ttl: Duration) -> Self {
        self.incident_ttl = ttl;
        self
    }

    pub fn incident_ttl(&self) -> Duration {
        self.incident_ttl
    }

    pub fn geocode_key(kind: JobKind, normalized: &str) -> String {
        format!("{GEOCODE_KEY_PREFIX}{}:{normalized}", kind.as_str())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "result_cache", ?err, key, "cache read failed; treating as miss");
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(err) = self.store.set(key, value, Some(ttl)) {
            warn!(target: "result_cache", ?err, key, "cache write failed; continuing without cache");
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(target: "result_cache", ?err, key, "discarding undecodable cache entry");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(encoded) => self.set(key, &encoded, ttl),
            Err(err) => warn!(target: "result_cache", ?err, key, "failed to encode cache entry"),
        }
    }

    pub fn get_incidents<T: DeserializeOwned>(&self, key: &IncidentListKey) -> Option<Vec<T>> {
        self.get_json(&key.cache_key())
    }

    /// Stores an incident list for the configured incident TTL.
    pub fn set_incidents<T: Serialize>(&self, key: &IncidentListKey, incidents: &[T]) {
        self.set_json(&key.cache_key(), &incidents, self.incident_ttl);
    }

    /// Removes every entry in `scope` on a background task, retrying store
    /// failures a few times. Must be called from within a tokio runtime.
    pub fn invalidate(&self, scope: CacheScope) -> Invalidation {
        let store = Arc::clone(&self.store);
        let prefix = scope.prefix().to_string();
        let handle = tokio::spawn(async move { remove_with_retry(store, prefix).await });
        Invalidation { scope, handle }
    }
}

async fn remove_with_retry(store: Arc<dyn KvStore>, prefix: String) -> InvalidationOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.delete_prefix(&prefix) {
            Ok(removed) => {
                debug!(target: "result_cache", prefix = %prefix, removed, "cache scope invalidated");
                return InvalidationOutcome::Removed(removed);
            }
            Err(err) if attempt < INVALIDATION_ATTEMPTS => {
                let delay = Duration::from_millis(INVALIDATION_BACKOFF_MS * u64::from(attempt));
                warn!(
                    target: "result_cache",
                    ?err,
                    attempt,
                    prefix = %prefix,
                    "cache invalidation failed; retrying after {:?}",
                    delay
                );
                sleep(delay).await;
            }
            Err(err) => {
                warn!(target: "result_cache", ?err, prefix = %prefix, "cache invalidation abandoned");
                return InvalidationOutcome::Failed(err.to_string());
            }
        }
    }
}
