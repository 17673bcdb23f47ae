//! Run cache: fast, shared state for "is this run running" and "what's its
//! last known status", backed by a NATS JetStream Key-Value bucket.
//!
//! Status entries carry a best-effort TTL: a `set_status_with_ttl` write
//! stamps an expiry alongside the value, and `get_status` treats an expired
//! entry as absent on read (lazy eviction) rather than relying on bucket-wide
//! TTL configuration, since a single bucket here serves both TTL'd status
//! entries and the untimed running-set entry.

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use silver_telegram_core::WorkflowRunId;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::CacheError;

const BUCKET_NAME: &str = "scheduler-run-cache";
const RUNNING_SET_KEY: &str = "running-set";
const PENDING_SET_KEY: &str = "pending-set";
const STATUS_KEY_PREFIX: &str = "status.";

/// A cached status snapshot for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStatus {
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusEntry {
    status: CachedStatus,
    expires_at: Option<DateTime<Utc>>,
}

/// Shared state for run admission: last known status per run, and the set
/// of runs currently executing.
#[async_trait]
pub trait RunCache: Send + Sync {
    /// Records a run's status with no expiry.
    async fn set_status(&self, run_id: WorkflowRunId, status: CachedStatus) -> Result<(), CacheError>;

    /// Records a run's status, expiring after `ttl_seconds`. Used for
    /// terminal transitions so the cache doesn't grow unbounded.
    async fn set_status_with_ttl(
        &self,
        run_id: WorkflowRunId,
        status: CachedStatus,
        ttl_seconds: i64,
    ) -> Result<(), CacheError>;

    /// Reads a run's cached status, if present and unexpired.
    async fn get_status(&self, run_id: WorkflowRunId) -> Result<Option<CachedStatus>, CacheError>;

    /// Adds a run to the currently-running set.
    async fn add_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError>;

    /// Removes a run from the currently-running set.
    async fn remove_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError>;

    /// Returns how many runs are currently in the running set.
    async fn running_count(&self) -> Result<usize, CacheError>;

    /// Returns every run id currently in the running set.
    async fn all_running(&self) -> Result<Vec<WorkflowRunId>, CacheError>;

    /// Adds a run to the pending-admission set. Called when a run is
    /// created but not yet admitted to execution.
    async fn add_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError>;

    /// Removes a run from the pending-admission set. Called once the
    /// scheduler admits the run.
    async fn remove_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError>;

    /// Returns run ids eligible for admission (pending or queued). Scan
    /// order is unspecified.
    async fn pending_runs(&self) -> Result<Vec<WorkflowRunId>, CacheError>;
}

/// A NATS JetStream Key-Value backed [`RunCache`].
pub struct NatsRunCache {
    store: kv::Store,
}

impl NatsRunCache {
    /// Connects to NATS and ensures the backing KV bucket exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or bucket setup fails.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?;
        let jetstream = jetstream::new(client);

        let store = match jetstream.get_key_value(BUCKET_NAME).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: BUCKET_NAME.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| CacheError::Unavailable {
                    message: e.to_string(),
                })?,
        };

        Ok(Self { store })
    }

    fn status_key(run_id: WorkflowRunId) -> String {
        format!("{STATUS_KEY_PREFIX}{run_id}")
    }

    async fn put_status(
        &self,
        run_id: WorkflowRunId,
        status: CachedStatus,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CacheError> {
        let entry = StatusEntry { status, expires_at };
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;
        self.store
            .put(Self::status_key(run_id), bytes.into())
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn read_set(&self, key: &str) -> Result<(HashSet<WorkflowRunId>, Option<u64>), CacheError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?;

        match entry {
            Some(entry) => {
                let set: HashSet<WorkflowRunId> = serde_json::from_slice(&entry.value)
                    .map_err(|e| CacheError::Serialization {
                        message: e.to_string(),
                    })?;
                Ok((set, Some(entry.revision)))
            }
            None => Ok((HashSet::new(), None)),
        }
    }

    async fn write_set(
        &self,
        key: &str,
        set: &HashSet<WorkflowRunId>,
        revision: Option<u64>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(set).map_err(|e| CacheError::Serialization {
            message: e.to_string(),
        })?;

        let result = match revision {
            Some(revision) => self.store.update(key, bytes.into(), revision).await,
            None => self.store.create(key, bytes.into()).await,
        };

        result.map(|_| ()).map_err(|_| CacheError::ConcurrentModification)
    }

    async fn mutate_set(
        &self,
        key: &str,
        mutate: impl Fn(&mut HashSet<WorkflowRunId>),
    ) -> Result<(), CacheError> {
        // Compare-and-swap loop: revision-guarded so concurrent admitters
        // never silently drop each other's updates.
        const MAX_ATTEMPTS: usize = 8;
        for _ in 0..MAX_ATTEMPTS {
            let (mut set, revision) = self.read_set(key).await?;
            mutate(&mut set);
            match self.write_set(key, &set, revision).await {
                Ok(()) => return Ok(()),
                Err(CacheError::ConcurrentModification) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(CacheError::ConcurrentModification)
    }
}

#[async_trait]
impl RunCache for NatsRunCache {
    async fn set_status(&self, run_id: WorkflowRunId, status: CachedStatus) -> Result<(), CacheError> {
        self.put_status(run_id, status, None).await
    }

    async fn set_status_with_ttl(
        &self,
        run_id: WorkflowRunId,
        status: CachedStatus,
        ttl_seconds: i64,
    ) -> Result<(), CacheError> {
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl_seconds);
        self.put_status(run_id, status, Some(expires_at)).await
    }

    async fn get_status(&self, run_id: WorkflowRunId) -> Result<Option<CachedStatus>, CacheError> {
        let bytes = self
            .store
            .get(Self::status_key(run_id))
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let entry: StatusEntry =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Serialization {
                message: e.to_string(),
            })?;

        if let Some(expires_at) = entry.expires_at {
            if expires_at <= Utc::now() {
                return Ok(None);
            }
        }

        Ok(Some(entry.status))
    }

    async fn add_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        self.mutate_set(RUNNING_SET_KEY, |set| {
            set.insert(run_id);
        })
        .await
    }

    async fn remove_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        self.mutate_set(RUNNING_SET_KEY, |set| {
            set.remove(&run_id);
        })
        .await
    }

    async fn running_count(&self) -> Result<usize, CacheError> {
        let (set, _) = self.read_set(RUNNING_SET_KEY).await?;
        Ok(set.len())
    }

    async fn all_running(&self) -> Result<Vec<WorkflowRunId>, CacheError> {
        let (set, _) = self.read_set(RUNNING_SET_KEY).await?;
        Ok(set.into_iter().collect())
    }

    async fn add_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        self.mutate_set(PENDING_SET_KEY, |set| {
            set.insert(run_id);
        })
        .await
    }

    async fn remove_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        self.mutate_set(PENDING_SET_KEY, |set| {
            set.remove(&run_id);
        })
        .await
    }

    async fn pending_runs(&self) -> Result<Vec<WorkflowRunId>, CacheError> {
        let (set, _) = self.read_set(PENDING_SET_KEY).await?;
        Ok(set.into_iter().collect())
    }
}

/// An in-memory [`RunCache`] for tests.
#[derive(Default)]
pub struct InMemoryRunCache {
    inner: Mutex<InMemoryRunCacheState>,
}

#[derive(Default)]
struct InMemoryRunCacheState {
    statuses: HashMap<WorkflowRunId, StatusEntry>,
    running: HashSet<WorkflowRunId>,
    pending: HashSet<WorkflowRunId>,
}

impl InMemoryRunCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunCache for InMemoryRunCache {
    async fn set_status(&self, run_id: WorkflowRunId, status: CachedStatus) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.statuses.insert(
            run_id,
            StatusEntry {
                status,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_status_with_ttl(
        &self,
        run_id: WorkflowRunId,
        status: CachedStatus,
        ttl_seconds: i64,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.statuses.insert(
            run_id,
            StatusEntry {
                status,
                expires_at: Some(Utc::now() + ChronoDuration::seconds(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn get_status(&self, run_id: WorkflowRunId) -> Result<Option<CachedStatus>, CacheError> {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.statuses.get(&run_id) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at {
                    if expires_at <= Utc::now() {
                        return Ok(None);
                    }
                }
                Ok(Some(entry.status.clone()))
            }
            None => Ok(None),
        }
    }

    async fn add_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.running.insert(run_id);
        Ok(())
    }

    async fn remove_running(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.running.remove(&run_id);
        Ok(())
    }

    async fn running_count(&self) -> Result<usize, CacheError> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.running.len())
    }

    async fn all_running(&self) -> Result<Vec<WorkflowRunId>, CacheError> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.running.iter().copied().collect())
    }

    async fn add_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.pending.insert(run_id);
        Ok(())
    }

    async fn remove_pending(&self, run_id: WorkflowRunId) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.pending.remove(&run_id);
        Ok(())
    }

    async fn pending_runs(&self) -> Result<Vec<WorkflowRunId>, CacheError> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner.pending.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn running_set_add_remove_round_trip() {
        let cache = InMemoryRunCache::new();
        let run_id = WorkflowRunId::new();

        cache.add_running(run_id).await.unwrap();
        assert_eq!(cache.running_count().await.unwrap(), 1);
        assert_eq!(cache.all_running().await.unwrap(), vec![run_id]);

        cache.remove_running(run_id).await.unwrap();
        assert_eq!(cache.running_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_set_add_remove_round_trip() {
        let cache = InMemoryRunCache::new();
        let run_id = WorkflowRunId::new();

        cache.add_pending(run_id).await.unwrap();
        assert_eq!(cache.pending_runs().await.unwrap(), vec![run_id]);

        cache.remove_pending(run_id).await.unwrap();
        assert_eq!(cache.pending_runs().await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn status_round_trips() {
        let cache = InMemoryRunCache::new();
        let run_id = WorkflowRunId::new();
        let status = CachedStatus {
            status: "running".to_string(),
            error_message: None,
        };
        cache.set_status(run_id, status.clone()).await.unwrap();
        assert_eq!(cache.get_status(run_id).await.unwrap(), Some(status));
    }

    #[tokio::test]
    async fn ttl_status_expires() {
        let cache = InMemoryRunCache::new();
        let run_id = WorkflowRunId::new();
        let status = CachedStatus {
            status: "completed".to_string(),
            error_message: None,
        };
        cache.set_status_with_ttl(run_id, status, -1).await.unwrap();
        assert_eq!(cache.get_status(run_id).await.unwrap(), None);
    }
}
