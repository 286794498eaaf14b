//! Job records on top of the key-value persistence collaborator.
//!
//! Layout:
//! - `job:{id}` holds the JSON-encoded [`Job`]. Terminal records are rewritten
//!   with the retention TTL so the backend archives them.
//! - `jobs:active` holds the JSON list of non-terminal job ids, used by crash
//!   recovery.

use std::time::Duration;

use tokio::sync::Mutex;

use meetflow_core::JobId;

use super::types::Job;
use crate::persistence::{KeyValueStore, StoreError};

const ACTIVE_INDEX_KEY: &str = "jobs:active";

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

/// Source of truth for job state.
pub struct JobStore<S> {
    store: S,
    retention: Duration,
    /// Serializes read-modify-write of the active index.
    index_lock: Mutex<()>,
}

impl<S: KeyValueStore> JobStore<S> {
    pub fn new(store: S, retention: Duration) -> Self {
        Self {
            store,
            retention,
            index_lock: Mutex::new(()),
        }
    }

    /// Persist a freshly created job and register it as active.
    pub async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        self.put(job).await?;
        self.update_index(|ids| {
            if !ids.contains(&job.id) {
                ids.push(job.id);
            }
        })
        .await
    }

    /// Persist the current state of a job.
    pub async fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        self.put(job).await?;
        if job.status.is_terminal() {
            self.update_index(|ids| ids.retain(|id| *id != job.id)).await?;
        }
        Ok(())
    }

    pub async fn load(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.store.get(&job_key(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| JobStoreError::Corrupt(format!("{id}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.load(id).await?.ok_or(JobStoreError::NotFound(id))
    }

    /// Ids of jobs that have not reached a terminal status.
    pub async fn active_ids(&self) -> Result<Vec<JobId>, JobStoreError> {
        let _guard = self.index_lock.lock().await;
        self.read_index().await
    }

    async fn put(&self, job: &Job) -> Result<(), JobStoreError> {
        let bytes = serde_json::to_vec(job).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        let ttl = job.status.is_terminal().then_some(self.retention);
        self.store.put(&job_key(job.id), bytes, ttl).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<Vec<JobId>, JobStoreError> {
        match self.store.get(ACTIVE_INDEX_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| JobStoreError::Corrupt(format!("{ACTIVE_INDEX_KEY}: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    async fn update_index<F>(&self, f: F) -> Result<(), JobStoreError>
    where
        F: FnOnce(&mut Vec<JobId>),
    {
        let _guard = self.index_lock.lock().await;
        let mut ids = self.read_index().await?;
        f(&mut ids);
        let bytes = serde_json::to_vec(&ids).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
        self.store.put(ACTIVE_INDEX_KEY, bytes, None).await?;
        Ok(())
    }
}
