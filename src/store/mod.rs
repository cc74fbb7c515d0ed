pub mod file;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{DeploymentRecord, DeploymentStatus, LogEntry, RollbackEvent};

pub use file::FileStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deployment {0} not found")]
    NotFound(Uuid),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persistence for deployment records and rollback-tracking records.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert(&self, record: DeploymentRecord) -> Result<(), StoreError>;

    async fn load(&self, id: Uuid) -> Result<DeploymentRecord, StoreError>;

    /// Read-modify-write of one record. Returns the record as stored.
    async fn update(
        &self,
        id: Uuid,
        f: &(dyn for<'r> Fn(&'r mut DeploymentRecord) + Send + Sync),
    ) -> Result<DeploymentRecord, StoreError>;

    /// All records, oldest first, optionally restricted to one application.
    async fn list(&self, application: Option<&str>) -> Result<Vec<DeploymentRecord>, StoreError>;

    async fn insert_rollback_event(&self, event: RollbackEvent) -> Result<(), StoreError>;

    /// Tracking record whose corrective deployment is `rollback_deployment_id`.
    async fn find_rollback_event(
        &self,
        rollback_deployment_id: Uuid,
    ) -> Result<Option<RollbackEvent>, StoreError>;

    async fn save_rollback_event(&self, event: &RollbackEvent) -> Result<(), StoreError>;

    async fn append_log(&self, id: Uuid, entry: LogEntry) -> Result<(), StoreError> {
        self.update(id, &|record| record.log_entries.push(entry.clone()))
            .await
            .map(|_| ())
    }

    async fn status(&self, id: Uuid) -> Result<DeploymentStatus, StoreError> {
        Ok(self.load(id).await?.status)
    }

    /// Most recent finished deployment of `application` other than `exclude`.
    async fn last_successful(
        &self,
        application: &str,
        exclude: Uuid,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        let records = self.list(Some(application)).await?;
        Ok(records
            .into_iter()
            .rev()
            .find(|r| r.id != exclude && r.status == DeploymentStatus::Finished))
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, DeploymentRecord>,
    rollbacks: HashMap<Uuid, RollbackEvent>,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: DeploymentRecord) -> Result<(), StoreError> {
        self.state.lock().await.records.insert(record.id, record);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<DeploymentRecord, StoreError> {
        self.state
            .lock()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(
        &self,
        id: Uuid,
        f: &(dyn for<'r> Fn(&'r mut DeploymentRecord) + Send + Sync),
    ) -> Result<DeploymentRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(record);
        record.updated_at = chrono::Utc::now();
        Ok(record.clone())
    }

    async fn list(&self, application: Option<&str>) -> Result<Vec<DeploymentRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| application.map_or(true, |a| r.application == a))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_rollback_event(&self, event: RollbackEvent) -> Result<(), StoreError> {
        self.state.lock().await.rollbacks.insert(event.id, event);
        Ok(())
    }

    async fn find_rollback_event(
        &self,
        rollback_deployment_id: Uuid,
    ) -> Result<Option<RollbackEvent>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rollbacks
            .values()
            .find(|e| e.rollback_deployment_id == rollback_deployment_id)
            .cloned())
    }

    async fn save_rollback_event(&self, event: &RollbackEvent) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .rollbacks
            .insert(event.id, event.clone());
        Ok(())
    }
}
