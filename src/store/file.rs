use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use super::{DeploymentStore, StoreError};
use crate::model::{DeploymentRecord, RollbackEvent};

/// One pretty-printed JSON file per record:
/// `{root}/deployments/{id}.json` and `{root}/rollbacks/{id}.json`.
///
/// Writers from any process serialize on an exclusive `flock` of the sibling
/// `{id}.lock` file, so a `cancel` issued from another invocation is never lost
/// in the middle of a read-modify-write.
pub struct FileStore {
    root: PathBuf,
}

/// Exclusive advisory lock, released when dropped.
struct FileLock {
    _file: File,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            flock_exclusive(&file)?;
            Ok::<_, StoreError>(FileLock { _file: file })
        })
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

/// Block until an exclusive `flock` is held on `file`.
fn flock_exclusive(file: &File) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file`, which outlives the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl FileStore {
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("deployments")).await?;
        fs::create_dir_all(root.join("rollbacks")).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join("deployments").join(format!("{}.json", id))
    }

    fn rollback_path(&self, id: Uuid) -> PathBuf {
        self.root.join("rollbacks").join(format!("{}.json", id))
    }

    async fn lock(path: &Path) -> Result<FileLock, StoreError> {
        FileLock::acquire(path.with_extension("lock")).await
    }

    async fn read_record(&self, id: Uuid) -> Result<DeploymentRecord, StoreError> {
        let path = self.record_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Write through a uniquely named temporary file and rename it into place.
    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut entries = fs::read_dir(dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            out.push(serde_json::from_str(&content)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl DeploymentStore for FileStore {
    async fn insert(&self, record: DeploymentRecord) -> Result<(), StoreError> {
        let path = self.record_path(record.id);
        let _lock = Self::lock(&path).await?;
        Self::write_json(&path, &record).await
    }

    async fn load(&self, id: Uuid) -> Result<DeploymentRecord, StoreError> {
        self.read_record(id).await
    }

    async fn update(
        &self,
        id: Uuid,
        f: &(dyn for<'r> Fn(&'r mut DeploymentRecord) + Send + Sync),
    ) -> Result<DeploymentRecord, StoreError> {
        let path = self.record_path(id);
        let _lock = Self::lock(&path).await?;
        let mut record = self.read_record(id).await?;
        f(&mut record);
        record.updated_at = chrono::Utc::now();
        Self::write_json(&path, &record).await?;
        Ok(record)
    }

    async fn list(&self, application: Option<&str>) -> Result<Vec<DeploymentRecord>, StoreError> {
        let mut records: Vec<DeploymentRecord> =
            Self::read_dir_json(&self.root.join("deployments")).await?;
        records.retain(|r| application.map_or(true, |a| r.application == a));
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn insert_rollback_event(&self, event: RollbackEvent) -> Result<(), StoreError> {
        self.save_rollback_event(&event).await
    }

    async fn find_rollback_event(
        &self,
        rollback_deployment_id: Uuid,
    ) -> Result<Option<RollbackEvent>, StoreError> {
        let events: Vec<RollbackEvent> = Self::read_dir_json(&self.root.join("rollbacks")).await?;
        Ok(events
            .into_iter()
            .find(|e| e.rollback_deployment_id == rollback_deployment_id))
    }

    async fn save_rollback_event(&self, event: &RollbackEvent) -> Result<(), StoreError> {
        let path = self.rollback_path(event.id);
        let _lock = Self::lock(&path).await?;
        Self::write_json(&path, event).await
    }
}
