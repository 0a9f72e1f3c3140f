//! File-based credential storage.
//!
//! Each instance owns a directory under the sessions root:
//!
//! ```text
//! <sessions_dir>/<instance_id>/creds.json
//! ```
//!
//! This tier is authoritative. Writes are atomic (temp file + fsync + rename)
//! so a crash mid-rotation never leaves a truncated credential file behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::{StorageError, StorageResult};
use super::{CredentialBackend, SessionRecord, validate_instance_id};

const CREDS_FILE: &str = "creds.json";

/// Credential backend persisting one JSON file per instance.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn instance_dir(&self, instance_id: &str) -> StorageResult<PathBuf> {
        validate_instance_id(instance_id)?;
        Ok(self.root.join(instance_id))
    }

    fn creds_path(&self, instance_id: &str) -> StorageResult<PathBuf> {
        Ok(self.instance_dir(instance_id)?.join(CREDS_FILE))
    }
}

#[async_trait]
impl CredentialBackend for FileCredentialStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, instance_id: &str) -> StorageResult<Option<SessionRecord>> {
        let path = self.creds_path(instance_id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };
        let record: SessionRecord = serde_json::from_slice(&data)?;
        if record.instance_id != instance_id {
            return Err(StorageError::Corrupt {
                instance_id: instance_id.to_string(),
                reason: format!("file belongs to {}", record.instance_id),
            });
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &SessionRecord) -> StorageResult<()> {
        let dir = self.instance_dir(&record.instance_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::file_io(&dir, e))?;
        let data = serde_json::to_vec_pretty(record)?;
        replace_file(&dir.join(CREDS_FILE), &data).await
    }

    async fn delete(&self, instance_id: &str) -> StorageResult<()> {
        let path = self.creds_path(instance_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }
}

/// Replace `path` with `data` via a uniquely named sibling temp file.
///
/// A failed write removes its temp file and leaves the previous credentials intact.
async fn replace_file(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp = path.with_extension(format!("{}.tmp", ulid::Ulid::new()));

    let written = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(StorageError::file_io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Credentials;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(id, Credentials(json!({"me": {"id": "5511@s.whatsapp.net"}})))
    }

    #[tokio::test]
    async fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());

        store.save(&record("t1")).await.unwrap();
        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, "t1");
        assert_eq!(loaded.credentials, record("t1").credentials);
        assert!(tmp.path().join("t1").join("creds.json").exists());
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_and_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());

        store.save(&record("t1")).await.unwrap();
        let rotated = SessionRecord::new("t1", Credentials(json!({"rotated": true})));
        store.save(&rotated).await.unwrap();

        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.credentials, Credentials(json!({"rotated": true})));

        let mut entries = std::fs::read_dir(tmp.path().join("t1")).unwrap();
        let only = entries.next().unwrap().unwrap();
        assert_eq!(only.file_name(), "creds.json");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());

        store.save(&record("t1")).await.unwrap();
        store.delete("t1").await.unwrap();
        store.delete("t1").await.unwrap();
        assert!(store.load("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        let err = store.load("../etc").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidInstanceId(_)));
    }
}
