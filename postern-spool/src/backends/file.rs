//! File-backed queue records and blobs.
//!
//! Records are stored as `{id}.bin` (bincode) and blobs as `{key}.eml`. Every
//! write goes to a `.tmp_` file first and is renamed into place, so a crash
//! never leaves a partially written file under its final name.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use postern_common::internal;
use postern_tracing::traced;
use tokio::fs;

use crate::{
    Result, SpoolError,
    message::{BlobKey, MessageId, QueuedMessage},
    store::{BlobStore, QueueStore},
};

fn not_found(err: std::io::Error, what: impl ToString) -> SpoolError {
    if err.kind() == ErrorKind::NotFound {
        SpoolError::NotFound(what.to_string())
    } else {
        SpoolError::Io(err)
    }
}

/// Creates `path` if needed and removes temporary files left by a crash
fn prepare(path: &Path) -> Result<()> {
    if !path.try_exists()? {
        internal!("{} does not exist, creating...", path.display());
        std::fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(SpoolError::Io(std::io::Error::new(
            ErrorKind::NotADirectory,
            format!("Expected {} to be a directory", path.display()),
        )));
    }

    let mut cleaned = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(".tmp_") {
            std::fs::remove_file(entry.path())?;
            cleaned += 1;
        }
    }

    if cleaned > 0 {
        internal!(level = INFO, "Removed {cleaned} incomplete writes from {}", path.display());
    }

    Ok(())
}

async fn write_atomically(dir: &Path, name: &str, contents: &[u8]) -> Result<()> {
    let temp = dir.join(format!(".tmp_{name}"));
    fs::write(&temp, contents).await?;
    fs::rename(&temp, dir.join(name)).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        prepare(&path)?;
        Ok(Self { path })
    }

    fn record_path(&self, id: &MessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    async fn read_record(path: &Path, id: &MessageId) -> Result<QueuedMessage> {
        let bytes = fs::read(path).await.map_err(|err| not_found(err, id))?;
        QueuedMessage::decode(&bytes)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, message), fields(id = %message.id)), timing(precision = "ms"))]
    async fn insert(&self, message: &QueuedMessage) -> Result<()> {
        if fs::try_exists(self.record_path(&message.id)).await? {
            return Err(SpoolError::AlreadyExists(message.id.to_string()));
        }

        write_atomically(&self.path, &format!("{}.bin", message.id), &message.encode()?).await
    }

    async fn get(&self, id: &MessageId) -> Result<QueuedMessage> {
        Self::read_record(&self.record_path(id), id).await
    }

    async fn update(&self, message: &QueuedMessage) -> Result<()> {
        if !fs::try_exists(self.record_path(&message.id)).await? {
            return Err(SpoolError::NotFound(message.id.to_string()));
        }

        write_atomically(&self.path, &format!("{}.bin", message.id), &message.encode()?).await
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %id)), timing(precision = "ms"))]
    async fn delete(&self, id: &MessageId) -> Result<()> {
        fs::remove_file(self.record_path(id))
            .await
            .map_err(|err| not_found(err, id))
    }

    async fn list(&self) -> Result<Vec<QueuedMessage>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut records = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let Some(id) = name
                .strip_suffix(".bin")
                .filter(|_| !name.starts_with(".tmp_"))
                .and_then(|stem| stem.parse::<MessageId>().ok())
            else {
                continue;
            };

            match Self::read_record(&entry.path(), &id).await {
                Ok(record) => records.push(record),
                // Deleted between listing and reading
                Err(SpoolError::NotFound(_)) => {}
                Err(err) => {
                    internal!(level = WARN, "Skipping unreadable record {id}: {err}");
                }
            }
        }

        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn references(&self, key: &BlobKey) -> Result<usize> {
        Ok(self
            .list()
            .await?
            .iter()
            .filter(|record| &record.key == key)
            .count())
    }
}

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        prepare(&path)?;
        Ok(Self { path })
    }

    fn blob_path(&self, key: &BlobKey) -> PathBuf {
        self.path.join(format!("{key}.eml"))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    async fn put(&self, raw: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::of(raw);

        if !fs::try_exists(self.blob_path(&key)).await? {
            write_atomically(&self.path, &format!("{key}.eml"), raw).await?;
        }

        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Arc<[u8]>> {
        fs::read(self.blob_path(key))
            .await
            .map(Arc::from)
            .map_err(|err| not_found(err, key))
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        fs::remove_file(self.blob_path(key))
            .await
            .map_err(|err| not_found(err, key))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::QueueStatus;

    fn record(key: &BlobKey) -> QueuedMessage {
        let now = SystemTime::now();
        QueuedMessage {
            id: MessageId::generate(),
            envelope_id: MessageId::generate(),
            key: key.clone(),
            message_id: String::from("<id@x.com>"),
            mail_from: String::from("a@x.com"),
            return_path: String::from("a@x.com"),
            rcpt_to: String::from("b@y.com"),
            host: String::from("y.com"),
            auth_user: Some(String::from("alice")),
            status: QueueStatus::Ready,
            added_at: now,
            delivery_started_at: None,
            next_delivery_scheduled_at: now,
            delivery_failed_count: 0,
        }
    }

    #[tokio::test]
    async fn records_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let key = BlobKey::of(b"raw");
        let message = record(&key);

        {
            let store = FileQueueStore::open(dir.path()).unwrap();
            store.insert(&message).await.unwrap();
        }

        let store = FileQueueStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&message.id).await.unwrap(), message);
        assert_eq!(store.list().await.unwrap(), vec![message.clone()]);
        assert_eq!(store.references(&key).await.unwrap(), 1);

        store.delete(&message.id).await.unwrap();
        assert!(store.get(&message.id).await.unwrap_err().is_not_found());
        assert!(store.delete(&message.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::open(dir.path()).unwrap();
        let mut message = record(&BlobKey::of(b"raw"));

        assert!(store.update(&message).await.unwrap_err().is_not_found());

        store.insert(&message).await.unwrap();
        message.status = QueueStatus::AdminBounce;
        store.update(&message).await.unwrap();

        assert_eq!(
            store.get(&message.id).await.unwrap().status,
            QueueStatus::AdminBounce
        );
    }

    #[tokio::test]
    async fn leftover_temporary_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".tmp_partial.bin"), b"partial").unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), b"ignored").unwrap();

        let store = FileQueueStore::open(dir.path()).unwrap();

        assert!(!dir.path().join(".tmp_partial.bin").exists());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blobs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).unwrap();

        let key = store.put(b"Subject: hi\r\n\r\nbody\r\n").await.unwrap();
        assert_eq!(store.put(b"Subject: hi\r\n\r\nbody\r\n").await.unwrap(), key);
        assert_eq!(&*store.get(&key).await.unwrap(), b"Subject: hi\r\n\r\nbody\r\n");

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }
}
