use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    DirectoryResult,
    backends::{FileBlobStore, FileQueueStore, MemoryBlobStore, MemoryQueueStore},
    directory::{DirectoryData, MemoryDirectory},
    queue::MemoryWorkQueue,
    spool::Spool,
};

/// Where queue records and message blobs are kept
///
/// ```ron
/// spool: (
///     store: (type: "File", path: "/var/spool/postern"),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// Records under `path/queue`, blobs under `path/blobs`
    File { path: PathBuf },
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/spool/postern"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpoolConfig {
    #[serde(default)]
    pub store: StoreConfig,

    /// How long a consumed job may stay unacknowledged before it is handed
    /// out again
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_max_requeue_delay")]
    pub max_requeue_delay_secs: u64,
}

const fn default_visibility_timeout() -> u64 {
    600
}

const fn default_max_requeue_delay() -> u64 {
    3600
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_requeue_delay_secs: default_max_requeue_delay(),
        }
    }
}

impl SpoolConfig {
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// The records directory of a file-backed store
    #[must_use]
    pub fn queue_path(&self) -> Option<PathBuf> {
        match &self.store {
            StoreConfig::File { path } => Some(path.join("queue")),
            StoreConfig::Memory => None,
        }
    }

    /// Opens the configured stores
    pub fn into_spool(self) -> crate::Result<Spool> {
        let work = Arc::new(MemoryWorkQueue::new(
            Duration::from_secs(self.visibility_timeout_secs),
            Duration::from_secs(self.max_requeue_delay_secs),
        ));

        Ok(match self.store {
            StoreConfig::File { path } => Spool::new(
                Arc::new(FileQueueStore::open(path.join("queue"))?),
                Arc::new(FileBlobStore::open(path.join("blobs"))?),
                work,
            ),
            StoreConfig::Memory => Spool::new(
                Arc::new(MemoryQueueStore::new()),
                Arc::new(MemoryBlobStore::new()),
                work,
            ),
        })
    }
}

/// Location of the directory file. Without one the directory starts empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DirectoryConfig {
    pub fn load(&self) -> DirectoryResult<MemoryDirectory> {
        self.path.as_ref().map_or_else(
            || Ok(MemoryDirectory::new(DirectoryData::default())),
            MemoryDirectory::load,
        )
    }
}
