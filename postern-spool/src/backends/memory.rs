use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    Result, SpoolError,
    message::{BlobKey, MessageId, QueuedMessage},
    store::{BlobStore, QueueStore},
};

/// Queue records held in memory, ordered by id
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    records: Arc<RwLock<BTreeMap<MessageId, QueuedMessage>>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, message: &QueuedMessage) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&message.id) {
            return Err(SpoolError::AlreadyExists(message.id.to_string()));
        }

        records.insert(message.id, message.clone());
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<QueuedMessage> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SpoolError::NotFound(id.to_string()))
    }

    async fn update(&self, message: &QueuedMessage) -> Result<()> {
        match self.records.write().get_mut(&message.id) {
            Some(record) => {
                *record = message.clone();
                Ok(())
            }
            None => Err(SpoolError::NotFound(message.id.to_string())),
        }
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SpoolError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<QueuedMessage>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn references(&self, key: &BlobKey) -> Result<usize> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|record| &record.key == key)
            .count())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<AHashMap<BlobKey, Arc<[u8]>>>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, raw: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::of(raw);
        self.blobs
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::from(raw));
        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Arc<[u8]>> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SpoolError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.blobs
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| SpoolError::NotFound(key.to_string()))
    }
}
