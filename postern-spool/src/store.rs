use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::{
    Result,
    message::{BlobKey, MessageId, QueuedMessage},
};

/// Durable storage for queue records
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    async fn insert(&self, message: &QueuedMessage) -> Result<()>;

    /// Fails with [`crate::SpoolError::NotFound`] when the record is gone
    async fn get(&self, id: &MessageId) -> Result<QueuedMessage>;

    /// Replaces an existing record
    async fn update(&self, message: &QueuedMessage) -> Result<()>;

    async fn delete(&self, id: &MessageId) -> Result<()>;

    /// Every record, oldest first
    async fn list(&self) -> Result<Vec<QueuedMessage>>;

    /// How many records still point at `key`
    async fn references(&self, key: &BlobKey) -> Result<usize>;
}

/// Content-addressed storage for raw messages
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    /// Stores `raw` under its content hash. Storing the same bytes twice is
    /// not an error.
    async fn put(&self, raw: &[u8]) -> Result<BlobKey>;

    async fn get(&self, key: &BlobKey) -> Result<Arc<[u8]>>;

    async fn delete(&self, key: &BlobKey) -> Result<()>;
}
