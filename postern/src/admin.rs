//! Operator commands.
//!
//! These work directly on the configured files, so they can be used whether
//! or not a server is running. A running server picks up a queue mark on the
//! record's next delivery attempt.

use std::{net::IpAddr, time::SystemTime};

use anyhow::Context as _;
use postern_spool::{
    Directory, DirectoryConfig, FileQueueStore, MemoryDirectory, MessageId, QueueStatus,
    QueueStore, QueuedMessage, SpoolConfig,
};

#[derive(Debug, Clone)]
pub struct Admin {
    directory: DirectoryConfig,
    spool: SpoolConfig,
}

impl Admin {
    #[must_use]
    pub const fn new(directory: DirectoryConfig, spool: SpoolConfig) -> Self {
        Self { directory, spool }
    }

    fn directory(&self) -> anyhow::Result<MemoryDirectory> {
        let Some(path) = &self.directory.path else {
            anyhow::bail!("relay-ip commands need a directory file, set `directory.path`");
        };

        MemoryDirectory::load(path)
            .with_context(|| format!("Unable to load directory {}", path.display()))
    }

    fn queue(&self) -> anyhow::Result<FileQueueStore> {
        let Some(path) = self.spool.queue_path() else {
            anyhow::bail!("queue commands need a file-backed spool");
        };

        Ok(FileQueueStore::open(path)?)
    }

    /// Allows relaying for `ip` and rewrites the directory file
    pub async fn add_relay_ip(&self, ip: &str) -> anyhow::Result<()> {
        Ok(self.directory()?.add_relay_ip(ip).await?)
    }

    pub async fn remove_relay_ip(&self, ip: &str) -> anyhow::Result<()> {
        Ok(self.directory()?.remove_relay_ip(ip).await?)
    }

    pub async fn relay_ips(&self) -> anyhow::Result<Vec<IpAddr>> {
        let mut ips = self.directory()?.relay_ips().await?;
        ips.sort_unstable();
        Ok(ips)
    }

    /// Every queue record, oldest first
    pub async fn queued(&self) -> anyhow::Result<Vec<QueuedMessage>> {
        let mut records = self.queue()?.list().await?;
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    /// Marks a record to be removed without delivery
    pub async fn discard(&self, id: &str) -> anyhow::Result<QueuedMessage> {
        self.mark(id, QueueStatus::Discarding).await
    }

    /// Marks a record to be bounced to its sender
    pub async fn bounce(&self, id: &str) -> anyhow::Result<QueuedMessage> {
        self.mark(id, QueueStatus::AdminBounce).await
    }

    async fn mark(&self, id: &str, status: QueueStatus) -> anyhow::Result<QueuedMessage> {
        let id = id
            .parse::<MessageId>()
            .map_err(|_| anyhow::anyhow!("{id} is not a valid message id"))?;

        let queue = self.queue()?;
        let mut record = queue.get(&id).await?;
        record.status = status;
        // Due now, so the next sweep hands it to a worker
        record.next_delivery_scheduled_at = SystemTime::now();
        queue.update(&record).await?;

        Ok(record)
    }
}
