use std::{sync::Arc, time::SystemTime};

use postern_common::{address::Address, internal};
use postern_tracing::traced;

use crate::{
    Result,
    backends::{MemoryBlobStore, MemoryQueueStore},
    message::{MessageId, QueueStatus, QueuedMessage},
    queue::{DELIVERY_TOPIC, MemoryWorkQueue, WorkQueue},
    store::{BlobStore, QueueStore},
};

/// A message accepted for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// The reverse path, empty for bounces
    pub mail_from: String,
    pub rcpt_to: Vec<Address>,
    pub raw: Vec<u8>,
    pub auth_user: Option<String>,
}

/// The record store, blob store and work queue used together by the SMTP
/// server and the delivery workers
#[derive(Debug, Clone)]
pub struct Spool {
    pub queue: Arc<dyn QueueStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub work: Arc<dyn WorkQueue>,
}

impl Spool {
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueueStore>,
        blobs: Arc<dyn BlobStore>,
        work: Arc<dyn WorkQueue>,
    ) -> Self {
        Self { queue, blobs, work }
    }

    /// A spool that lives entirely in memory
    #[must_use]
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryWorkQueue::default()),
        )
    }

    /// Stores the raw message once, creates one record per recipient and
    /// publishes each record to the delivery topic. Returns the id shared by
    /// the records.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(recipients = submission.rcpt_to.len())), timing(precision = "ms"))]
    pub async fn submit(&self, submission: Submission) -> Result<MessageId> {
        let key = self.blobs.put(&submission.raw).await?;
        let message_id = message_id_header(&submission.raw);
        let envelope_id = MessageId::generate();
        let now = SystemTime::now();

        for rcpt in &submission.rcpt_to {
            let record = QueuedMessage {
                id: MessageId::generate(),
                envelope_id,
                key: key.clone(),
                message_id: message_id.clone(),
                mail_from: submission.mail_from.clone(),
                return_path: submission.mail_from.clone(),
                rcpt_to: rcpt.to_string(),
                host: rcpt.domain.to_ascii_lowercase(),
                auth_user: submission.auth_user.clone(),
                status: QueueStatus::Ready,
                added_at: now,
                delivery_started_at: None,
                next_delivery_scheduled_at: now,
                delivery_failed_count: 0,
            };

            self.queue.insert(&record).await?;
            self.publish(&record).await?;
        }

        internal!(
            "Queued {envelope_id} for {} recipient(s) as {key}",
            submission.rcpt_to.len()
        );

        Ok(envelope_id)
    }

    /// Publishes a snapshot of `record` for the delivery workers
    pub async fn publish(&self, record: &QueuedMessage) -> Result<()> {
        self.work.publish(DELIVERY_TOPIC, record.encode()?).await
    }

    /// Deletes a record, and its blob once no other record refers to it.
    /// A record that is already gone is not an error.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(id = %record.id)), timing(precision = "ms"))]
    pub async fn remove(&self, record: &QueuedMessage) -> Result<()> {
        match self.queue.delete(&record.id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        if self.queue.references(&record.key).await? == 0 {
            match self.blobs.delete(&record.key).await {
                Ok(()) => internal!("Removed blob {}", record.key),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    // The record is gone, an orphaned blob only costs disk space
                    internal!(level = WARN, "Unable to remove blob {}: {err}", record.key);
                }
            }
        }

        Ok(())
    }
}

fn message_id_header(raw: &[u8]) -> String {
    mailparse::parse_headers(raw)
        .ok()
        .and_then(|(headers, _)| {
            use mailparse::MailHeaderMap;
            headers.get_first_value("Message-ID")
        })
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}
