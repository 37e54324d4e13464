use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use postern_spool::{Job, MemoryWorkQueue, WorkQueue};

/// How a job left the in-flight set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked(u64),
    Requeued(u64, Duration),
}

/// [`MemoryWorkQueue`] that remembers every ack and requeue, in order
#[derive(Debug)]
pub struct RecordingQueue {
    inner: MemoryWorkQueue,
    settlements: Mutex<Vec<Settlement>>,
}

impl RecordingQueue {
    pub fn new(inner: MemoryWorkQueue) -> Arc<Self> {
        Arc::new(Self {
            inner,
            settlements: Mutex::default(),
        })
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    pub fn waiting(&self, topic: &str) -> usize {
        self.inner.waiting(topic)
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> postern_spool::Result<()> {
        self.inner.publish(topic, body).await
    }

    async fn consume(&self, topic: &str) -> Option<Job> {
        self.inner.consume(topic).await
    }

    async fn ack(&self, job: &Job) -> postern_spool::Result<()> {
        self.inner.ack(job).await?;
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Acked(job.id));
        Ok(())
    }

    async fn requeue(&self, job: &Job, delay: Duration) -> postern_spool::Result<()> {
        self.inner.requeue(job, delay).await?;
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Requeued(job.id, delay.min(self.max_requeue_delay())));
        Ok(())
    }

    async fn outstanding(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner.outstanding(topic).await
    }

    fn max_requeue_delay(&self) -> Duration {
        self.inner.max_requeue_delay()
    }

    fn close(&self) {
        self.inner.close();
    }
}
