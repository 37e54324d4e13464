//! At-least-once work queue.
//!
//! A consumed job stays in flight until it is acked or requeued. A job that is
//! neither within the visibility timeout becomes visible again and is handed
//! to the next consumer with its attempt count bumped.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::{Result, SpoolError};

/// Topic carrying queue record snapshots to the delivery workers
pub const DELIVERY_TOPIC: &str = "todeliver";

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub topic: String,
    pub body: Vec<u8>,
    /// Number of times this job has been handed out, including this one
    pub attempts: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync + Debug {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;

    /// Waits for the next visible job. Returns `None` once the queue is closed.
    async fn consume(&self, topic: &str) -> Option<Job>;

    async fn ack(&self, job: &Job) -> Result<()>;

    /// Makes the job visible again after `delay`, clamped to
    /// [`WorkQueue::max_requeue_delay`]
    async fn requeue(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Bodies of every job on `topic` that is waiting or in flight
    async fn outstanding(&self, topic: &str) -> Vec<Vec<u8>>;

    fn max_requeue_delay(&self) -> Duration;

    fn close(&self);
}

#[derive(Debug)]
struct InFlight {
    deadline: Instant,
    job: Job,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    ready: AHashMap<String, BTreeMap<(Instant, u64), Job>>,
    in_flight: AHashMap<u64, InFlight>,
    closed: bool,
}

impl State {
    /// Returns expired in-flight jobs to their topic
    fn expire(&mut self, now: Instant) {
        let expired = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.ready
                    .entry(entry.job.topic.clone())
                    .or_default()
                    .insert((now, id), entry.job);
            }
        }
    }

    fn pop(&mut self, topic: &str, now: Instant) -> Option<Job> {
        let ready = self.ready.get_mut(topic)?;
        let (&(visible_at, id), _) = ready.first_key_value()?;
        if visible_at > now {
            return None;
        }

        ready.remove(&(visible_at, id))
    }

    /// The next instant at which something may become visible on `topic`
    fn next_wakeup(&self, topic: &str) -> Option<Instant> {
        let ready = self
            .ready
            .get(topic)
            .and_then(|ready| ready.first_key_value())
            .map(|((visible_at, _), _)| *visible_at);

        let in_flight = self
            .in_flight
            .values()
            .filter(|entry| entry.job.topic == topic)
            .map(|entry| entry.deadline)
            .min();

        match (ready, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process [`WorkQueue`]
#[derive(Debug, Clone)]
pub struct MemoryWorkQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    max_requeue_delay: Duration,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), Duration::from_secs(3600))
    }
}

impl MemoryWorkQueue {
    #[must_use]
    pub fn new(visibility_timeout: Duration, max_requeue_delay: Duration) -> Self {
        Self {
            state: Arc::default(),
            notify: Arc::default(),
            visibility_timeout,
            max_requeue_delay,
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Jobs waiting on `topic`, visible or delayed
    #[must_use]
    pub fn waiting(&self, topic: &str) -> usize {
        self.state
            .lock()
            .ready
            .get(topic)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SpoolError::Closed);
            }

            state.next_id += 1;
            let id = state.next_id;
            state.ready.entry(topic.to_string()).or_default().insert(
                (Instant::now(), id),
                Job {
                    id,
                    topic: topic.to_string(),
                    body,
                    attempts: 0,
                },
            );
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, topic: &str) -> Option<Job> {
        loop {
            let notified = self.notify.notified();

            let wakeup = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }

                let now = Instant::now();
                state.expire(now);

                if let Some(mut job) = state.pop(topic, now) {
                    job.attempts += 1;
                    state.in_flight.insert(
                        job.id,
                        InFlight {
                            deadline: now + self.visibility_timeout,
                            job: job.clone(),
                        },
                    );
                    return Some(job);
                }

                state.next_wakeup(topic)
            };

            match wakeup {
                Some(at) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock();
        if state.in_flight.remove(&job.id).is_none() {
            return Err(SpoolError::NotFound(format!("job {}", job.id)));
        }

        Ok(())
    }

    async fn requeue(&self, job: &Job, delay: Duration) -> Result<()> {
        let delay = delay.min(self.max_requeue_delay);

        {
            let mut state = self.state.lock();
            let Some(entry) = state.in_flight.remove(&job.id) else {
                return Err(SpoolError::NotFound(format!("job {}", job.id)));
            };

            state
                .ready
                .entry(entry.job.topic.clone())
                .or_default()
                .insert((Instant::now() + delay, job.id), entry.job);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn outstanding(&self, topic: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock();

        state
            .ready
            .get(topic)
            .into_iter()
            .flat_map(BTreeMap::values)
            .chain(
                state
                    .in_flight
                    .values()
                    .map(|entry| &entry.job)
                    .filter(|job| job.topic == topic),
            )
            .map(|job| job.body.clone())
            .collect()
    }

    fn max_requeue_delay(&self) -> Duration {
        self.max_requeue_delay
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}
