//! Drives one delivery attempt for a job taken off the work queue.
//!
//! Every job ends in exactly one of ack or requeue:
//!
//! - delivered, discarded, or turned into a bounce → the record is deleted
//!   and the job acked
//! - a temporary failure within the queue lifetime → the record is marked
//!   deferred and the job requeued with a growing delay
//! - a permanent failure → a bounce is queued for the return path, unless
//!   the message is itself a bounce
//!
//! Records are reloaded from the queue store before anything else, so a job
//! redelivered after its record was already finished is simply acked.

use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use futures_util::FutureExt;
use postern_common::{address::Address, dns::Resolver, gate::Gate, internal};
use postern_spool::{
    Directory, Job, QueueStatus, QueuedMessage, RETURN_PATH_NULL, RETURN_PATH_TRIPLE_BOUNCE, Spool,
    Submission,
};
use postern_tracing::traced;

use crate::{
    bounce::Bounce,
    config::DeliveryConfig,
    dkim::{DkimKeyStore, StaticKeyStore},
    error::{DeliveryError, PermanentError},
    local::{LocalDelivery, Maildir},
    remote::RemoteTransaction,
    route::RouteSelector,
};

/// A job and the record it was taken for, settled exactly once
#[derive(Debug)]
struct Delivery {
    job: Job,
    record: QueuedMessage,
    raw: Option<Arc<[u8]>>,
}

#[derive(Debug)]
pub struct DeliveryController {
    config: DeliveryConfig,
    spool: Spool,
    directory: Arc<dyn Directory>,
    routes: RouteSelector,
    local: Arc<dyn LocalDelivery>,
    keys: Arc<dyn DkimKeyStore>,
    /// Remote conversations in progress
    remote: Gate,
}

impl DeliveryController {
    /// Local mail goes to maildirs under the configured path and no DKIM key
    /// is known until one is supplied with [`Self::with_key_store`]
    pub fn new(
        config: DeliveryConfig,
        spool: Spool,
        directory: Arc<dyn Directory>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let routes = RouteSelector::new(Arc::clone(&directory), resolver)
            .with_local_ips(config.local_ips.clone())
            .with_connect_timeout(config.connect_timeout());
        let local = Arc::new(Maildir::new(config.maildir_path.clone(), config.me.clone()));

        Self {
            config,
            spool,
            directory,
            routes,
            local,
            keys: Arc::new(StaticKeyStore::new()),
            remote: Gate::new(),
        }
    }

    #[must_use]
    pub fn with_local_delivery(mut self, local: Arc<dyn LocalDelivery>) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub fn with_key_store(mut self, keys: Arc<dyn DkimKeyStore>) -> Self {
        self.keys = keys;
        self
    }

    /// Count remote conversations on a shared gate
    #[must_use]
    pub fn with_remote_gate(mut self, gate: Gate) -> Self {
        self.remote = gate;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub const fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Remote conversations currently running
    #[must_use]
    pub fn remote_in_flight(&self) -> usize {
        self.remote.current()
    }

    /// Runs [`Self::process`], containing any panic. A job whose attempt
    /// panicked is neither acked nor requeued and comes back once its
    /// visibility timeout expires.
    pub async fn supervise(&self, job: Job) {
        let id = job.id;

        if let Err(panic) = AssertUnwindSafe(self.process(job)).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| String::from("unknown cause"));

            internal!(
                level = ERROR,
                "Delivery of job {id} panicked ({reason}), leaving it for redelivery"
            );
        }
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(job = job.id, attempts = job.attempts)), timing(precision = "ms"))]
    pub async fn process(&self, job: Job) {
        let snapshot = match QueuedMessage::decode(&job.body) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // The durable record, if any, is picked up again by the sweep
                internal!(level = ERROR, "Unable to decode job {}: {err}", job.id);
                self.ack(&job).await;
                return;
            }
        };

        let record = match self.spool.queue.get(&snapshot.id).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                internal!(
                    level = DEBUG,
                    "{} is no longer queued, it has already been delivered",
                    snapshot.id
                );
                self.ack(&job).await;
                return;
            }
            Err(err) => {
                internal!(level = WARN, "Unable to load {}: {err}", snapshot.id);
                let delay = self.retry_delay(&job);
                if let Err(err) = self.spool.work.requeue(&job, delay).await {
                    internal!(level = ERROR, "Unable to requeue job {}: {err}", job.id);
                }
                return;
            }
        };

        let mut delivery = Delivery {
            job,
            record,
            raw: None,
        };

        if delivery.record.status == QueueStatus::Discarding {
            internal!(level = INFO, "Discarding {}", delivery.record.id);
            delivery.record.status = QueueStatus::Ready;
            self.discard(delivery).await;
            return;
        }

        match self.spool.blobs.get(&delivery.record.key).await {
            Ok(raw) => delivery.raw = Some(raw),
            Err(err) => {
                self.fail(delivery, err.into()).await;
                return;
            }
        }

        if delivery.record.status == QueueStatus::AdminBounce {
            self.bounce(delivery, PermanentError::AdminBounce.to_string())
                .await;
            return;
        }

        delivery.record.status = QueueStatus::Ready;
        delivery.record.delivery_started_at = Some(SystemTime::now());
        if let Err(err) = self.spool.queue.update(&delivery.record).await {
            self.fail(delivery, err.into()).await;
            return;
        }

        let outcome = match self.directory.is_local_domain(&delivery.record.host).await {
            Ok(true) => self.deliver_local(&delivery).await,
            Ok(false) => {
                let Some(_permit) = self.remote.try_enter(self.config.remote_concurrency) else {
                    internal!(
                        level = DEBUG,
                        "Remote concurrency limit reached, requeueing {}",
                        delivery.record.id
                    );
                    let status = delivery.record.status;
                    self.requeue(delivery, status).await;
                    return;
                };

                self.deliver_remote(&delivery).await
            }
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(()) => self.discard(delivery).await,
            Err(err) => self.fail(delivery, err).await,
        }
    }

    async fn deliver_local(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let raw = delivery.raw.as_deref().unwrap_or_default();

        self.local
            .deliver(&delivery.record.id, &delivery.record.rcpt_to, raw)
            .await?;
        Ok(())
    }

    async fn deliver_remote(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let transaction = RemoteTransaction {
            record: &delivery.record,
            raw: delivery.raw.as_deref().unwrap_or_default(),
            me: &self.config.me,
            tls: self.config.tls,
            timeout: self.config.remote_timeout(),
            routes: &self.routes,
            keys: self.config.dkim_sign.then_some(self.keys.as_ref()),
        };

        transaction.execute().await?;
        Ok(())
    }

    /// Temporary failures are retried until the queue lifetime runs out,
    /// then bounced like permanent ones
    async fn fail(&self, mut delivery: Delivery, err: DeliveryError) {
        if err.is_permanent() {
            internal!(level = INFO, "Delivery of {} failed: {err}", delivery.record.id);
            self.bounce(delivery, err.to_string()).await;
            return;
        }

        if delivery.record.age(SystemTime::now()) >= self.config.queue_lifetime() {
            internal!(
                level = INFO,
                "Giving up on {} after {} attempts: {err}",
                delivery.record.id,
                delivery.record.delivery_failed_count + 1
            );
            self.bounce(delivery, PermanentError::Expired(err.to_string()).to_string())
                .await;
            return;
        }

        internal!(
            level = INFO,
            "Delivery of {} deferred: {err}",
            delivery.record.id
        );
        delivery.record.delivery_failed_count += 1;
        self.requeue(delivery, QueueStatus::Deferred).await;
    }

    /// Queues a bounce to the return path, then removes the original.
    /// Bounces of bounces are discarded.
    async fn bounce(&self, delivery: Delivery, error: String) {
        match delivery.record.return_path.as_str() {
            RETURN_PATH_NULL => {
                internal!(
                    level = INFO,
                    "Double bounce for {}, discarding: {error}",
                    delivery.record.id
                );
                self.discard(delivery).await;
                return;
            }
            RETURN_PATH_TRIPLE_BOUNCE => {
                internal!(level = INFO, "Triple bounce for {}, discarding", delivery.record.id);
                self.discard(delivery).await;
                return;
            }
            _ => {}
        }

        let Ok(sender) = delivery.record.return_path.parse::<Address>() else {
            internal!(
                level = WARN,
                "Unable to bounce {}, invalid return path {}, discarding",
                delivery.record.id,
                delivery.record.return_path
            );
            self.discard(delivery).await;
            return;
        };

        let raw = Bounce {
            me: &self.config.me,
            sender: &delivery.record.return_path,
            recipient: &delivery.record.rcpt_to,
            error: &error,
            raw: delivery.raw.as_deref(),
        }
        .render(Utc::now());

        let submission = Submission {
            mail_from: String::from(RETURN_PATH_NULL),
            rcpt_to: vec![sender],
            raw,
            auth_user: None,
        };

        match self.spool.submit(submission).await {
            Ok(bounce) => {
                internal!(
                    level = INFO,
                    "Bounced {} to {} as {bounce}",
                    delivery.record.id,
                    delivery.record.return_path
                );
                self.discard(delivery).await;
            }
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Unable to queue bounce for {}: {err}",
                    delivery.record.id
                );
                self.requeue(delivery, QueueStatus::AdminBounce).await;
            }
        }
    }

    /// Deletes the record and acks the job. A record that cannot be deleted
    /// is kept as discarding, so the next attempt only deletes it.
    async fn discard(&self, delivery: Delivery) {
        match self.spool.remove(&delivery.record).await {
            Ok(()) => self.ack(&delivery.job).await,
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Unable to remove {}: {err}",
                    delivery.record.id
                );
                self.requeue(delivery, QueueStatus::Discarding).await;
            }
        }
    }

    /// Persists `status` with the next attempt time and hands the job back
    /// to the work queue
    async fn requeue(&self, mut delivery: Delivery, status: QueueStatus) {
        let delay = self.retry_delay(&delivery.job);
        let record = &mut delivery.record;

        record.status = status;
        record.next_delivery_scheduled_at = next_attempt(
            SystemTime::now(),
            delay,
            record.next_delivery_scheduled_at,
        );

        if let Err(err) = self.spool.queue.update(record).await {
            internal!(level = WARN, "Unable to persist {}: {err}", record.id);
        }

        if let Err(err) = self.spool.work.requeue(&delivery.job, delay).await {
            internal!(
                level = ERROR,
                "Unable to requeue job {}: {err}",
                delivery.job.id
            );
        }
    }

    async fn ack(&self, job: &Job) {
        if let Err(err) = self.spool.work.ack(job).await {
            internal!(level = ERROR, "Unable to ack job {}: {err}", job.id);
        }
    }

    /// Grows with every attempt, capped by the work queue
    fn retry_delay(&self, job: &Job) -> Duration {
        self.config
            .retry_increment()
            .saturating_mul(job.attempts.max(1))
            .min(self.spool.work.max_requeue_delay())
    }
}

/// When the next attempt is due. Always later than `previous`, even when
/// the clock has not moved or the delay is zero.
fn next_attempt(now: SystemTime, delay: Duration, previous: SystemTime) -> SystemTime {
    let due = now + delay;
    let after_previous = previous + Duration::from_millis(1);

    due.max(after_previous)
}
