//! Delivery worker pool and queue reconciliation.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use ahash::AHashSet;
use postern_common::{Signal, internal};
use postern_spool::{DELIVERY_TOPIC, QueuedMessage};
use postern_tracing::traced;
use tokio::{sync::broadcast, task::JoinSet};

use crate::{controller::DeliveryController, error::DeliveryError};

/// How long in-flight deliveries may run once shutdown starts
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a pool of workers consuming the delivery topic.
///
/// ## Reconciliation
///
/// At start-up and every sweep interval, every queue record that has been due
/// for at least the sweep grace period and has no job waiting or in flight is
/// published again. This recovers records whose job was lost, either because
/// it could not be decoded or because the work queue did not survive a
/// restart. The grace period keeps a sweep from racing a submission that has
/// written its record but not yet published its job.
///
/// ## Graceful Shutdown
///
/// On a shutdown signal the work queue is closed, so idle workers stop, and
/// deliveries already running get [`SHUTDOWN_TIMEOUT`] to finish. Anything
/// cut short is retried once its record is swept after the next start.
#[derive(Debug, Clone)]
pub struct DeliveryProcessor {
    controller: Arc<DeliveryController>,
}

impl DeliveryProcessor {
    pub fn new(controller: DeliveryController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    #[must_use]
    pub const fn controller(&self) -> &Arc<DeliveryController> {
        &self.controller
    }

    /// Publishes every due record that has no outstanding job, returning how
    /// many were published
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn sweep(&self) -> Result<usize, DeliveryError> {
        let spool = self.controller.spool();

        let outstanding = spool
            .work
            .outstanding(DELIVERY_TOPIC)
            .await
            .iter()
            .filter_map(|body| QueuedMessage::decode(body).ok())
            .map(|record| record.id)
            .collect::<AHashSet<_>>();

        let cutoff = SystemTime::now()
            .checked_sub(self.controller.config().sweep_grace())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut published = 0;

        for record in spool.queue.list().await? {
            if outstanding.contains(&record.id) || record.next_delivery_scheduled_at > cutoff {
                continue;
            }

            spool.publish(&record).await?;
            published += 1;
        }

        if published > 0 {
            internal!(level = INFO, "Sweep republished {published} queued message(s)");
        }

        Ok(published)
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        let config = self.controller.config();
        let workers = config.worker_count();
        internal!("Delivery processor starting with {workers} workers");

        if let Err(err) = self.sweep().await {
            internal!(level = ERROR, "Initial sweep failed: {err}");
        }

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let controller = Arc::clone(&self.controller);
            pool.spawn(async move {
                while let Some(job) = controller.spool().work.consume(DELIVERY_TOPIC).await {
                    controller.supervise(job).await;
                }
                internal!(level = DEBUG, "Delivery worker {worker} stopped");
            });
        }

        let mut sweep_timer = tokio::time::interval(config.sweep_interval());
        // The first tick completes immediately and the sweep above covered it
        sweep_timer.tick().await;

        loop {
            tokio::select! {
                _ = sweep_timer.tick() => {
                    if let Err(err) = self.sweep().await {
                        internal!(level = ERROR, "Sweep failed: {err}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!("Delivery processor received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(err) => {
                            internal!(level = ERROR, "Delivery processor shutdown channel error: {err}");
                            break;
                        }
                    }
                }
            }
        }

        self.controller.spool().work.close();

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while pool.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            internal!(
                level = WARN,
                "Shutdown timeout exceeded, {} delivery worker(s) aborted",
                pool.len()
            );
            pool.abort_all();
        }

        internal!("Delivery processor shutdown complete");
        Ok(())
    }
}
