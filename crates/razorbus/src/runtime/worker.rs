//! Dispatch worker for claiming and processing deliveries.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::bus::Bus;
use crate::store::{CommandStore, MessageQueue, Store};

/// Worker that polls the queue for deliverable messages.
///
/// The worker runs in a loop, claiming deliveries one at a time and
/// processing them sequentially.
///
/// # Lifecycle
///
/// 1. Poll for a deliverable message at `poll_interval`
/// 2. Claim it (lease held for `lock_duration`)
/// 3. Process it; a retry replaces the claimed entry in the same step
/// 4. Acknowledge the delivery
/// 5. Drain the queue, then wait for the next tick
///
/// A delivery whose processing hits a store error is not acknowledged and
/// becomes claimable again once its lease expires.
pub(crate) struct Worker<S>
where
    S: Store + CommandStore + MessageQueue,
{
    bus: Arc<Bus<S>>,
    worker_id: String,
}

impl<S> Worker<S>
where
    S: Store + CommandStore + MessageQueue,
{
    pub(crate) fn new(bus: Arc<Bus<S>>, worker_id: String) -> Self {
        Self { bus, worker_id }
    }

    /// Run the worker until shutdown signal.
    ///
    /// When the shutdown receiver signals, the worker finishes the current
    /// delivery (if any) and exits.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.bus.config.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(worker_id = %self.worker_id, "Dispatch worker started");

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.drain(&shutdown).await {
                        error!(worker_id = %self.worker_id, error = %e, "Error processing delivery");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Dispatch worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process deliveries until the queue is empty or shutdown is requested.
    async fn drain(&self, shutdown: &watch::Receiver<bool>) -> crate::Result<()> {
        while !*shutdown.borrow() {
            if !self.process_one().await? {
                break;
            }
        }
        Ok(())
    }

    /// Try to claim and process one delivery. Returns `false` if none was
    /// available.
    async fn process_one(&self) -> crate::Result<bool> {
        let delivery = self
            .bus
            .store
            .claim(&self.worker_id, self.bus.config.lock_duration)
            .await?;

        let Some(delivery) = delivery else {
            return Ok(false);
        };

        let delivery_id = delivery.id;
        let outcome = self.bus.process_delivery(delivery).await?;
        self.bus.store.ack(delivery_id).await?;

        debug!(
            worker_id = %self.worker_id,
            %delivery_id,
            ?outcome,
            "Delivery acknowledged"
        );
        Ok(true)
    }
}
