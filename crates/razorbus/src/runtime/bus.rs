//! The bus handle: publishing, worker lifecycle and dead letters.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::RuntimeConfig;
use super::registry::{BusBuilder, Registry};
use super::worker::Worker;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::object::{DataObject, class_of};
use crate::publish::{self, Argument};
use crate::store::{CommandStore, DeadLetter, DeadLetterQuery, MessageQueue, Store, UnitOfWork};

/// Asynchronous object-messaging bus.
///
/// Publishes operations against registered data types and dispatches them
/// from the queue to their [`MessageHandler`](crate::MessageHandler)s.
///
/// # Lifecycle
///
/// 1. Create with [`Bus::builder(store)`](Bus::builder)
/// 2. Register handlers with [`BusBuilder::register()`]
/// 3. Configure with [`BusBuilder::config()`]
/// 4. Build with [`BusBuilder::build()`]
/// 5. Publish from request handlers with [`Bus::publish()`]
/// 6. Dispatch with [`Bus::run()`], or one body at a time with
///    [`Bus::process()`]
///
/// The bus is cheap to clone; clones share the registry and the store.
#[derive(Clone)]
pub struct Bus<S>
where
    S: Store + CommandStore + MessageQueue,
{
    pub(super) store: S,
    pub(super) registry: Arc<Registry>,
    pub(super) config: RuntimeConfig,
    pub(super) worker_id: String,
}

impl<S> Bus<S>
where
    S: Store + CommandStore + MessageQueue,
{
    /// Create a new bus builder.
    pub fn builder(store: S) -> BusBuilder<S> {
        BusBuilder::new(store)
    }

    /// Returns the store shared by publishers and workers.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the worker identifier.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the number of registered classes.
    pub fn class_count(&self) -> usize {
        self.registry.len()
    }

    /// Schedule `operation` against `object`.
    ///
    /// The message joins the unit of work and becomes deliverable when it
    /// commits. The object is addressed by its primary key only; the worker
    /// loads it again before invoking.
    ///
    /// Pass the request's command to track it: the worker will skip the
    /// operation once the command is cancelled, mark it running before
    /// invoking, and mark it failed if the object has disappeared.
    ///
    /// # Errors
    ///
    /// Fails synchronously, without enqueuing anything, if the class is not
    /// registered, the key does not serialize to a non-empty mapping, or the
    /// operation's arguments cannot be encoded.
    pub async fn publish<U, T>(
        &self,
        uow: &mut U,
        object: &T,
        command: Option<&Command>,
        operation: T::Operation,
    ) -> Result<()>
    where
        U: UnitOfWork,
        T: DataObject,
    {
        let class = class_of::<T>();
        if self.registry.get(&class).is_none() {
            return Err(Error::UnknownClass(class));
        }

        let message = publish::typed_message(object, command, &operation)?;
        debug!(
            class = %message.class,
            message = %message.message,
            command_id = ?command.map(|c| c.id.get()),
            "Publishing message"
        );
        uow.enqueue(message).await
    }

    /// Schedule an operation from untyped parts.
    ///
    /// For bridges that only know the class and operation by name. The
    /// arguments are checked against the registered signature: the
    /// operation must exist and receive exactly its declared number of
    /// arguments, after a leading [`Argument::Command`] is lifted out.
    ///
    /// # Example
    ///
    /// ```ignore
    /// bus.publish_raw(
    ///     &mut uow,
    ///     "Razor::Data::Repo",
    ///     json!({ "name": "centos-7" }),
    ///     "make_the_repo_accessible",
    ///     vec![Argument::from(&command), json!("http://mirror/centos.iso").into()],
    /// )
    /// .await?;
    /// ```
    pub async fn publish_raw<U: UnitOfWork>(
        &self,
        uow: &mut U,
        class: &str,
        instance: Value,
        operation: &str,
        arguments: Vec<Argument>,
    ) -> Result<()> {
        publish::check_class(class)?;
        let entry = self
            .registry
            .get(class)
            .ok_or_else(|| Error::UnknownClass(class.to_owned()))?;

        let message =
            publish::raw_message(class, entry.signatures(), instance, operation, arguments)?;
        debug!(
            class = %message.class,
            message = %message.message,
            "Publishing message"
        );
        uow.enqueue(message).await
    }

    /// Run the dispatch workers until shutdown signal.
    ///
    /// The number of workers is controlled by `workers` in
    /// [`RuntimeConfig`]. Workers coordinate through the queue's leases so
    /// no delivery is processed by two workers at once.
    ///
    /// # Shutdown Behavior
    ///
    /// When the shutdown future completes:
    /// 1. All workers stop claiming new deliveries
    /// 2. Wait for current deliveries (if any) to complete
    /// 3. Return cleanly after `shutdown_timeout`
    ///
    /// # Example
    ///
    /// ```ignore
    /// use tokio::signal;
    ///
    /// // Run until Ctrl+C
    /// bus.run(async { signal::ctrl_c().await.ok(); }).await?;
    /// ```
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = self.config.workers.max(1);

        info!(
            worker_id = %self.worker_id,
            classes = self.class_count(),
            workers = worker_count,
            "Bus starting"
        );

        let bus = Arc::new(self);
        let mut worker_handles = Vec::with_capacity(worker_count);

        for i in 0..worker_count {
            let worker_id = if worker_count == 1 {
                bus.worker_id.clone()
            } else {
                format!("{}-{}", bus.worker_id, i)
            };

            let worker = Worker::new(Arc::clone(&bus), worker_id);
            let worker_shutdown_rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                worker.run(worker_shutdown_rx).await;
            }));
        }

        // Wait for shutdown signal
        shutdown.await;

        // Signal shutdown to all workers
        let _ = shutdown_tx.send(true);

        let shutdown_timeout = bus.config.shutdown_timeout;
        let all_workers = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(shutdown_timeout, all_workers).await {
            Ok(()) => {
                info!(worker_id = %bus.worker_id, "Bus stopped gracefully");
            }
            Err(_) => {
                warn!(
                    worker_id = %bus.worker_id,
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout exceeded, forcing stop"
                );
            }
        }

        Ok(())
    }

    /// Fetch dead-lettered messages.
    ///
    /// Only populated when
    /// [`RetryPolicy::max_retries`](crate::RetryPolicy::max_retries) is set.
    ///
    /// # Example
    ///
    /// ```ignore
    /// // Fetch dead letters for one command
    /// let dead_letters = bus
    ///     .fetch_dead_letters(DeadLetterQuery::new().command(command.id))
    ///     .await?;
    /// ```
    pub async fn fetch_dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        self.store.fetch_dead_letters(&query).await
    }

    /// Requeue a dead-lettered message for immediate delivery.
    ///
    /// Returns `Ok(true)` if the dead letter was found and requeued,
    /// `Ok(false)` if it was not found.
    pub async fn retry_dead_letter(&self, dead_letter_id: Uuid) -> Result<bool> {
        self.store.retry_dead_letter(dead_letter_id).await
    }
}
