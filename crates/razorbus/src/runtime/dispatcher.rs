//! Processing of delivered message bodies.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::Bus;
use super::registry::Resolution;
use crate::command::{Command, CommandId};
use crate::dispatch::DispatchContext;
use crate::error::{Error, Result};
use crate::message::{Body, ExceptionRecord, Message, is_valid_class_name};
use crate::object::OperationError;
use crate::retry::update_body_with_exception;
use crate::store::{CommandStore, Delivery, MessageQueue, Store};

/// A structural defect that makes a message impossible to dispatch safely.
///
/// Violations are terminal: the message is dropped, its command (if one can
/// be resolved) is marked failed, and nothing is retried, since replaying a
/// malformed message can never succeed.
#[derive(Debug, Error)]
pub enum Violation {
    /// The body is not a structurally valid message.
    #[error("malformed message body: {0}")]
    MalformedBody(String),

    /// The class is not `Razor::Data::` followed by one capitalized identifier.
    #[error("invalid class name {0:?}")]
    InvalidClass(String),

    /// The class is well-formed but nothing is registered for it.
    #[error("class {0} is not registered")]
    UnknownClass(String),

    /// The `instance` entry does not decode as the class's primary key.
    #[error("malformed instance key: {0}")]
    MalformedInstance(String),

    /// The `command` entry is not a non-empty mapping with an integer `id`.
    #[error("malformed command reference: {0}")]
    MalformedCommand(Value),

    /// The operation is unknown, or its arguments do not match its signature.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// What processing one delivery did.
///
/// Every variant means the delivery itself is finished and can be
/// acknowledged; follow-up work, if any, has already been published.
#[derive(Debug)]
pub enum Outcome {
    /// The body was empty.
    Ignored,
    /// The operation ran successfully.
    Completed,
    /// The associated command was cancelled; nothing ran.
    Cancelled,
    /// The target no longer exists; the command was marked failed.
    NotFound,
    /// The message was structurally invalid; the command was marked failed.
    Rejected(Violation),
    /// The lookup or operation failed and a retry was scheduled.
    Retried {
        /// Retry counter of the republished message.
        retries: u32,
        /// Delay before the retry becomes deliverable.
        delay: Duration,
    },
    /// The retry ceiling was exceeded; the message moved to the dead letter store.
    DeadLettered {
        /// Retry counter of the dead-lettered message.
        retries: u32,
    },
}

impl Outcome {
    /// Returns `true` if follow-up work was published to the queue.
    pub fn is_requeued(&self) -> bool {
        matches!(self, Outcome::Retried { .. })
    }
}

impl<S> Bus<S>
where
    S: Store + CommandStore + MessageQueue,
{
    /// Process one message body as if it had just been delivered.
    ///
    /// `None`, `null` and `{}` are ignored. Every other body runs through
    /// the full dispatch protocol:
    ///
    /// 1. Validate the class name and find its registered handler
    /// 2. Resolve the command reference, if any; a dangling reference is
    ///    not an error, it only disables tracking
    /// 3. Stop if the command was cancelled
    /// 4. Look the target up by primary key; if it is gone, mark the command
    ///    failed and stop
    /// 5. Decode the operation, mark the command running, and invoke
    /// 6. On failure, republish the message with one more retry and the
    ///    error appended, after a full-jitter backoff delay
    ///
    /// # Errors
    ///
    /// Only store and queue failures are returned. Everything the message
    /// itself can cause is reported as an [`Outcome`].
    pub async fn process(&self, body: Option<Value>) -> Result<Outcome> {
        let now = OffsetDateTime::now_utc();
        let delivery = Delivery {
            id: Uuid::now_v7(),
            body,
            enqueued_at: now,
            deliver_at: now,
        };
        self.dispatch(delivery, false).await
    }

    /// Process a claimed delivery. See [`process`](Self::process).
    ///
    /// A retry or dead letter replaces the claimed queue entry in one store
    /// operation, so a redelivery of the same entry after a crash cannot
    /// schedule a second retry. If the entry is already gone, nothing is
    /// republished. Otherwise the caller acknowledges the delivery once this
    /// returns `Ok`.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<Outcome> {
        self.dispatch(delivery, true).await
    }

    async fn dispatch(&self, delivery: Delivery, claimed: bool) -> Result<Outcome> {
        let message = match Body::decode(delivery.body.clone()) {
            Body::Empty => {
                debug!(delivery_id = %delivery.id, "Ignoring empty message body");
                return Ok(Outcome::Ignored);
            }
            Body::Malformed { reason, command } => {
                return self
                    .reject(delivery.id, command.as_ref(), Violation::MalformedBody(reason))
                    .await;
            }
            Body::Message(message) => message,
        };

        if !is_valid_class_name(&message.class) {
            let violation = Violation::InvalidClass(message.class.clone());
            return self
                .reject(delivery.id, message.command.as_ref(), violation)
                .await;
        }
        let Some(entry) = self.registry.get(&message.class) else {
            let violation = Violation::UnknownClass(message.class.clone());
            return self
                .reject(delivery.id, message.command.as_ref(), violation)
                .await;
        };

        let command = match &message.command {
            None => None,
            Some(reference) => {
                let Some(id) = CommandId::from_reference(reference) else {
                    let violation = Violation::MalformedCommand(reference.clone());
                    return self.reject(delivery.id, None, violation).await;
                };
                let command = self.store.find_command(id).await?;
                if command.is_none() {
                    debug!(
                        delivery_id = %delivery.id,
                        command_id = id.get(),
                        "Command not found, processing without tracking"
                    );
                }
                command
            }
        };

        if let Some(command) = command.as_ref().filter(|c| c.is_cancelled()) {
            info!(
                delivery_id = %delivery.id,
                class = %message.class,
                message = %message.message,
                command_id = command.id.get(),
                "Command cancelled, dropping message"
            );
            return Ok(Outcome::Cancelled);
        }

        if !message.instance.as_object().is_some_and(|map| !map.is_empty()) {
            let violation =
                Violation::MalformedInstance("instance must be a non-empty mapping".into());
            return self
                .reject(delivery.id, message.command.as_ref(), violation)
                .await;
        }

        debug!(
            delivery_id = %delivery.id,
            class = %message.class,
            message = %message.message,
            retries = message.retry_count(),
            "Processing message"
        );

        let resolution = entry
            .resolve(
                message.instance.clone(),
                &message.message,
                message.arguments.clone(),
            )
            .await;

        let invocation = match resolution {
            Resolution::Ready(invocation) => invocation,
            Resolution::NotFound => {
                warn!(
                    delivery_id = %delivery.id,
                    class = %message.class,
                    instance = %message.instance,
                    command_id = ?command.as_ref().map(|c| c.id.get()),
                    "Target not found, dropping message"
                );
                if let Some(command) = &command {
                    ignore_missing(self.store.finish_command(command.id, false).await)?;
                }
                return Ok(Outcome::NotFound);
            }
            Resolution::Rejected(violation) => {
                return self
                    .reject(delivery.id, message.command.as_ref(), violation)
                    .await;
            }
            Resolution::Failed(exception) => {
                return self.retry(&delivery, claimed, &message, exception).await;
            }
        };

        let command = match command {
            Some(command) => self.begin(command).await?,
            None => None,
        };
        if let Some(command) = command.as_ref().filter(|c| c.is_cancelled()) {
            info!(
                delivery_id = %delivery.id,
                class = %message.class,
                message = %message.message,
                command_id = command.id.get(),
                "Command cancelled before invocation, dropping message"
            );
            return Ok(Outcome::Cancelled);
        }

        let ctx = DispatchContext::new(
            delivery.id,
            message.class.clone(),
            message.retry_count(),
            delivery.enqueued_at,
        );

        match invocation.invoke(command, &ctx).await {
            Ok(()) => {
                debug!(
                    delivery_id = %delivery.id,
                    class = %message.class,
                    message = %message.message,
                    "Message processed successfully"
                );
                Ok(Outcome::Completed)
            }
            Err(exception) => self.retry(&delivery, claimed, &message, exception).await,
        }
    }

    /// Mark the command running and return the snapshot to hand to the
    /// operation. `None` if the command was deleted in the meantime.
    ///
    /// When the command was no longer pending it may have changed since it
    /// was read, so the stored state is read again.
    async fn begin(&self, mut command: Command) -> Result<Option<Command>> {
        match self.store.begin_command(command.id).await {
            Ok(true) => {
                command.begin();
                Ok(Some(command))
            }
            Ok(false) => self.store.find_command(command.id).await,
            Err(Error::CommandNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn reject(
        &self,
        delivery_id: Uuid,
        reference: Option<&Value>,
        violation: Violation,
    ) -> Result<Outcome> {
        let command_id = reference.and_then(CommandId::from_reference);
        warn!(
            %delivery_id,
            error = %violation,
            command_id = ?command_id.map(CommandId::get),
            "Consistency violation, dropping message"
        );

        if let Some(id) = command_id {
            ignore_missing(self.store.finish_command(id, false).await)?;
        }
        Ok(Outcome::Rejected(violation))
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        claimed: bool,
        message: &Message,
        exception: ExceptionRecord,
    ) -> Result<Outcome> {
        let delivery_id = delivery.id;
        let error = exception.message.clone();
        let updated = update_body_with_exception(message, exception);
        let retries = updated.retry_count();
        let policy = &self.config.retry_policy;

        if policy.exhausted(retries) {
            let reason = format!("exceeded {} retries: {error}", retries - 1);
            warn!(
                %delivery_id,
                class = %updated.class,
                message = %updated.message,
                retries,
                error = %error,
                "Message exceeded max retries, moving to dead letter"
            );
            if claimed {
                let stored = self
                    .store
                    .dead_letter_delivery(delivery_id, &updated, &reason)
                    .await?;
                if stored.is_none() {
                    already_settled(delivery_id);
                }
            } else {
                self.store.dead_letter(&updated, &reason).await?;
            }
            return Ok(Outcome::DeadLettered { retries });
        }

        let delay = policy.delay_for_retry(retries);
        if claimed {
            let requeued = self.store.requeue(delivery_id, &updated, delay).await?;
            if requeued.is_none() {
                already_settled(delivery_id);
                return Ok(Outcome::Retried { retries, delay });
            }
        } else {
            self.store.publish(&updated, delay).await?;
        }
        debug!(
            %delivery_id,
            class = %updated.class,
            message = %updated.message,
            retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Message failed, will retry"
        );
        Ok(Outcome::Retried { retries, delay })
    }
}

fn already_settled(delivery_id: Uuid) {
    warn!(
        %delivery_id,
        "Delivery already settled by another worker, retry not scheduled"
    );
}

/// A command deleted while its message was in flight is treated as absent.
fn ignore_missing(result: Result<bool>) -> Result<bool> {
    match result {
        Err(Error::CommandNotFound(_)) => Ok(false),
        other => other,
    }
}
