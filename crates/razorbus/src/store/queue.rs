//! Queue transport operations for message delivery.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::command::CommandId;
use crate::message::Message;

/// A claimed message, ready for processing.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Unique identifier for this queue entry (UUID v7).
    pub id: Uuid,
    /// The message body. `None` for an empty entry.
    pub body: Option<Value>,
    /// When the entry was enqueued.
    pub enqueued_at: OffsetDateTime,
    /// Earliest time the entry may be delivered.
    pub deliver_at: OffsetDateTime,
}

/// A message that exceeded the configured retry ceiling.
///
/// Only produced when [`RetryPolicy::max_retries`](crate::RetryPolicy::max_retries)
/// is set. Dead letters stay in the store for inspection and manual retry.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Unique identifier for this dead letter.
    pub id: Uuid,
    /// The final message body, including every recorded exception.
    pub message: Message,
    /// Why the message was dead-lettered.
    pub reason: String,
    /// When the message was dead-lettered.
    pub created_at: OffsetDateTime,
}

impl DeadLetter {
    pub(crate) fn new(message: Message, reason: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            message,
            reason: reason.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Query parameters for fetching dead letters.
///
/// Use the builder methods to filter by class or command, or limit the
/// number of results.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterQuery {
    /// Filter by fully-qualified class.
    pub class: Option<String>,
    /// Filter by associated command.
    pub command: Option<CommandId>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

impl DeadLetterQuery {
    /// Create a new empty query (matches all dead letters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by fully-qualified class.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Filter by associated command.
    pub fn command(mut self, command: CommandId) -> Self {
        self.command = Some(command);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if the dead letter passes every filter.
    pub fn matches(&self, dead_letter: &DeadLetter) -> bool {
        let class_matches = self
            .class
            .as_deref()
            .is_none_or(|class| dead_letter.message.class == class);
        let command_matches = self.command.is_none_or(|command| {
            dead_letter
                .message
                .command
                .as_ref()
                .and_then(CommandId::from_reference)
                == Some(command)
        });
        class_matches && command_matches
    }
}

/// Queue transport used by publishers and dispatch workers.
///
/// # Locking Protocol
///
/// Deliveries are claimed with a lease:
/// 1. `claim` atomically selects a due entry and locks it for `lock_duration`
/// 2. `ack` removes the entry once processing is finished
/// 3. If a worker crashes or fails before acking, the lease expires and
///    another worker claims the same entry again (at-least-once delivery)
pub trait MessageQueue: Send + Sync + Clone + 'static {
    /// Enqueue a message for delivery after `delay` (`Duration::ZERO` for now).
    fn publish(
        &self,
        message: &Message,
        delay: Duration,
    ) -> impl Future<Output = crate::Result<Uuid>> + Send;

    /// Claim the next due, unlocked entry.
    ///
    /// Returns `None` if nothing is due. Entries are handed out oldest
    /// `deliver_at` first.
    ///
    /// # Arguments
    ///
    /// * `worker_id` - Identifier for this worker (for debugging)
    /// * `lock_duration` - How long to hold the lease
    fn claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> impl Future<Output = crate::Result<Option<Delivery>>> + Send;

    /// Remove a processed entry.
    fn ack(&self, delivery_id: Uuid) -> impl Future<Output = crate::Result<()>> + Send;

    /// All entries not yet acknowledged, including scheduled and leased ones,
    /// ordered by `deliver_at`.
    fn pending_messages(&self) -> impl Future<Output = crate::Result<Vec<Delivery>>> + Send;

    /// Replace a claimed entry with its retry in one atomic step.
    ///
    /// Returns the id of the new entry, or `None` if the claimed entry is
    /// gone (already acknowledged, or replaced by a worker whose lease
    /// overlapped), in which case nothing is enqueued. A crash between
    /// processing and [`ack`](Self::ack) therefore never forks a second
    /// retry chain.
    fn requeue(
        &self,
        delivery_id: Uuid,
        message: &Message,
        delay: Duration,
    ) -> impl Future<Output = crate::Result<Option<Uuid>>> + Send;

    /// Move a claimed entry to the dead letter store in one atomic step.
    ///
    /// Returns `None`, storing nothing, if the claimed entry is gone.
    fn dead_letter_delivery(
        &self,
        delivery_id: Uuid,
        message: &Message,
        reason: &str,
    ) -> impl Future<Output = crate::Result<Option<Uuid>>> + Send;

    /// Move a message to the dead letter store.
    fn dead_letter(
        &self,
        message: &Message,
        reason: &str,
    ) -> impl Future<Output = crate::Result<Uuid>> + Send;

    /// Fetch dead letters matching the query, oldest first.
    fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
    ) -> impl Future<Output = crate::Result<Vec<DeadLetter>>> + Send;

    /// Requeue a dead letter for immediate delivery.
    ///
    /// The retry counter is reset; the exception history is kept.
    ///
    /// Returns `Ok(true)` if the dead letter was found and requeued,
    /// `Ok(false)` if it was not found.
    fn retry_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> impl Future<Output = crate::Result<bool>> + Send;
}
