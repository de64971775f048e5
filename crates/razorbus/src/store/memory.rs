//! In-process store implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::queue::{DeadLetter, DeadLetterQuery, Delivery, MessageQueue};
use super::{CommandStore, Store, UnitOfWork};
use crate::command::{Command, CommandId, ErrorRecord, NewCommand};
use crate::error::{Error, Result};
use crate::message::Message;

/// In-process store for tests and single-node tooling.
///
/// Commands, queued messages and dead letters live behind async mutexes and
/// are lost when the last clone is dropped. Clones share state, so one
/// instance can serve as the bus's store, command store and queue at once.
///
/// Leases behave like the PostgreSQL backend: a claimed entry is invisible to
/// other workers until it is acknowledged or its lock expires.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_command_id: AtomicI64,
    commands: Mutex<BTreeMap<CommandId, Command>>,
    queue: Mutex<Vec<QueueEntry>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

#[derive(Debug)]
struct QueueEntry {
    delivery: Delivery,
    locked_until: Option<OffsetDateTime>,
}

impl QueueEntry {
    fn new(body: Option<serde_json::Value>, delay: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            delivery: Delivery {
                id: Uuid::now_v7(),
                body,
                enqueued_at: now,
                deliver_at: now + delay,
            },
            locked_until: None,
        }
    }

    fn is_claimable(&self, now: OffsetDateTime) -> bool {
        self.delivery.deliver_at <= now && self.locked_until.is_none_or(|until| until < now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body, bypassing message encoding.
    ///
    /// Lets tests and bridges feed bodies that are empty or malformed.
    pub async fn publish_body(&self, body: Option<serde_json::Value>) -> Uuid {
        let entry = QueueEntry::new(body, Duration::ZERO);
        let id = entry.delivery.id;
        self.inner.queue.lock().await.push(entry);
        id
    }

    /// Apply a transition to a stored command under the lock.
    async fn update_command(
        &self,
        id: CommandId,
        apply: impl FnOnce(&mut Command) -> bool + Send,
    ) -> Result<bool> {
        let mut commands = self.inner.commands.lock().await;
        let command = commands.get_mut(&id).ok_or(Error::CommandNotFound(id))?;
        Ok(apply(command))
    }

    fn next_command_id(&self) -> CommandId {
        CommandId::new(self.inner.last_command_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Store for MemoryStore {
    type UnitOfWork<'a> = MemoryUnitOfWork<'a>;

    async fn begin(&self) -> Result<Self::UnitOfWork<'_>> {
        Ok(MemoryUnitOfWork {
            store: self,
            commands: Vec::new(),
            messages: Vec::new(),
        })
    }
}

/// In-process unit of work.
///
/// Buffers new commands and messages until commit. Command ids are allocated
/// eagerly, so a rolled-back unit of work leaves a gap in the sequence, as a
/// database sequence would.
pub struct MemoryUnitOfWork<'a> {
    store: &'a MemoryStore,
    commands: Vec<Command>,
    messages: Vec<Message>,
}

impl UnitOfWork for MemoryUnitOfWork<'_> {
    async fn create_command(&mut self, command: NewCommand) -> Result<Command> {
        let command = Command::create(
            self.store.next_command_id(),
            command,
            OffsetDateTime::now_utc(),
        );
        self.commands.push(command.clone());
        Ok(command)
    }

    async fn enqueue(&mut self, message: Message) -> Result<()> {
        self.messages.push(message);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let entries = self
            .messages
            .iter()
            .map(|message| -> Result<QueueEntry> {
                Ok(QueueEntry::new(
                    Some(serde_json::to_value(message)?),
                    Duration::ZERO,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        // Hold both locks so readers never see a command without its messages.
        let mut commands = self.store.inner.commands.lock().await;
        let mut queue = self.store.inner.queue.lock().await;
        commands.extend(self.commands.into_iter().map(|c| (c.id, c)));
        queue.extend(entries);
        Ok(())
    }
}

impl CommandStore for MemoryStore {
    async fn find_command(&self, id: CommandId) -> Result<Option<Command>> {
        Ok(self.inner.commands.lock().await.get(&id).cloned())
    }

    async fn cancel_command(&self, id: CommandId) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        self.update_command(id, |command| command.cancel(now)).await
    }

    async fn begin_command(&self, id: CommandId) -> Result<bool> {
        self.update_command(id, Command::begin).await
    }

    async fn finish_command(&self, id: CommandId, success: bool) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        self.update_command(id, |command| command.finish(success, now))
            .await
    }

    async fn add_command_exception(
        &self,
        id: CommandId,
        record: ErrorRecord,
        attempt: Option<u32>,
    ) -> Result<bool> {
        self.update_command(id, |command| command.add_exception(record, attempt))
            .await
    }
}

impl MessageQueue for MemoryStore {
    async fn publish(&self, message: &Message, delay: Duration) -> Result<Uuid> {
        let entry = QueueEntry::new(Some(serde_json::to_value(message)?), delay);
        let id = entry.delivery.id;
        self.inner.queue.lock().await.push(entry);
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<Delivery>> {
        let now = OffsetDateTime::now_utc();
        let mut queue = self.inner.queue.lock().await;

        let Some(entry) = queue
            .iter_mut()
            .filter(|entry| entry.is_claimable(now))
            .min_by_key(|entry| entry.delivery.deliver_at)
        else {
            return Ok(None);
        };

        entry.locked_until = Some(now + lock_duration);
        tracing::trace!(worker_id, delivery_id = %entry.delivery.id, "claimed delivery");
        Ok(Some(entry.delivery.clone()))
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<()> {
        self.inner
            .queue
            .lock()
            .await
            .retain(|entry| entry.delivery.id != delivery_id);
        Ok(())
    }

    async fn pending_messages(&self) -> Result<Vec<Delivery>> {
        let mut pending: Vec<_> = self
            .inner
            .queue
            .lock()
            .await
            .iter()
            .map(|entry| entry.delivery.clone())
            .collect();
        pending.sort_by_key(|delivery| delivery.deliver_at);
        Ok(pending)
    }

    async fn requeue(
        &self,
        delivery_id: Uuid,
        message: &Message,
        delay: Duration,
    ) -> Result<Option<Uuid>> {
        let entry = QueueEntry::new(Some(serde_json::to_value(message)?), delay);
        let mut queue = self.inner.queue.lock().await;
        let Some(index) = queue.iter().position(|e| e.delivery.id == delivery_id) else {
            return Ok(None);
        };

        queue.remove(index);
        let id = entry.delivery.id;
        queue.push(entry);
        Ok(Some(id))
    }

    async fn dead_letter_delivery(
        &self,
        delivery_id: Uuid,
        message: &Message,
        reason: &str,
    ) -> Result<Option<Uuid>> {
        // Queue before dead letters, the same order everywhere both are held.
        let mut queue = self.inner.queue.lock().await;
        let Some(index) = queue.iter().position(|e| e.delivery.id == delivery_id) else {
            return Ok(None);
        };

        let dead_letter = DeadLetter::new(message.clone(), reason);
        let id = dead_letter.id;
        self.inner.dead_letters.lock().await.push(dead_letter);
        queue.remove(index);
        Ok(Some(id))
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<Uuid> {
        let dead_letter = DeadLetter::new(message.clone(), reason);
        let id = dead_letter.id;
        self.inner.dead_letters.lock().await.push(dead_letter);
        Ok(id)
    }

    async fn fetch_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let limit = query.limit.unwrap_or(100) as usize;
        Ok(self
            .inner
            .dead_letters
            .lock()
            .await
            .iter()
            .filter(|dead_letter| query.matches(dead_letter))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retry_dead_letter(&self, dead_letter_id: Uuid) -> Result<bool> {
        let dead_letter = {
            let mut dead_letters = self.inner.dead_letters.lock().await;
            let Some(index) = dead_letters.iter().position(|d| d.id == dead_letter_id) else {
                return Ok(false);
            };
            dead_letters.remove(index)
        };

        let mut message = dead_letter.message;
        message.retries = None;
        self.publish(&message, Duration::ZERO).await?;
        Ok(true)
    }
}
