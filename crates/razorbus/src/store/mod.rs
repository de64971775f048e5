//! Storage abstraction for commands and queued messages.
//!
//! This module provides the [`Store`], [`UnitOfWork`], [`CommandStore`] and
//! [`MessageQueue`] traits that abstract over storage backends. Two
//! implementations are provided:
//!
//! - [`MemoryStore`]: In-process storage for tests and single-node tools
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod queue;

use std::future::Future;

pub use memory::{MemoryStore, MemoryUnitOfWork};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgUnitOfWork};
pub use queue::{DeadLetter, DeadLetterQuery, Delivery, MessageQueue};

use crate::command::{Command, CommandId, ErrorRecord, NewCommand};
use crate::error::Result;
use crate::message::Message;

/// Transactional entry point for request handlers.
///
/// A request creates its [`Command`], changes domain state and publishes
/// follow-up work inside one unit of work, so either all of it becomes
/// visible or none of it does.
pub trait Store: Send + Sync + Clone + 'static {
    /// The unit of work type returned by this store.
    type UnitOfWork<'a>: UnitOfWork + Send
    where
        Self: 'a;

    /// Begin a unit of work.
    fn begin(&self) -> impl Future<Output = Result<Self::UnitOfWork<'_>>> + Send;
}

/// A transactional unit of work.
///
/// Changes are only persisted when [`commit`](Self::commit) is called;
/// dropping the unit of work without committing discards them. Messages
/// enqueued here are not deliverable before commit.
pub trait UnitOfWork: Send {
    /// Allocate a new command in the `pending` state.
    fn create_command(
        &mut self,
        command: NewCommand,
    ) -> impl Future<Output = Result<Command>> + Send;

    /// Queue a message for immediate delivery once committed.
    fn enqueue(&mut self, message: Message) -> impl Future<Output = Result<()>> + Send;

    /// Commit the unit of work, persisting commands and releasing messages.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Atomic command lifecycle operations.
///
/// Every transition is applied against the current stored row, never a
/// caller's snapshot. Transitions return `Ok(true)` if they changed anything
/// and `Ok(false)` if they were a no-op; a missing command is
/// [`Error::CommandNotFound`](crate::Error::CommandNotFound).
pub trait CommandStore: Send + Sync + Clone + 'static {
    /// Read the current state of a command.
    fn find_command(
        &self,
        id: CommandId,
    ) -> impl Future<Output = Result<Option<Command>>> + Send;

    /// Cancel a pending or running command.
    ///
    /// Queued and in-flight messages referencing it stop at their next
    /// delivery.
    fn cancel_command(&self, id: CommandId) -> impl Future<Output = Result<bool>> + Send;

    /// Mark a pending command as running.
    fn begin_command(&self, id: CommandId) -> impl Future<Output = Result<bool>> + Send;

    /// Record the final outcome; a no-op once terminal.
    fn finish_command(
        &self,
        id: CommandId,
        success: bool,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Record a failure in the command's error history.
    ///
    /// With `attempt`, writes that slot only if it is empty. Without it,
    /// appends after the highest populated slot.
    fn add_command_exception(
        &self,
        id: CommandId,
        record: ErrorRecord,
        attempt: Option<u32>,
    ) -> impl Future<Output = Result<bool>> + Send;
}
