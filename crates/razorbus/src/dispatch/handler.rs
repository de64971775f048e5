//! Handler trait for running operations against persisted objects.

use async_trait::async_trait;

use super::context::DispatchContext;
use crate::{Command, DataObject};

/// Looks up and operates on one [`DataObject`] type.
///
/// Register one handler per data type with
/// [`BusBuilder::register`](crate::BusBuilder::register). The handler is the
/// only place that touches the domain store: the bus hands it primary keys
/// and decoded operations, never cached objects.
///
/// # Results
///
/// | Method | Result | Meaning |
/// |--------|--------|---------|
/// | `find` | `Ok(Some(obj))` | Target exists, invoke the operation |
/// | `find` | `Ok(None)` | Target was deleted; message dropped, command failed |
/// | `find` | `Err(_)` | Lookup failed; retried with backoff |
/// | `invoke` | `Ok(())` | Done; message dropped |
/// | `invoke` | `Err(_)` | Retried with backoff, indefinitely unless cancelled |
///
/// # Command Completion
///
/// The bus marks a command `running` before invoking and `failed` when the
/// target has disappeared, but never marks it `finished`, and does not mark
/// it `failed` when an operation errors. Only the operation knows when its job
/// is done or hopeless; it should call
/// [`CommandStore::finish_command`](crate::CommandStore::finish_command)
/// itself.
///
/// # Idempotency
///
/// Delivery is **at-least-once** and unbounded. An operation may run again
/// after a crash, a lock expiry or any earlier failure, so it must be
/// idempotent or check current state before acting.
///
/// # Example
///
/// ```ignore
/// struct RepoHandler {
///     db: RepoDb,
///     commands: PgStore,
/// }
///
/// #[async_trait]
/// impl MessageHandler for RepoHandler {
///     type Object = Repo;
///     type Error = anyhow::Error;
///
///     async fn find(&self, key: &RepoKey) -> Result<Option<Repo>, Self::Error> {
///         self.db.find_repo(&key.name).await
///     }
///
///     async fn invoke(
///         &self,
///         repo: Repo,
///         command: Option<Command>,
///         operation: RepoOperation,
///         _ctx: &DispatchContext,
///     ) -> Result<(), Self::Error> {
///         match operation {
///             RepoOperation::UnpackImage(url) => {
///                 repo.unpack(&url).await?;
///                 if let Some(command) = command {
///                     self.commands.finish_command(command.id, true).await?;
///                 }
///                 Ok(())
///             }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// The data type this handler serves.
    type Object: DataObject;

    /// The error type returned by this handler.
    ///
    /// Its display string and cause chain become the exception record of the
    /// retried message. Common choices: `anyhow::Error` or a `thiserror` enum.
    type Error: Into<anyhow::Error> + Send + 'static;

    /// Load the current state of the object with this primary key.
    async fn find(
        &self,
        key: &<Self::Object as DataObject>::Key,
    ) -> Result<Option<Self::Object>, Self::Error>;

    /// Run one operation against a freshly loaded object.
    ///
    /// # Arguments
    ///
    /// * `object` - The target, as returned by [`find`](Self::find) for this delivery
    /// * `command` - The associated command, re-read for this delivery, if one was
    ///   published with the operation and still exists
    /// * `operation` - The decoded operation with its arguments
    /// * `ctx` - Delivery metadata
    async fn invoke(
        &self,
        object: Self::Object,
        command: Option<Command>,
        operation: <Self::Object as DataObject>::Operation,
        ctx: &DispatchContext,
    ) -> Result<(), Self::Error>;
}
