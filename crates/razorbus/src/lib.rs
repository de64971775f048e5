//! Durable object-messaging bus for provisioning commands.
//!
//! Razorbus lets a request handler record a [`Command`] and schedule
//! long-running, failure-prone work against persisted objects without
//! blocking the request and without losing work across restarts:
//!
//! - **Replay-safe messages**: A [`Message`] names its target by class and
//!   primary key; the target and its command are re-read on every delivery
//! - **Closed operations**: Each [`DataObject`] type accepts a fixed
//!   [`Operation`] enum, so no arbitrary method can be invoked from queue data
//! - **Unbounded retry**: Failed operations are republished with full-jitter
//!   exponential backoff until they succeed or their command is cancelled
//! - **Write-once error history**: Concurrent attempts can never overwrite
//!   each other's failure records on a command
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────┐  claim   ┌───────────────────┐
//! │ request + UoW│ ─────────▶ │ MessageQueue │ ───────▶ │ worker: process() │
//! └──────────────┘  (commit)  └──────────────┘          └─────────┬─────────┘
//!        ▲                          ▲                             │
//!        │                          │ retry after backoff         │ find + invoke
//!        │                          └─────────────────────────────┤
//!        │                                                        ▼
//!   CommandStore ◀──── begin / fail / cancel check ────── MessageHandler
//! ```
//!
//! # Example
//!
//! ```ignore
//! use razorbus::{Bus, MemoryStore, NewCommand, Store, UnitOfWork};
//!
//! let store = MemoryStore::new();
//! let bus = Bus::builder(store.clone())
//!     .register(RepoHandler::new(repos))
//!     .build()?;
//!
//! // Inside a request: create the command and schedule work atomically
//! let mut uow = store.begin().await?;
//! let command = uow.create_command(NewCommand::new("create-repo", params)).await?;
//! bus.publish(&mut uow, &repo, Some(&command), RepoOperation::UnpackImage(url))
//!     .await?;
//! uow.commit().await?;
//!
//! // In the worker process
//! bus.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: Enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

// Allow the crate to reference itself as `razorbus` for macro-generated code
extern crate self as razorbus;

mod command;
pub mod dispatch;
mod error;
pub mod message;
mod object;
mod publish;
mod retry;
pub mod runtime;
pub mod store;

pub use command::{Command, CommandId, CommandStatus, ErrorRecord, NewCommand, ParseStatusError};
pub use dispatch::{DispatchContext, MessageHandler};
pub use error::{Error, Result};
pub use message::{Body, ExceptionRecord, Message};
pub use object::{DataObject, Operation, OperationError, Signature, class_of};
pub use publish::Argument;
pub use retry::{RetryPolicy, update_body_with_exception};
pub use runtime::{Bus, BusBuilder, Outcome, RuntimeConfig, Violation};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{
    CommandStore, DeadLetter, DeadLetterQuery, Delivery, MemoryStore, MessageQueue, Store,
    UnitOfWork,
};

// Re-export derive macros
pub use razorbus_macros::Operation;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::Value;

    pub use crate::object::{ArgumentReader, encode_argument};
}
