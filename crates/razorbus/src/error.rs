//! Error types for razorbus.

use thiserror::Error;

use crate::command::CommandId;
use crate::object::OperationError;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in razorbus operations.
///
/// Publish-time variants are programmer errors: they surface synchronously at
/// the call site that tried to schedule malformed work. Problems discovered
/// while processing a delivered message are never returned as errors; they are
/// reported as an [`Outcome`](crate::Outcome) instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize a message, command or argument.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Migration failure while preparing the PostgreSQL schema.
    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Class name does not have the `Razor::Data::<Type>` shape.
    #[error("invalid class name: {0}")]
    InvalidClassName(String),

    /// Class was not registered with the bus.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// Class was registered more than once.
    #[error("duplicate class registration: {0}")]
    DuplicateClass(String),

    /// The class has no operation with this name.
    #[error("{class} has no operation named {operation:?}")]
    UnknownOperation {
        /// Fully-qualified class name.
        class: String,
        /// The requested operation name.
        operation: String,
    },

    /// The operation was published with the wrong number of arguments.
    #[error("{class}#{operation} takes {expected} argument(s), {actual} given")]
    ArityMismatch {
        /// Fully-qualified class name.
        class: String,
        /// The operation name.
        operation: String,
        /// Declared arity.
        expected: usize,
        /// Number of positional arguments supplied.
        actual: usize,
    },

    /// A command was passed anywhere but the leading argument position.
    #[error("command argument at position {0}; only a leading command is supported")]
    MisplacedCommand(usize),

    /// The object's primary key does not serialize to a non-empty mapping.
    #[error("invalid primary key for {class}: {reason}")]
    InvalidKey {
        /// Fully-qualified class name.
        class: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// Encoding the operation's arguments failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// No command with this id exists.
    #[error("command not found: {0}")]
    CommandNotFound(CommandId),
}

impl Error {
    /// Create an invalid key error with context.
    pub fn invalid_key(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            class: class.into(),
            reason: reason.into(),
        }
    }
}
