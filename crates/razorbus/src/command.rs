//! The persisted record of a requested action and its outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::message::ExceptionRecord;

/// Primary key of a [`Command`].
///
/// On the wire a command is referenced by the mapping `{"id": <n>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(i64);

impl CommandId {
    /// Wrap a raw primary key.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw primary key.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The primary-key mapping stored in a message's `command` field.
    pub fn to_reference(self) -> Value {
        serde_json::json!({ "id": self.0 })
    }

    /// Parse a primary-key mapping.
    ///
    /// Returns `None` unless `reference` is a non-empty object whose `id`
    /// entry is an integer.
    pub fn from_reference(reference: &Value) -> Option<Self> {
        let map = reference.as_object().filter(|map| !map.is_empty())?;
        map.get("id").and_then(Value::as_i64).map(Self)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for CommandId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a [`Command`].
///
/// Moves only `Pending -> Running -> {Finished, Failed}`, or
/// `{Pending, Running} -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl CommandStatus {
    /// Stable lowercase name, as stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Finished => "finished",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    /// Returns `true` once no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Finished | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command status: {0:?}")]
pub struct ParseStatusError(String);

impl FromStr for CommandStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "running" => Ok(CommandStatus::Running),
            "finished" => Ok(CommandStatus::Finished),
            "failed" => Ok(CommandStatus::Failed),
            "cancelled" => Ok(CommandStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A failure recorded against one attempt of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error type name.
    pub exception: String,
    /// Display message.
    pub message: String,
    /// Cause chain, outermost first.
    #[serde(default)]
    pub backtrace: Vec<String>,
    /// When the failing attempt was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
}

impl ErrorRecord {
    /// Stamp a message-level exception record with an attempt time.
    pub fn from_exception(exception: ExceptionRecord, attempted_at: OffsetDateTime) -> Self {
        Self {
            exception: exception.exception,
            message: exception.message,
            backtrace: exception.backtrace,
            attempted_at,
        }
    }
}

/// Input for creating a command.
///
/// # Example
///
/// ```
/// use razorbus::NewCommand;
///
/// let new = NewCommand::new("create-repo", serde_json::json!({ "name": "centos-7" }))
///     .submitted_by("admin");
/// assert_eq!(new.command, "create-repo");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    /// Name of the requested action.
    pub command: String,
    /// Immutable input parameters.
    pub params: Value,
    /// Principal that submitted the command, if authenticated.
    pub submitted_by: Option<String>,
}

impl NewCommand {
    /// Describe a command with no principal attached.
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self {
            command: command.into(),
            params,
            submitted_by: None,
        }
    }

    /// Attach the submitting principal.
    pub fn submitted_by(mut self, principal: impl Into<String>) -> Self {
        self.submitted_by = Some(principal.into());
        self
    }
}

/// Persisted record of one requested action and its eventual outcome.
///
/// The transition methods are pure; they report whether anything changed so
/// stores can apply them atomically and skip no-op writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    /// Failure records keyed by attempt number. Each slot is written once.
    #[serde(default)]
    pub error: BTreeMap<u32, ErrorRecord>,
    pub submitted_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Command {
    /// Materialize a freshly allocated command in the `Pending` state.
    pub fn create(id: CommandId, new: NewCommand, now: OffsetDateTime) -> Self {
        Self {
            id,
            command: new.command,
            params: new.params,
            status: CommandStatus::Pending,
            error: BTreeMap::new(),
            submitted_by: new.submitted_by,
            submitted_at: now,
            finished_at: None,
        }
    }

    /// The primary-key mapping stored in a message's `command` field.
    pub fn reference(&self) -> Value {
        self.id.to_reference()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CommandStatus::Cancelled
    }

    /// Cancel a pending or running command.
    ///
    /// Returns `false` (and changes nothing) once the command is terminal.
    pub fn cancel(&mut self, now: OffsetDateTime) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = CommandStatus::Cancelled;
        self.finished_at = Some(now);
        true
    }

    /// Mark a pending command as running.
    pub fn begin(&mut self) -> bool {
        if self.status != CommandStatus::Pending {
            return false;
        }
        self.status = CommandStatus::Running;
        true
    }

    /// Record the final outcome. Idempotent once terminal.
    pub fn finish(&mut self, success: bool, now: OffsetDateTime) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = if success {
            CommandStatus::Finished
        } else {
            CommandStatus::Failed
        };
        self.finished_at = Some(now);
        true
    }

    /// Record a failure.
    ///
    /// With `attempt`, the slot is written only if it is still empty, so
    /// concurrent or replayed completions of the same attempt keep the first
    /// record. Without `attempt`, the record is appended after the highest
    /// populated slot.
    pub fn add_exception(&mut self, record: ErrorRecord, attempt: Option<u32>) -> bool {
        let slot = attempt.unwrap_or_else(|| self.next_error_slot());
        if self.error.contains_key(&slot) {
            return false;
        }
        self.error.insert(slot, record);
        true
    }

    fn next_error_slot(&self) -> u32 {
        self.error
            .last_key_value()
            .map_or(0, |(slot, _)| slot.saturating_add(1))
    }
}
