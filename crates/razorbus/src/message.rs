//! Wire format of queued work.
//!
//! A [`Message`] names an operation on a persisted object by class, primary
//! key and operation name. It carries no live references: the target and any
//! associated [`Command`](crate::Command) are re-read by primary key every
//! time the message is processed, so replays and stale deliveries see current
//! state.
//!
//! ```text
//! { "class": "Razor::Data::Repo", "instance": {"name": "centos"},
//!   "message": "make_the_repo_accessible", "arguments": ["http://..."],
//!   "command": {"id": 7}, "retries": 2,
//!   "exceptions": [{"exception": "..", "message": "..", "backtrace": [..]}] }
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace every dispatchable class lives in.
pub const NAMESPACE: &str = "Razor::Data::";

static CLASS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\ARazor::Data::[A-Z][A-Za-z0-9_]*\z").expect("class name pattern is valid")
});

/// Qualify a bare type name with the [`NAMESPACE`].
pub fn class_name(name: &str) -> String {
    format!("{NAMESPACE}{name}")
}

/// Returns `true` if `class` is `Razor::Data::` followed by exactly one
/// capitalized identifier.
///
/// ```
/// use razorbus::message::is_valid_class_name;
///
/// assert!(is_valid_class_name("Razor::Data::Repo"));
/// assert!(!is_valid_class_name("Razor::Data::Repo::Nested"));
/// assert!(!is_valid_class_name("Kernel"));
/// ```
pub fn is_valid_class_name(class: &str) -> bool {
    CLASS_NAME.is_match(class)
}

/// One failed attempt, as carried in a message's `exceptions` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    /// Error type name.
    pub exception: String,
    /// Display message.
    pub message: String,
    /// Cause chain, outermost first.
    #[serde(default)]
    pub backtrace: Vec<String>,
}

impl ExceptionRecord {
    pub fn new(exception: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception: exception.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Capture an error's display message and its cause chain.
    pub fn from_error(exception: impl Into<String>, error: &anyhow::Error) -> Self {
        Self {
            exception: exception.into(),
            message: error.to_string(),
            backtrace: error.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

/// A queued request to run one operation against one persisted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Fully-qualified class name of the target.
    pub class: String,
    /// Primary-key mapping of the target.
    pub instance: Value,
    /// Operation name.
    pub message: String,
    /// Positional operation arguments, excluding any leading command.
    #[serde(default)]
    pub arguments: Vec<Value>,
    /// Primary-key mapping of the associated command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    /// Number of retries so far; absent on the first delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// One record per failed attempt, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<ExceptionRecord>,
}

impl Message {
    /// Retries so far, treating an absent counter as zero.
    pub fn retry_count(&self) -> u32 {
        self.retries.unwrap_or(0)
    }
}

/// Result of decoding a delivered body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body, `null`, or `{}`; acknowledged and ignored.
    Empty,
    /// A structurally valid message.
    Message(Message),
    /// Not a message. Any `command` entry is kept so the command can still
    /// be marked failed.
    Malformed {
        reason: String,
        command: Option<Value>,
    },
}

impl Body {
    pub fn decode(body: Option<Value>) -> Self {
        let value = match body {
            None | Some(Value::Null) => return Body::Empty,
            Some(Value::Object(map)) if map.is_empty() => return Body::Empty,
            Some(value) => value,
        };

        let command = value.get("command").filter(|c| !c.is_null()).cloned();
        match serde_json::from_value::<Message>(value) {
            Ok(message) => Body::Message(message),
            Err(e) => Body::Malformed {
                reason: e.to_string(),
                command,
            },
        }
    }
}
