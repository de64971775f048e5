//! Persisted domain objects and the operations they accept from the bus.
//!
//! Instead of invoking arbitrary methods by name, every dispatchable type
//! declares a closed [`Operation`] enum. Each variant is one operation; its
//! positional fields are the operation's arguments, so the arity of every
//! operation is fixed at compile time and checked again when a message is
//! decoded.
//!
//! # Example
//!
//! ```
//! use razorbus::{DataObject, Operation};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Operation)]
//! enum RepoOperation {
//!     MakeTheRepoAccessible(String),
//!     #[operation(rename = "unpack")]
//!     UnpackImage(String, u32),
//!     Refresh,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct RepoKey {
//!     name: String,
//! }
//!
//! struct Repo {
//!     name: String,
//! }
//!
//! impl DataObject for Repo {
//!     type Key = RepoKey;
//!     type Operation = RepoOperation;
//!
//!     const NAME: &'static str = "Repo";
//!
//!     fn key(&self) -> RepoKey {
//!         RepoKey { name: self.name.clone() }
//!     }
//! }
//!
//! assert_eq!(RepoOperation::arity("unpack"), Some(2));
//! assert_eq!(RepoOperation::Refresh.name(), "refresh");
//! ```

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::message::class_name;

/// Name and fixed arity of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub arity: usize,
}

impl Signature {
    pub const fn new(name: &'static str, arity: usize) -> Self {
        Self { name, arity }
    }
}

/// Failure to encode or decode an operation's arguments.
#[derive(Debug, Error)]
pub enum OperationError {
    /// No variant carries this name.
    #[error("unknown operation {0:?}")]
    Unknown(String),

    /// The argument list does not match the declared arity.
    #[error("operation {operation:?} takes {expected} argument(s), {actual} given")]
    Arity {
        operation: String,
        expected: usize,
        actual: usize,
    },

    /// An argument could not be decoded into the declared field type.
    #[error("argument {index} of {operation:?} is invalid: {source}")]
    InvalidArgument {
        operation: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    /// An argument could not be encoded as JSON.
    #[error("failed to encode argument {index} of {operation:?}: {source}")]
    Encode {
        operation: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// A closed set of operations one [`DataObject`] type accepts.
///
/// Usually derived with `#[derive(Operation)]`. Variant names map to
/// snake_case operation names unless renamed with
/// `#[operation(rename = "...")]`. Only unit and tuple variants are accepted.
pub trait Operation: Sized + Send + Sync + 'static {
    /// Every operation name with its arity.
    const SIGNATURES: &'static [Signature];

    /// Operation name as stored in a message's `message` field.
    fn name(&self) -> &'static str;

    /// Encode the positional arguments.
    fn to_arguments(&self) -> Result<Vec<Value>, OperationError>;

    /// Rebuild an operation from a name and positional arguments.
    ///
    /// Fails unless the name is known and exactly the declared number of
    /// arguments is supplied.
    fn from_arguments(name: &str, arguments: Vec<Value>) -> Result<Self, OperationError>;

    /// Declared arity of the named operation.
    fn arity(name: &str) -> Option<usize> {
        Self::SIGNATURES
            .iter()
            .find(|signature| signature.name == name)
            .map(|signature| signature.arity)
    }
}

/// A persisted type that can receive operations through the bus.
///
/// The object is addressed on the wire by [`class_of`] and the JSON mapping
/// of [`DataObject::key`], which must serialize to a non-empty object.
pub trait DataObject: Send + Sync + 'static {
    /// Primary-key mapping used to look the object up again.
    type Key: Serialize + DeserializeOwned + Send + Sync;

    /// Operations this type accepts.
    type Operation: Operation;

    /// Bare type name, a single capitalized identifier. Must be stable
    /// across deployments.
    const NAME: &'static str;

    fn key(&self) -> Self::Key;
}

/// Fully-qualified class name of a data type, e.g. `Razor::Data::Repo`.
pub fn class_of<T: DataObject>() -> String {
    class_name(T::NAME)
}

/// Sequential argument decoder used by `#[derive(Operation)]`.
#[doc(hidden)]
pub struct ArgumentReader {
    operation: &'static str,
    index: usize,
    arguments: std::vec::IntoIter<Value>,
}

impl ArgumentReader {
    pub fn new(
        operation: &'static str,
        arguments: Vec<Value>,
        arity: usize,
    ) -> Result<Self, OperationError> {
        if arguments.len() != arity {
            return Err(OperationError::Arity {
                operation: operation.to_string(),
                expected: arity,
                actual: arguments.len(),
            });
        }
        Ok(Self {
            operation,
            index: 0,
            arguments: arguments.into_iter(),
        })
    }

    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T, OperationError> {
        let index = self.index;
        self.index += 1;
        let value = self.arguments.next().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|source| OperationError::InvalidArgument {
            operation: self.operation.to_string(),
            index,
            source,
        })
    }
}

/// Argument encoder used by `#[derive(Operation)]`.
#[doc(hidden)]
pub fn encode_argument<T: Serialize + ?Sized>(
    operation: &'static str,
    index: usize,
    value: &T,
) -> Result<Value, OperationError> {
    serde_json::to_value(value).map_err(|source| OperationError::Encode {
        operation: operation.to_string(),
        index,
        source,
    })
}
