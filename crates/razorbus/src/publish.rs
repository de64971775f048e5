//! Building messages for publication.
//!
//! Everything here runs synchronously at the call site that schedules work,
//! so a malformed request fails where it was made instead of on a worker
//! minutes later.

use serde::Serialize;
use serde_json::Value;

use crate::command::{Command, CommandId};
use crate::error::{Error, Result};
use crate::message::{Message, is_valid_class_name};
use crate::object::{DataObject, Operation, Signature, class_of};

/// One positional argument for [`Bus::publish_raw`](crate::Bus::publish_raw).
///
/// A command may only appear first; it is lifted out of the argument list
/// into the message's `command` reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Command(CommandId),
    Value(Value),
}

impl Argument {
    /// Encode any serializable value as an argument.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Argument::Value(serde_json::to_value(value)?))
    }
}

impl From<&Command> for Argument {
    fn from(command: &Command) -> Self {
        Argument::Command(command.id)
    }
}

impl From<CommandId> for Argument {
    fn from(id: CommandId) -> Self {
        Argument::Command(id)
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Argument::Value(value)
    }
}

/// Build the message for a typed operation on `object`.
pub(crate) fn typed_message<T: DataObject>(
    object: &T,
    command: Option<&Command>,
    operation: &T::Operation,
) -> Result<Message> {
    let class = class_of::<T>();
    let instance = encode_key(&class, &object.key())?;
    let arguments = operation.to_arguments()?;
    check_arity(
        &class,
        <T::Operation as Operation>::SIGNATURES,
        operation.name(),
        arguments.len(),
    )?;

    Ok(Message {
        class,
        instance,
        message: operation.name().to_owned(),
        arguments,
        command: command.map(Command::reference),
        retries: None,
        exceptions: Vec::new(),
    })
}

/// Build a message from untyped parts, checked against the registered
/// signatures of `class`.
pub(crate) fn raw_message(
    class: &str,
    signatures: &[Signature],
    instance: Value,
    operation: &str,
    arguments: Vec<Argument>,
) -> Result<Message> {
    check_class(class)?;
    check_instance(class, &instance)?;

    let mut arguments = arguments.into_iter().peekable();
    let command = match arguments.next_if(|a| matches!(a, Argument::Command(_))) {
        Some(Argument::Command(id)) => Some(id.to_reference()),
        _ => None,
    };

    let offset = usize::from(command.is_some());
    let arguments = arguments
        .enumerate()
        .map(|(index, argument)| match argument {
            Argument::Value(value) => Ok(value),
            Argument::Command(_) => Err(Error::MisplacedCommand(index + offset)),
        })
        .collect::<Result<Vec<_>>>()?;

    check_arity(class, signatures, operation, arguments.len())?;

    Ok(Message {
        class: class.to_owned(),
        instance,
        message: operation.to_owned(),
        arguments,
        command,
        retries: None,
        exceptions: Vec::new(),
    })
}

pub(crate) fn check_class(class: &str) -> Result<()> {
    if is_valid_class_name(class) {
        Ok(())
    } else {
        Err(Error::InvalidClassName(class.to_owned()))
    }
}

fn encode_key<K: Serialize>(class: &str, key: &K) -> Result<Value> {
    let instance = serde_json::to_value(key).map_err(|e| Error::invalid_key(class, e.to_string()))?;
    check_instance(class, &instance)?;
    Ok(instance)
}

fn check_instance(class: &str, instance: &Value) -> Result<()> {
    match instance.as_object() {
        Some(map) if !map.is_empty() => Ok(()),
        Some(_) => Err(Error::invalid_key(class, "primary key mapping is empty")),
        None => Err(Error::invalid_key(
            class,
            "primary key must serialize to a mapping",
        )),
    }
}

fn check_arity(
    class: &str,
    signatures: &[Signature],
    operation: &str,
    actual: usize,
) -> Result<()> {
    let signature = signatures
        .iter()
        .find(|signature| !operation.is_empty() && signature.name == operation)
        .ok_or_else(|| Error::UnknownOperation {
            class: class.to_owned(),
            operation: operation.to_owned(),
        })?;

    if signature.arity != actual {
        return Err(Error::ArityMismatch {
            class: class.to_owned(),
            operation: operation.to_owned(),
            expected: signature.arity,
            actual,
        });
    }
    Ok(())
}
