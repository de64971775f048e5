//! Handler registry and bus builder.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::bus::Bus;
use super::config::RuntimeConfig;
use super::dispatcher::Violation;
use crate::command::Command;
use crate::dispatch::{DispatchContext, MessageHandler};
use crate::error::{Error, Result};
use crate::message::{ExceptionRecord, is_valid_class_name};
use crate::object::{DataObject, Operation, Signature, class_of};
use crate::store::{CommandStore, MessageQueue, Store};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a registered entry made of a message's target and operation.
pub(crate) enum Resolution {
    /// Target loaded and operation decoded; ready to invoke.
    Ready(Box<dyn Invocation>),
    /// The lookup succeeded but found nothing.
    NotFound,
    /// The key or operation cannot be decoded.
    Rejected(Violation),
    /// The lookup itself failed.
    Failed(ExceptionRecord),
}

/// A loaded target with its decoded operation, not yet run.
///
/// Split from resolution so the dispatcher can mark the command running
/// between finding the target and invoking it.
pub(crate) trait Invocation: Send {
    fn invoke<'a>(
        self: Box<Self>,
        command: Option<Command>,
        ctx: &'a DispatchContext,
    ) -> BoxFuture<'a, std::result::Result<(), ExceptionRecord>>;
}

struct TypedInvocation<H: MessageHandler> {
    handler: Arc<H>,
    object: H::Object,
    operation: <H::Object as DataObject>::Operation,
}

impl<H: MessageHandler> Invocation for TypedInvocation<H> {
    fn invoke<'a>(
        self: Box<Self>,
        command: Option<Command>,
        ctx: &'a DispatchContext,
    ) -> BoxFuture<'a, std::result::Result<(), ExceptionRecord>> {
        let TypedInvocation {
            handler,
            object,
            operation,
        } = *self;

        Box::pin(async move {
            handler
                .invoke(object, command, operation, ctx)
                .await
                .map_err(exception_record::<H>)
        })
    }
}

/// Type-erased entry for one registered class.
///
/// This trait allows the registry to store handlers for different data
/// types in a single map while keeping key and operation decoding typed.
#[async_trait]
pub(crate) trait ObjectEntry: Send + Sync {
    /// Operation names and arities accepted by the class.
    fn signatures(&self) -> &'static [Signature];

    /// Decode the key, look the target up, and decode the operation.
    async fn resolve(&self, instance: Value, operation: &str, arguments: Vec<Value>)
    -> Resolution;
}

/// Typed entry that captures the handler's concrete types at registration.
struct TypedEntry<H: MessageHandler> {
    handler: Arc<H>,
}

#[async_trait]
impl<H: MessageHandler> ObjectEntry for TypedEntry<H> {
    fn signatures(&self) -> &'static [Signature] {
        <<H::Object as DataObject>::Operation as Operation>::SIGNATURES
    }

    async fn resolve(
        &self,
        instance: Value,
        operation: &str,
        arguments: Vec<Value>,
    ) -> Resolution {
        let key: <H::Object as DataObject>::Key = match serde_json::from_value(instance) {
            Ok(key) => key,
            Err(e) => return Resolution::Rejected(Violation::MalformedInstance(e.to_string())),
        };

        let object = match self.handler.find(&key).await {
            Ok(Some(object)) => object,
            Ok(None) => return Resolution::NotFound,
            Err(error) => return Resolution::Failed(exception_record::<H>(error)),
        };

        let decoded =
            <<H::Object as DataObject>::Operation as Operation>::from_arguments(operation, arguments);
        let operation = match decoded {
            Ok(operation) => operation,
            Err(e) => return Resolution::Rejected(Violation::Operation(e)),
        };

        Resolution::Ready(Box::new(TypedInvocation {
            handler: Arc::clone(&self.handler),
            object,
            operation,
        }))
    }
}

fn exception_record<H: MessageHandler>(error: H::Error) -> ExceptionRecord {
    ExceptionRecord::from_error(type_name::<H::Error>(), &error.into())
}

/// Registry mapping fully-qualified class names to their entries.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Box<dyn ObjectEntry>>,
}

impl Registry {
    /// Look up the entry for a class.
    pub(crate) fn get(&self, class: &str) -> Option<&dyn ObjectEntry> {
        self.entries.get(class).map(AsRef::as_ref)
    }

    /// Returns the number of registered classes.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    fn insert<H: MessageHandler>(&mut self, class: String, handler: H) {
        let entry = TypedEntry {
            handler: Arc::new(handler),
        };
        self.entries.insert(class, Box::new(entry));
    }
}

/// Builder for constructing a [`Bus`].
///
/// Use this to register one [`MessageHandler`] per data type and configure
/// the runtime before starting.
///
/// # Example
///
/// ```ignore
/// let bus = Bus::builder(store)
///     .register(RepoHandler::new(db.clone()))
///     .register(NodeHandler::new(db.clone()))
///     .config(RuntimeConfig {
///         poll_interval: Duration::from_millis(50),
///         ..Default::default()
///     })
///     .build()?;
/// ```
pub struct BusBuilder<S>
where
    S: Store + CommandStore + MessageQueue,
{
    store: S,
    registry: Registry,
    registration_error: Option<Error>,
    config: RuntimeConfig,
}

impl<S> BusBuilder<S>
where
    S: Store + CommandStore + MessageQueue,
{
    /// Create a new builder with the given store.
    pub(crate) fn new(store: S) -> Self {
        Self {
            store,
            registry: Registry::default(),
            registration_error: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Register the handler for one data type.
    ///
    /// The class is derived from the handler's object type
    /// (`Razor::Data::<NAME>`). Each class can only be registered once, and
    /// its name must be a single capitalized identifier.
    ///
    /// Defers registration errors until build time; the first one wins.
    pub fn register<H: MessageHandler>(mut self, handler: H) -> Self {
        if self.registration_error.is_some() {
            return self;
        }

        let class = class_of::<H::Object>();
        if !is_valid_class_name(&class) {
            self.registration_error = Some(Error::InvalidClassName(class));
        } else if self.registry.contains(&class) {
            self.registration_error = Some(Error::DuplicateClass(class));
        } else {
            self.registry.insert(class, handler);
        }
        self
    }

    /// Set the runtime configuration.
    ///
    /// If not called, uses [`RuntimeConfig::default()`].
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the bus.
    pub fn build(self) -> Result<Bus<S>> {
        if let Some(error) = self.registration_error {
            return Err(error);
        }
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Bus {
            store: self.store,
            registry: Arc::new(self.registry),
            config: self.config,
            worker_id,
        })
    }
}
