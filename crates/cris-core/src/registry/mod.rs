//! Command registry: the process-lifetime catalog of command shapes.
//!
//! - [`RegistryBuilder`] collects commands, validators, handlers and parts
//! - [`RegistryBuilder::build`] resolves every binding once and rejects
//!   configurations that cannot work (several handlers, diverging results)
//! - [`CommandRegistry::resolve`] is read-only afterwards and shared by all
//!   concurrent requests

mod binding;
mod builder;
mod result_type;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

pub use binding::{
    CommandHandler, CommandValidator, DynValidator, FnHandler, FnValidator, HandlerBinding,
    PostHandler,
};
pub(crate) use binding::TypedHandler;
pub use builder::RegistryBuilder;
pub use result_type::{ResultType, ResultTypeCatalog};

use crate::ambient::AmbientConfigurator;
use crate::command::{Capability, Command};
use crate::deferred::DeferredCommandListener;
use crate::error::DecodeError;

pub(crate) type FieldCheck = fn(&Map<String, Value>) -> Result<(), String>;

/// Everything the pipeline needs to know about one command.
pub struct CommandShape {
    name: String,
    capabilities: BTreeSet<Capability>,
    result_type: ResultType,
    ambient_fields: Vec<String>,
    incoming: Vec<Arc<dyn CommandValidator>>,
    handling: Vec<Arc<dyn CommandValidator>>,
    handler: Option<Arc<dyn HandlerBinding>>,
    post_handlers: Vec<Arc<dyn PostHandler>>,
    field_check: FieldCheck,
}

impl CommandShape {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn result_type(&self) -> &ResultType {
        &self.result_type
    }

    pub fn ambient_fields(&self) -> &[String] {
        &self.ambient_fields
    }

    pub fn incoming_validators(&self) -> &[Arc<dyn CommandValidator>] {
        &self.incoming
    }

    pub fn handling_validators(&self) -> &[Arc<dyn CommandValidator>] {
        &self.handling
    }

    pub fn handler(&self) -> Option<&Arc<dyn HandlerBinding>> {
        self.handler.as_ref()
    }

    pub fn post_handlers(&self) -> &[Arc<dyn PostHandler>] {
        &self.post_handlers
    }
}

impl fmt::Debug for CommandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandShape")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("result_type", &self.result_type)
            .field("ambient_fields", &self.ambient_fields)
            .field("incoming", &self.incoming.len())
            .field("handling", &self.handling.len())
            .field("handler", &self.handler.as_ref().map(|h| h.name().to_string()))
            .field("post_handlers", &self.post_handlers.len())
            .finish()
    }
}

/// Resolved, read-only command catalog.
pub struct CommandRegistry {
    shapes: BTreeMap<String, Arc<CommandShape>>,
    result_types: ResultTypeCatalog,
    configurators: Vec<Arc<dyn AmbientConfigurator>>,
    listeners: Vec<Arc<dyn DeferredCommandListener>>,
}

impl CommandRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<CommandShape>> {
        self.shapes.get(name).cloned()
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Arc<CommandShape>> {
        self.shapes.values()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn result_types(&self) -> &ResultTypeCatalog {
        &self.result_types
    }

    pub(crate) fn configurators(&self) -> &[Arc<dyn AmbientConfigurator>] {
        &self.configurators
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn DeferredCommandListener>] {
        &self.listeners
    }

    /// Build a command from its name and fields, checking the fields fit the shape.
    pub fn create(&self, name: &str, fields: Map<String, Value>) -> Result<Command, DecodeError> {
        let shape = self
            .resolve(name)
            .ok_or_else(|| DecodeError::UnknownCommand(name.to_string()))?;
        (shape.field_check)(&fields).map_err(|reason| DecodeError::InvalidFields {
            command: name.to_string(),
            reason,
        })?;
        Ok(Command::new(shape, fields))
    }

    /// Build a command from its `["Name", {...}]` wire pair.
    pub fn command_from_wire(&self, value: &Value) -> Result<Command, DecodeError> {
        let not_a_command = || DecodeError::NotACommand {
            length: value.to_string().len(),
        };
        let pair = value.as_array().ok_or_else(not_a_command)?;
        let (name, fields) = match pair.as_slice() {
            [Value::String(name), Value::Object(fields)] => (name, fields),
            _ => return Err(not_a_command()),
        };
        self.create(name, fields.clone())
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("shapes", &self.shapes.keys().collect::<Vec<_>>())
            .field("configurators", &self.configurators.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
