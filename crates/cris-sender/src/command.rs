//! Client-side command graph.
//!
//! Commands are shared through [`CommandRef`] so one object can appear in
//! several places of a batch; identity is pointer identity.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cris_core::CommandShape;
use serde_json::{Map, Value};

use crate::ambient::MAX_DEPTH;
use crate::error::{Result, SenderError};

/// Name and ambient fields of a command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandModel {
    name: String,
    ambient_fields: Vec<String>,
}

impl CommandModel {
    pub fn new<I, S>(name: impl Into<String>, ambient_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            ambient_fields: ambient_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Model matching a server-side shape.
    pub fn from_shape(shape: &CommandShape) -> Self {
        Self::new(shape.name(), shape.ambient_fields().iter().cloned())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ambient_fields(&self) -> &[String] {
        &self.ambient_fields
    }
}

/// A field value; containers may hold nested commands.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Json(Value),
    Command(CommandRef),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Missing and `null` fields are unset.
    pub fn is_unset(&self) -> bool {
        matches!(self, FieldValue::Json(Value::Null))
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Json(value)
    }
}

impl From<CommandRef> for FieldValue {
    fn from(command: CommandRef) -> Self {
        FieldValue::Command(command)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(items: Vec<FieldValue>) -> Self {
        FieldValue::List(items)
    }
}

impl From<BTreeMap<String, FieldValue>> for FieldValue {
    fn from(entries: BTreeMap<String, FieldValue>) -> Self {
        FieldValue::Map(entries)
    }
}

#[derive(Debug, Clone)]
pub struct ClientCommand {
    model: Arc<CommandModel>,
    fields: BTreeMap<String, FieldValue>,
}

impl ClientCommand {
    pub fn new(model: Arc<CommandModel>) -> Self {
        Self {
            model,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn model(&self) -> &CommandModel {
        &self.model
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn is_unset(&self, name: &str) -> bool {
        self.fields.get(name).map_or(true, FieldValue::is_unset)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn into_ref(self) -> CommandRef {
        CommandRef::new(self)
    }
}

/// Shared handle on a [`ClientCommand`].
#[derive(Debug, Clone)]
pub struct CommandRef(Arc<Mutex<ClientCommand>>);

impl CommandRef {
    pub fn new(command: ClientCommand) -> Self {
        Self(Arc::new(Mutex::new(command)))
    }

    pub fn ptr_eq(&self, other: &CommandRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key for visited sets.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn lock(&self) -> MutexGuard<'_, ClientCommand> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> String {
        self.lock().name().to_string()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.lock().set(name, value);
    }

    /// JSON value of a plain field.
    pub fn json_field(&self, name: &str) -> Option<Value> {
        match self.lock().get(name) {
            Some(FieldValue::Json(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wire pair `["Name", {...}]`, nested commands included.
    ///
    /// A command that contains itself cannot be sent and is rejected.
    pub fn to_wire(&self) -> Result<Value> {
        let mut path = HashSet::new();
        command_to_wire(self, &mut path, 0)
    }
}

fn command_to_wire(command: &CommandRef, path: &mut HashSet<usize>, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(SenderError::InvalidCommand(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    if !path.insert(command.identity()) {
        return Err(SenderError::InvalidCommand(format!(
            "command '{}' contains itself",
            command.name()
        )));
    }
    let snapshot = command.lock().clone();
    let mut fields = Map::new();
    for (name, value) in snapshot.fields() {
        fields.insert(name.clone(), field_to_wire(value, path, depth + 1)?);
    }
    path.remove(&command.identity());
    Ok(Value::Array(vec![
        Value::String(snapshot.name().to_string()),
        Value::Object(fields),
    ]))
}

fn field_to_wire(value: &FieldValue, path: &mut HashSet<usize>, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(SenderError::InvalidCommand(format!(
            "nesting deeper than {MAX_DEPTH} levels"
        )));
    }
    Ok(match value {
        FieldValue::Json(json) => json.clone(),
        FieldValue::Command(command) => command_to_wire(command, path, depth)?,
        FieldValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| field_to_wire(item, path, depth + 1))
                .collect::<Result<_>>()?,
        ),
        FieldValue::Map(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.clone(), field_to_wire(item, path, depth + 1)?);
            }
            Value::Object(map)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(name: &str) -> Arc<CommandModel> {
        Arc::new(CommandModel::new(name, ["actorId"]))
    }

    #[test]
    fn test_unset_fields() {
        let command = ClientCommand::new(model("Rename"))
            .with_field("actorId", Value::Null)
            .with_field("newName", json!("x"));
        assert!(command.is_unset("actorId"));
        assert!(command.is_unset("missing"));
        assert!(!command.is_unset("newName"));
    }

    #[test]
    fn test_nested_wire_pair() {
        let inner = ClientCommand::new(model("Rename"))
            .with_field("newName", json!("x"))
            .into_ref();
        let batch = ClientCommand::new(model("Batch"))
            .with_field("items", vec![FieldValue::from(inner.clone()), inner.into()])
            .into_ref();

        assert_eq!(
            batch.to_wire().unwrap(),
            json!(["Batch", {"items": [["Rename", {"newName": "x"}], ["Rename", {"newName": "x"}]]}])
        );
    }

    #[test]
    fn test_self_containing_command_rejected() {
        let looped = ClientCommand::new(model("Loop")).into_ref();
        looped.set("next", looped.clone());
        assert!(matches!(looped.to_wire(), Err(SenderError::InvalidCommand(_))));
    }
}
