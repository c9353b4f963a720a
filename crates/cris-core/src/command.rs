//! Command values, capability markers and the wire decoder.
//!
//! On the wire a command is the pair `["ExternalName", { ...fields }]`.
//! Decoding resolves the name against the [`CommandRegistry`] and checks the
//! fields against the shape's Rust type before any validator runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::registry::{CommandRegistry, CommandShape};

/// Ambient field carrying the acting user id.
pub const ACTOR_ID: &str = "actorId";
/// Ambient field carrying the real user id behind an impersonation.
pub const ACTUAL_ACTOR_ID: &str = "actualActorId";
/// Ambient field carrying the device identifier.
pub const DEVICE_ID: &str = "deviceId";
/// Ambient field carrying the culture name.
pub const CURRENT_CULTURE_NAME: &str = "currentCultureName";

/// Markers a command shape declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    AuthUnsafe,
    AuthNormal,
    AuthCritical,
    AuthDeviceId,
    AuthImpersonation,
    CurrentCulture,
    SimpleBatch,
    BackgroundExecution,
}

impl Capability {
    /// Markers this one implies.
    pub fn implied(self) -> &'static [Capability] {
        match self {
            Capability::AuthNormal => &[Capability::AuthUnsafe],
            Capability::AuthCritical => &[Capability::AuthNormal, Capability::AuthUnsafe],
            Capability::AuthDeviceId | Capability::AuthImpersonation => &[Capability::AuthUnsafe],
            _ => &[],
        }
    }

    /// Ambient field this marker brings into a command, if any.
    pub fn ambient_field(self) -> Option<&'static str> {
        match self {
            Capability::AuthUnsafe => Some(ACTOR_ID),
            Capability::AuthImpersonation => Some(ACTUAL_ACTOR_ID),
            Capability::AuthDeviceId => Some(DEVICE_ID),
            Capability::CurrentCulture => Some(CURRENT_CULTURE_NAME),
            _ => None,
        }
    }

    /// Expand a marker list with everything it implies.
    pub fn closure(markers: impl IntoIterator<Item = Capability>) -> BTreeSet<Capability> {
        let mut set = BTreeSet::new();
        for marker in markers {
            set.insert(marker);
            set.extend(marker.implied().iter().copied());
        }
        set
    }
}

/// A Rust type describing one command shape.
///
/// Fields not named by the type (e.g. ambient fields read by marker-bound
/// validators) stay available on the decoded [`Command`].
pub trait CommandDef: DeserializeOwned + Send + Sync + 'static {
    /// Stable external name.
    const NAME: &'static str;

    fn capabilities() -> Vec<Capability> {
        Vec::new()
    }

    /// Result facets; empty for void commands.
    fn result_facets() -> Vec<&'static str> {
        Vec::new()
    }

    /// Ambient fields beyond the ones implied by capabilities.
    fn ambient_fields() -> Vec<&'static str> {
        Vec::new()
    }
}

/// A decoded command: its resolved shape plus mutable field values.
#[derive(Debug, Clone)]
pub struct Command {
    shape: Arc<CommandShape>,
    fields: Map<String, Value>,
}

impl Command {
    pub(crate) fn new(shape: Arc<CommandShape>, fields: Map<String, Value>) -> Self {
        Self { shape, fields }
    }

    pub fn name(&self) -> &str {
        self.shape.name()
    }

    pub fn shape(&self) -> &Arc<CommandShape> {
        &self.shape
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.shape.has_capability(capability)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Field value, treating JSON `null` as unset.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Typed view of the fields.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            DecodeError::InvalidFields {
                command: self.name().to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Wire pair for this command.
    pub fn to_wire(&self) -> Value {
        Value::Array(vec![
            Value::String(self.name().to_string()),
            Value::Object(self.fields.clone()),
        ])
    }
}

/// Turns request bytes into a command.
pub trait CommandDecoder: Send + Sync {
    fn decode(&self, registry: &CommandRegistry, payload: &[u8]) -> Result<Command, DecodeError>;
}

/// Decoder for the JSON pair format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCommandDecoder;

impl CommandDecoder for JsonCommandDecoder {
    fn decode(&self, registry: &CommandRegistry, payload: &[u8]) -> Result<Command, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::EmptyBody);
        }
        let value: Value = serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed {
            length: payload.len(),
            reason: e.to_string(),
        })?;
        registry.command_from_wire(&value).map_err(|e| match e {
            DecodeError::NotACommand { .. } => DecodeError::NotACommand {
                length: payload.len(),
            },
            other => other,
        })
    }
}
