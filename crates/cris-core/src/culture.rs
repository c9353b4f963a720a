//! Culture part: lets a command carry the culture it must run under.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::ambient::{AmbientConfigurator, AmbientValueProvider};
use crate::command::{Capability, Command, CURRENT_CULTURE_NAME};
use crate::context::{CallContext, CurrentCulture};
use crate::message::MessageCollector;
use crate::registry::RegistryBuilder;

/// Ambient configuration step for commands carrying `CurrentCulture`.
///
/// A supported culture that differs from the request's yields an adjusted
/// context; null or unsupported names only add a warning.
#[derive(Debug, Clone)]
pub struct CultureConfigurator {
    supported: BTreeSet<String>,
}

impl CultureConfigurator {
    pub fn new<I, S>(supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported: supported.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.supported.contains(name)
    }
}

impl AmbientConfigurator for CultureConfigurator {
    fn configure(
        &self,
        command: &Command,
        ctx: &CallContext,
        messages: &mut MessageCollector,
    ) -> Option<CallContext> {
        if !command.has_capability(Capability::CurrentCulture) {
            return None;
        }
        let Some(name) = command.field(CURRENT_CULTURE_NAME).and_then(Value::as_str) else {
            messages.warn("Culture name is null. It will be ignored.");
            return None;
        };
        if !self.is_supported(name) {
            messages.warn(format!("Culture '{name}' is not supported. It will be ignored."));
            return None;
        }
        if name == ctx.culture.name() {
            return None;
        }
        Some(ctx.clone().with_culture(CurrentCulture::new(name)))
    }
}

/// Publishes `currentCultureName`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CultureAmbientValue;

#[async_trait]
impl AmbientValueProvider for CultureAmbientValue {
    async fn collect(&self, ctx: &CallContext, values: &mut Map<String, Value>) -> anyhow::Result<()> {
        values.insert(
            CURRENT_CULTURE_NAME.to_string(),
            Value::from(ctx.culture.name()),
        );
        Ok(())
    }
}

impl RegistryBuilder {
    /// Register the culture configuration step for the given cultures.
    pub fn with_culture<I, S>(self, supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ambient_configurator(CultureConfigurator::new(supported))
            .ambient_provider(CultureAmbientValue)
    }
}
