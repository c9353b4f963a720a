//! Ambient values on the server side.
//!
//! - [`AmbientValuesCollectCommand`] returns the ambient value set the client
//!   caches; every [`AmbientValueProvider`] contributes to it in
//!   registration order
//! - [`AmbientConfigurator`]s run at the end of the incoming phase and may
//!   ask for the command to run under an adjusted context, which routes it
//!   to the background executor

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::{Command, CommandDef};
use crate::context::CallContext;
use crate::execution::HandlerContext;
use crate::message::MessageCollector;
use crate::registry::CommandHandler;

/// Built-in command returning the current ambient values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmbientValuesCollectCommand {}

impl CommandDef for AmbientValuesCollectCommand {
    const NAME: &'static str = "AmbientValuesCollectCommand";

    fn result_facets() -> Vec<&'static str> {
        vec!["AmbientValues"]
    }
}

/// Contributes entries to the ambient value set.
#[async_trait]
pub trait AmbientValueProvider: Send + Sync {
    async fn collect(&self, ctx: &CallContext, values: &mut Map<String, Value>) -> anyhow::Result<()>;
}

/// One ambient value computed from the call context.
pub struct FnAmbientValue<F> {
    name: String,
    f: F,
}

impl<F> FnAmbientValue<F>
where
    F: Fn(&CallContext) -> Value + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> AmbientValueProvider for FnAmbientValue<F>
where
    F: Fn(&CallContext) -> Value + Send + Sync + 'static,
{
    async fn collect(&self, ctx: &CallContext, values: &mut Map<String, Value>) -> anyhow::Result<()> {
        values.insert(self.name.clone(), (self.f)(ctx));
        Ok(())
    }
}

/// Handler of [`AmbientValuesCollectCommand`].
pub(crate) struct CollectAmbientValues {
    providers: Vec<std::sync::Arc<dyn AmbientValueProvider>>,
}

impl CollectAmbientValues {
    pub(crate) fn new(providers: Vec<std::sync::Arc<dyn AmbientValueProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl CommandHandler<AmbientValuesCollectCommand> for CollectAmbientValues {
    type Output = Map<String, Value>;

    async fn handle(
        &self,
        _command: AmbientValuesCollectCommand,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<Map<String, Value>> {
        let mut values = Map::new();
        for provider in &self.providers {
            provider.collect(ctx.call(), &mut values).await?;
        }
        Ok(values)
    }
}

/// Step run after the incoming validators of every command.
///
/// Returning `Some` means the command must execute under the returned
/// context instead of the request's.
pub trait AmbientConfigurator: Send + Sync {
    fn configure(
        &self,
        command: &Command,
        ctx: &CallContext,
        messages: &mut MessageCollector,
    ) -> Option<CallContext>;
}
