//! Delayed commands: a wire command plus the time it must run at.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::command::{Command, CommandDef};
use crate::execution::HandlerContext;
use crate::message::MessageCollector;
use crate::registry::{CommandHandler, CommandValidator, RegistryBuilder};
use crate::validation::{ValidationContext, ValidationPhase};

/// `DelayedCommand { command: ["Name", {...}], executionDate }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedCommand {
    pub command: Value,
    pub execution_date: DateTime<Utc>,
}

impl CommandDef for DelayedCommand {
    const NAME: &'static str = "DelayedCommand";
}

/// Handling validator: the inner command must decode, must not be delayed
/// itself and must pass its own incoming validators now.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayedCommandValidator;

#[async_trait]
impl CommandValidator for DelayedCommandValidator {
    fn name(&self) -> &str {
        "DelayedCommand.handling"
    }

    async fn validate(
        &self,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> anyhow::Result<()> {
        let delayed: DelayedCommand = command.decode()?;
        let inner = match ctx.registry().command_from_wire(&delayed.command) {
            Ok(inner) => inner,
            Err(e) => {
                messages.error(format!("Invalid delayed command: {e}."));
                return Ok(());
            }
        };
        if inner.name() == DelayedCommand::NAME {
            messages.error("A delayed command cannot contain another delayed command.");
            return Ok(());
        }
        for validator in inner.shape().incoming_validators() {
            validator
                .validate(&inner, ctx, messages)
                .await
                .with_context(|| format!("validating delayed command '{}'", inner.name()))?;
        }
        Ok(())
    }
}

/// Hands the inner command to the background executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayedCommandHandler;

#[async_trait]
impl CommandHandler<DelayedCommand> for DelayedCommandHandler {
    type Output = ();

    async fn handle(&self, command: DelayedCommand, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        let inner = ctx.registry().command_from_wire(&command.command)?;
        let background = ctx
            .background()
            .context("background executor is not running")?;
        let handle = background.submit(
            Arc::new(inner),
            ctx.call().clone(),
            None,
            Some(command.execution_date),
        )?;
        debug!(
            deferred_id = %handle.id(),
            execute_at = %command.execution_date,
            "delayed command scheduled"
        );
        Ok(())
    }
}

impl RegistryBuilder {
    /// Register [`DelayedCommand`] with its validator and handler.
    pub fn with_delayed_commands(self) -> Self {
        self.command::<DelayedCommand>()
            .validator(
                ValidationPhase::Handling,
                DelayedCommand::NAME,
                DelayedCommandValidator,
            )
            .handler::<DelayedCommand, _>(DelayedCommandHandler)
    }
}
