//! Execution engine: runs the single handler of a validated command, then
//! its post-handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use crate::command::Command;
use crate::context::{AuthenticationInfo, CallContext, CurrentCulture};
use crate::deferred::BackgroundSubmitter;
use crate::envelope::LogKey;
use crate::fault::Fault;
use crate::message::{MessageCollector, UserMessage};
use crate::obs;
use crate::registry::{CommandRegistry, PostHandler};

/// What a handler sees besides its command.
pub struct HandlerContext<'a> {
    call: &'a CallContext,
    registry: &'a CommandRegistry,
    background: Option<&'a BackgroundSubmitter>,
    messages: &'a mut MessageCollector,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        call: &'a CallContext,
        registry: &'a CommandRegistry,
        background: Option<&'a BackgroundSubmitter>,
        messages: &'a mut MessageCollector,
    ) -> Self {
        Self {
            call,
            registry,
            background,
            messages,
        }
    }

    pub fn call(&self) -> &CallContext {
        self.call
    }

    pub fn culture(&self) -> &CurrentCulture {
        &self.call.culture
    }

    pub fn auth(&self) -> &AuthenticationInfo {
        &self.call.auth
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.registry
    }

    /// Submitter of the background executor, when one is running.
    pub fn background(&self) -> Option<&BackgroundSubmitter> {
        self.background
    }

    /// Messages emitted here end up in the envelope's `validationMessages`.
    pub fn messages(&mut self) -> &mut MessageCollector {
        &mut *self.messages
    }
}

/// Outcome of [`ExecutionEngine::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Handler returned; `None` for void results.
    Success(Option<Value>),
    /// Handler failed unexpectedly.
    Fault {
        errors: Vec<UserMessage>,
        log_key: LogKey,
    },
    /// No handler bound to the shape.
    NoHandler { errors: Vec<UserMessage> },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    expose_internal_error_detail: bool,
}

impl ExecutionEngine {
    pub fn new(expose_internal_error_detail: bool) -> Self {
        Self {
            expose_internal_error_detail,
        }
    }

    /// Run the handler of an already validated command.
    pub async fn execute(
        &self,
        command: &Command,
        call: &CallContext,
        registry: &CommandRegistry,
        background: Option<&BackgroundSubmitter>,
        messages: &mut MessageCollector,
    ) -> ExecutionOutcome {
        let Some(handler) = command.shape().handler() else {
            warn!(command = %command.name(), "no handler bound");
            return ExecutionOutcome::NoHandler {
                errors: vec![UserMessage::error(format!(
                    "No handler found for command '{}'.",
                    command.name()
                ))
                .with_code("Cris.NoHandler")],
            };
        };

        let started = Instant::now();
        let outcome = {
            let mut ctx = HandlerContext::new(call, registry, background, messages);
            AssertUnwindSafe(handler.invoke(command, &mut ctx))
                .catch_unwind()
                .await
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let fault = match outcome {
            Ok(Ok(result)) => {
                obs::emit_command_executed(command.name(), duration_ms, true);
                self.run_post_handlers(command, result.as_ref(), call, messages)
                    .await;
                return ExecutionOutcome::Success(result);
            }
            Ok(Err(err)) => Fault::from_error(&err),
            Err(panic) => Fault::from_panic(panic.as_ref()),
        };

        obs::emit_command_executed(command.name(), duration_ms, false);
        let log_key = LogKey::new();
        error!(
            command = %command.name(),
            handler = %handler.name(),
            log_key = %log_key,
            error = %fault,
            "unhandled handler fault"
        );
        obs::emit_fault_captured(command.name(), &log_key, &fault);

        let mut errors = MessageCollector::new();
        errors.error_code(
            format!(
                "An unhandled error occurred while executing command '{}' (LogKey: {}).",
                command.name(),
                log_key
            ),
            "Cris.UnhandledExecutionError",
        );
        errors.error(fault.message());
        if self.expose_internal_error_detail {
            fault.push_chain(1, &mut errors);
        }
        ExecutionOutcome::Fault {
            errors: errors.into_messages(),
            log_key,
        }
    }

    /// Fire-and-collect: failures become Warn messages, the result stands.
    async fn run_post_handlers(
        &self,
        command: &Command,
        result: Option<&Value>,
        call: &CallContext,
        messages: &mut MessageCollector,
    ) {
        let post_handlers: &[Arc<dyn PostHandler>] = command.shape().post_handlers();
        for post_handler in post_handlers {
            let outcome = AssertUnwindSafe(post_handler.after(command, result, call))
                .catch_unwind()
                .await;
            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => Fault::from_error(&err),
                Err(panic) => Fault::from_panic(panic.as_ref()),
            };
            warn!(
                command = %command.name(),
                post_handler = %post_handler.name(),
                error = %fault,
                "post-handler failed"
            );
            messages.push(
                UserMessage::warn(format!(
                    "Post-handler '{}' failed on command '{}': {}",
                    post_handler.name(),
                    command.name(),
                    fault.message()
                ))
                .with_code("Cris.PostHandlerFailed"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success_flag() {
        assert!(ExecutionOutcome::Success(None).is_success());
        assert!(!ExecutionOutcome::NoHandler { errors: vec![] }.is_success());
    }
}
