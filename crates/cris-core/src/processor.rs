//! The pipeline shared by inline requests and the background executor:
//! validation, execution and envelope building.

use std::sync::Arc;

use crate::command::Command;
use crate::config::CrisConfig;
use crate::context::CallContext;
use crate::deferred::BackgroundSubmitter;
use crate::envelope::{EnvelopeBuilder, ExecutedCommand, PipelineOutcome};
use crate::execution::ExecutionEngine;
use crate::message::MessageCollector;
use crate::metrics::METRICS;
use crate::registry::CommandRegistry;
use crate::validation::{ValidationContext, ValidationPipeline, ValidationRun};

/// Result of the incoming phase of one run.
#[derive(Debug)]
pub struct IncomingValidation {
    pub run: ValidationRun,
    pub messages: MessageCollector,
    /// Context requested by an ambient configurator.
    pub adjusted: Option<CallContext>,
}

impl IncomingValidation {
    pub fn passed(&self) -> bool {
        !self.run.is_failed()
    }
}

pub struct CommandProcessor {
    registry: Arc<CommandRegistry>,
    validation: ValidationPipeline,
    execution: ExecutionEngine,
    envelopes: EnvelopeBuilder,
}

impl CommandProcessor {
    pub fn new(registry: Arc<CommandRegistry>, config: &CrisConfig) -> Self {
        Self {
            registry,
            validation: ValidationPipeline::new(config.expose_internal_error_detail),
            execution: ExecutionEngine::new(config.expose_internal_error_detail),
            envelopes: EnvelopeBuilder::new(config.log_key_for_missing_handler),
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn envelopes(&self) -> &EnvelopeBuilder {
        &self.envelopes
    }

    pub async fn validate_incoming(&self, command: &Command, call: &CallContext) -> IncomingValidation {
        let mut run = ValidationRun::new();
        let mut messages = MessageCollector::new();
        let ctx = ValidationContext::new(call, &self.registry);
        let adjusted = self
            .validation
            .incoming(&mut run, command, &ctx, &mut messages)
            .await;
        IncomingValidation {
            run,
            messages,
            adjusted,
        }
    }

    /// Envelope of a run whose incoming phase failed.
    pub fn reject(&self, command: Arc<Command>, incoming: IncomingValidation, deferred: bool) -> ExecutedCommand {
        let IncomingValidation { run, messages, .. } = incoming;
        METRICS.inc_validation_failures();
        self.envelopes.build(
            command,
            PipelineOutcome::Rejected {
                log_key: run.into_log_key(),
            },
            messages.into_messages(),
            deferred,
        )
    }

    /// Handling phase, execution and envelope after a passed incoming phase.
    pub async fn complete(
        &self,
        command: Arc<Command>,
        call: &CallContext,
        incoming: IncomingValidation,
        background: Option<&BackgroundSubmitter>,
        deferred: bool,
    ) -> ExecutedCommand {
        let IncomingValidation {
            mut run,
            mut messages,
            ..
        } = incoming;

        // Without a handler there is nothing to validate for: the execution
        // engine answers "no handler" directly.
        if command.shape().handler().is_none() {
            let outcome = self
                .execution
                .execute(&command, call, &self.registry, background, &mut messages)
                .await;
            METRICS.inc_execution_failures();
            return self.envelopes.build(
                command,
                PipelineOutcome::Executed(outcome),
                messages.into_messages(),
                deferred,
            );
        }

        let ctx = ValidationContext::new(call, &self.registry);
        self.validation
            .handling(&mut run, &command, &ctx, &mut messages)
            .await;
        if run.is_failed() {
            METRICS.inc_validation_failures();
            return self.envelopes.build(
                command,
                PipelineOutcome::Rejected {
                    log_key: run.into_log_key(),
                },
                messages.into_messages(),
                deferred,
            );
        }

        let outcome = self
            .execution
            .execute(&command, call, &self.registry, background, &mut messages)
            .await;
        if !outcome.is_success() {
            METRICS.inc_execution_failures();
        }
        self.envelopes.build(
            command,
            PipelineOutcome::Executed(outcome),
            messages.into_messages(),
            deferred,
        )
    }

    /// Whole pipeline under one context; an adjusted context from the
    /// incoming phase is applied in place.
    pub async fn process(
        &self,
        command: Arc<Command>,
        call: &CallContext,
        background: Option<&BackgroundSubmitter>,
        deferred: bool,
    ) -> ExecutedCommand {
        let mut incoming = self.validate_incoming(&command, call).await;
        if !incoming.passed() {
            return self.reject(command, incoming, deferred);
        }
        match incoming.adjusted.take() {
            Some(adjusted) => {
                self.complete(command, &adjusted, incoming, background, deferred)
                    .await
            }
            None => self.complete(command, call, incoming, background, deferred).await,
        }
    }
}
