//! Two-phase validation.
//!
//! Per command run the state moves
//! `Created → IncomingValidating → (IncomingFailed | IncomingPassed)
//! → HandlingValidating → (HandlingFailed | HandlingPassed) → Validated`.
//!
//! - validators of a phase run one after the other in registration order
//! - a phase fails when the collector holds an Error message at its end
//! - a failed incoming phase skips handling validation and the handler
//! - an `Err` or panic from a validator becomes a system Error message
//!   carrying a fresh log key; it never escapes to the caller

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, trace};

use crate::command::Command;
use crate::context::{AuthenticationInfo, CallContext, CurrentCulture};
use crate::envelope::LogKey;
use crate::fault::Fault;
use crate::message::MessageCollector;
use crate::obs;
use crate::registry::{CommandRegistry, CommandValidator};

/// Validation phase a validator is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationPhase {
    Incoming,
    Handling,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationPhase::Incoming => f.write_str("incoming"),
            ValidationPhase::Handling => f.write_str("handling"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Created,
    IncomingValidating,
    IncomingFailed,
    IncomingPassed,
    HandlingValidating,
    HandlingFailed,
    HandlingPassed,
    Validated,
}

impl ValidationState {
    pub fn can_advance_to(self, next: ValidationState) -> bool {
        use ValidationState::*;
        matches!(
            (self, next),
            (Created, IncomingValidating)
                | (IncomingValidating, IncomingFailed | IncomingPassed)
                | (IncomingPassed, HandlingValidating)
                | (HandlingValidating, HandlingFailed | HandlingPassed)
                | (HandlingPassed, Validated)
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ValidationState::IncomingFailed | ValidationState::HandlingFailed
        )
    }
}

/// Validation progress of one command run.
#[derive(Debug, Clone)]
pub struct ValidationRun {
    state: ValidationState,
    log_key: Option<LogKey>,
}

impl Default for ValidationRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationRun {
    pub fn new() -> Self {
        Self {
            state: ValidationState::Created,
            log_key: None,
        }
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// Key of the first validator fault, if any.
    pub fn log_key(&self) -> Option<&LogKey> {
        self.log_key.as_ref()
    }

    pub(crate) fn into_log_key(self) -> Option<LogKey> {
        self.log_key
    }

    fn advance(&mut self, next: ValidationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal validation transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(from = ?self.state, to = ?next, "validation state");
        self.state = next;
    }

    fn record_fault(&mut self, key: LogKey) {
        if self.log_key.is_none() {
            self.log_key = Some(key);
        }
    }
}

/// Inputs handed to validators.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    call: &'a CallContext,
    registry: &'a CommandRegistry,
}

impl<'a> ValidationContext<'a> {
    pub fn new(call: &'a CallContext, registry: &'a CommandRegistry) -> Self {
        Self { call, registry }
    }

    pub fn call(&self) -> &'a CallContext {
        self.call
    }

    pub fn culture(&self) -> &'a CurrentCulture {
        &self.call.culture
    }

    pub fn auth(&self) -> &'a AuthenticationInfo {
        &self.call.auth
    }

    pub fn registry(&self) -> &'a CommandRegistry {
        self.registry
    }
}

/// Runs validator phases against a command.
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline {
    expose_internal_error_detail: bool,
}

impl ValidationPipeline {
    pub fn new(expose_internal_error_detail: bool) -> Self {
        Self {
            expose_internal_error_detail,
        }
    }

    /// Incoming phase, followed by the ambient configuration step.
    ///
    /// Returns the adjusted call context when a configurator asked for one;
    /// such a command must run under that context.
    pub async fn incoming(
        &self,
        run: &mut ValidationRun,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> Option<CallContext> {
        run.advance(ValidationState::IncomingValidating);
        let validators = command.shape().incoming_validators();
        self.run_validators(ValidationPhase::Incoming, run, validators, command, ctx, messages)
            .await;

        let mut adjusted: Option<CallContext> = None;
        for configurator in ctx.registry().configurators() {
            let current = adjusted.as_ref().unwrap_or(ctx.call());
            if let Some(next) = configurator.configure(command, current, messages) {
                adjusted = Some(next);
            }
        }

        self.finish_phase(ValidationPhase::Incoming, run, command, messages);
        adjusted
    }

    /// Handling phase; only legal after a passed incoming phase.
    pub async fn handling(
        &self,
        run: &mut ValidationRun,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) {
        run.advance(ValidationState::HandlingValidating);
        let validators = command.shape().handling_validators();
        self.run_validators(ValidationPhase::Handling, run, validators, command, ctx, messages)
            .await;
        self.finish_phase(ValidationPhase::Handling, run, command, messages);
        if run.state() == ValidationState::HandlingPassed {
            run.advance(ValidationState::Validated);
        }
    }

    async fn run_validators(
        &self,
        phase: ValidationPhase,
        run: &mut ValidationRun,
        validators: &[Arc<dyn CommandValidator>],
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) {
        for validator in validators {
            let outcome = AssertUnwindSafe(validator.validate(command, ctx, messages))
                .catch_unwind()
                .await;
            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => Fault::from_error(&err),
                Err(panic) => Fault::from_panic(panic.as_ref()),
            };
            let key = LogKey::new();
            error!(
                command = %command.name(),
                validator = %validator.name(),
                phase = %phase,
                log_key = %key,
                error = %fault,
                "unhandled validator fault"
            );
            obs::emit_fault_captured(command.name(), &key, &fault);
            messages.error_code(
                format!(
                    "An unhandled error occurred while validating command '{}' (LogKey: {}).",
                    command.name(),
                    key
                ),
                "Cris.UnhandledValidationError",
            );
            if self.expose_internal_error_detail {
                fault.push_chain(0, messages);
            }
            run.record_fault(key);
        }
    }

    fn finish_phase(
        &self,
        phase: ValidationPhase,
        run: &mut ValidationRun,
        command: &Command,
        messages: &MessageCollector,
    ) {
        let failed = messages.has_errors();
        let next = match (phase, failed) {
            (ValidationPhase::Incoming, true) => ValidationState::IncomingFailed,
            (ValidationPhase::Incoming, false) => ValidationState::IncomingPassed,
            (ValidationPhase::Handling, true) => ValidationState::HandlingFailed,
            (ValidationPhase::Handling, false) => ValidationState::HandlingPassed,
        };
        run.advance(next);
        if failed {
            obs::emit_validation_failed(command.name(), phase, messages.error_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ValidationState::*;
        assert!(Created.can_advance_to(IncomingValidating));
        assert!(IncomingValidating.can_advance_to(IncomingFailed));
        assert!(IncomingPassed.can_advance_to(HandlingValidating));
        assert!(HandlingPassed.can_advance_to(Validated));

        assert!(!Created.can_advance_to(HandlingValidating));
        assert!(!IncomingFailed.can_advance_to(HandlingValidating));
        assert!(!HandlingFailed.can_advance_to(Validated));
    }

    #[test]
    fn test_failed_states() {
        assert!(ValidationState::IncomingFailed.is_failed());
        assert!(ValidationState::HandlingFailed.is_failed());
        assert!(!ValidationState::Validated.is_failed());
    }

    #[test]
    fn test_run_keeps_first_fault_key() {
        let mut run = ValidationRun::new();
        let first = LogKey::new();
        run.record_fault(first.clone());
        run.record_fault(LogKey::new());
        assert_eq!(run.log_key(), Some(&first));
    }
}
