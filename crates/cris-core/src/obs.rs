//! Structured lifecycle events of the command pipeline.
//!
//! - [`command_span`] scoping every record of one request; attach it with
//!   `tracing::Instrument` since the request future crosses await points
//! - `emit_*` functions for received, validation failed, executed, fault
//!   captured and deferred submitted/completed events
//!
//! Events are emitted at `info!` level except captured faults, which are
//! `error!` so the log key in an envelope always has a matching record.

use chrono::{DateTime, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::envelope::LogKey;
use crate::validation::ValidationPhase;

/// Span tagged with the command name.
pub fn command_span(command: &str) -> tracing::Span {
    tracing::info_span!("cris.command", command = %command)
}

pub fn emit_command_received(command: &str, type_filter_name: &str) {
    info!(event = "command.received", command = %command, type_filter_name = %type_filter_name);
}

pub fn emit_validation_failed(command: &str, phase: ValidationPhase, errors: usize) {
    info!(
        event = "command.validation_failed",
        command = %command,
        phase = %phase,
        errors = errors,
    );
}

pub fn emit_command_executed(command: &str, duration_ms: u64, success: bool) {
    info!(
        event = "command.executed",
        command = %command,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_fault_captured(command: &str, log_key: &LogKey, fault: &dyn std::fmt::Display) {
    error!(
        event = "command.fault_captured",
        command = %command,
        log_key = %log_key,
        error = %fault,
    );
}

pub fn emit_deferred_submitted(command: &str, id: &Uuid, execute_at: Option<DateTime<Utc>>) {
    info!(
        event = "deferred.submitted",
        command = %command,
        deferred_id = %id,
        execute_at = ?execute_at,
    );
}

pub fn emit_deferred_completed(command: &str, id: &Uuid, success: bool) {
    info!(
        event = "deferred.completed",
        command = %command,
        deferred_id = %id,
        success = success,
    );
}
