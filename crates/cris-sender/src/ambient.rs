//! Ambient value propagation.
//!
//! Walks a command graph breadth-first and fills every unset ambient field
//! from the caller overrides, then from the cached server values.
//! - each distinct command object is visited once (pointer identity)
//! - set fields are never overwritten, so a second pass changes nothing
//! - nesting beyond [`MAX_DEPTH`] is skipped and reported

use std::collections::{HashSet, VecDeque};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::command::{CommandRef, FieldValue};

/// Deepest nesting walked, counting commands and containers.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Distinct commands visited.
    pub visited: usize,
    /// Ambient fields assigned.
    pub assigned: usize,
    /// Commands or containers left unvisited past the depth limit.
    pub skipped_too_deep: usize,
}

pub fn apply_ambient_values(
    root: &CommandRef,
    cached: &Map<String, Value>,
    overrides: &Map<String, Value>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut queue: VecDeque<(CommandRef, usize)> = VecDeque::new();
    queue.push_back((root.clone(), 0));

    while let Some((command, depth)) = queue.pop_front() {
        if depth > MAX_DEPTH {
            report.skipped_too_deep += 1;
            continue;
        }
        if !visited.insert(command.identity()) {
            continue;
        }
        report.visited += 1;

        let mut children = Vec::new();
        {
            let mut guard = command.lock();
            let ambient: Vec<String> = guard.model().ambient_fields().to_vec();
            for field in ambient {
                if !guard.is_unset(&field) {
                    continue;
                }
                let value = overrides
                    .get(&field)
                    .filter(|v| !v.is_null())
                    .or_else(|| cached.get(&field).filter(|v| !v.is_null()));
                if let Some(value) = value {
                    guard.set(field, value.clone());
                    report.assigned += 1;
                }
            }
            for value in guard.fields().values() {
                collect_commands(value, depth + 1, &mut children, &mut report);
            }
        }
        queue.extend(children);
    }

    if report.skipped_too_deep > 0 {
        warn!(
            skipped = report.skipped_too_deep,
            max_depth = MAX_DEPTH,
            "command graph too deep, ambient values partially applied"
        );
    }
    debug!(
        visited = report.visited,
        assigned = report.assigned,
        "ambient values applied"
    );
    report
}

/// Nested commands reachable through containers, with their depth.
fn collect_commands(
    value: &FieldValue,
    depth: usize,
    out: &mut Vec<(CommandRef, usize)>,
    report: &mut ApplyReport,
) {
    let mut stack = vec![(value, depth)];
    while let Some((value, depth)) = stack.pop() {
        match value {
            FieldValue::Json(_) => {}
            FieldValue::Command(command) => out.push((command.clone(), depth)),
            FieldValue::List(_) | FieldValue::Map(_) if depth > MAX_DEPTH => {
                report.skipped_too_deep += 1;
            }
            FieldValue::List(items) => {
                stack.extend(items.iter().rev().map(|item| (item, depth + 1)));
            }
            FieldValue::Map(entries) => {
                stack.extend(entries.values().rev().map(|item| (item, depth + 1)));
            }
        }
    }
}
