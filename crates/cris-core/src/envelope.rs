//! Result envelopes.
//!
//! Wire shape:
//!
//! ```text
//! { "result": <payload|ErrorObject|null>, "validationMessages": [Message...] | null, "correlationId": string|null }
//! ErrorObject: { "isValidationError": bool, "errors": [Message...], "logKey": string|null }
//! ```
//!
//! The [`EnvelopeBuilder`] mints the correlation token once the outcome is
//! known and fills a missing log key from it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::command::Command;
use crate::error::DecodeError;
use crate::execution::ExecutionOutcome;
use crate::message::UserMessage;

/// Opaque token linking an error envelope to a log record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogKey(String);

impl LogKey {
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    fn from_uuid(id: Uuid) -> Self {
        Self(id.simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LogKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LogKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-request correlation token; never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationToken {
    id: Uuid,
    issued_at: DateTime<Utc>,
    key: LogKey,
}

impl CorrelationToken {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            issued_at: Utc::now(),
            key: LogKey::from_uuid(id),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Log key derived from the token, used when an error has none.
    pub fn key(&self) -> &LogKey {
        &self.key
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Error object of an envelope. `errors` holds only Error-level messages
/// and is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrisResultError {
    pub is_validation_error: bool,
    pub errors: Vec<UserMessage>,
    #[serde(default)]
    pub log_key: Option<String>,
}

impl CrisResultError {
    /// Keeps the Error-level messages; `None` when there is none.
    pub fn new(
        is_validation_error: bool,
        messages: impl IntoIterator<Item = UserMessage>,
        log_key: Option<LogKey>,
    ) -> Option<Self> {
        let errors: Vec<UserMessage> = messages.into_iter().filter(UserMessage::is_error).collect();
        if errors.is_empty() {
            return None;
        }
        Some(Self {
            is_validation_error,
            errors,
            log_key: log_key.map(|k| k.0),
        })
    }

    pub fn has_log_key(&self) -> bool {
        self.log_key.is_some()
    }
}

/// `result` member of an envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CrisResult {
    #[default]
    Void,
    Payload(Value),
    Error(CrisResultError),
}

impl CrisResult {
    /// Classify a raw JSON `result` member.
    ///
    /// An object with a boolean `isValidationError` and an `errors` array is
    /// read as an error object when `errors` holds only Error messages and is
    /// not empty. The wire format carries no other marker, so a success
    /// payload of that exact shape reads back as an error; result types must
    /// not use those two member names together.
    pub fn from_value(value: Value) -> Self {
        if value.is_null() {
            return CrisResult::Void;
        }
        let looks_like_error = value.get("isValidationError").is_some_and(Value::is_boolean)
            && value.get("errors").is_some_and(Value::is_array);
        if looks_like_error {
            if let Ok(error) = serde_json::from_value::<CrisResultError>(value.clone()) {
                if !error.errors.is_empty() && error.errors.iter().all(UserMessage::is_error) {
                    return CrisResult::Error(error);
                }
            }
        }
        CrisResult::Payload(value)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CrisResult::Error(_))
    }

    pub fn error(&self) -> Option<&CrisResultError> {
        match self {
            CrisResult::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            CrisResult::Payload(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for CrisResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CrisResult::Void => serializer.serialize_none(),
            CrisResult::Payload(value) => value.serialize(serializer),
            CrisResult::Error(error) => error.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CrisResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(CrisResult::from_value)
    }
}

/// Envelope as handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrisCallResult {
    #[serde(default)]
    pub result: CrisResult,
    #[serde(default)]
    pub validation_messages: Option<Vec<UserMessage>>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl CrisCallResult {
    /// `(isValidationError, hasLogKey, errors)` for status mapping; `None` on success.
    pub fn error_triple(&self) -> Option<(bool, bool, &[UserMessage])> {
        self.result
            .error()
            .map(|e| (e.is_validation_error, e.has_log_key(), e.errors.as_slice()))
    }
}

/// A processed command and its outcome.
#[derive(Debug, Clone)]
pub struct ExecutedCommand {
    pub command: Arc<Command>,
    pub result: CrisResult,
    pub validation_messages: Option<Vec<UserMessage>>,
    pub correlation_id: String,
    /// Produced by the background executor.
    pub deferred: bool,
}

impl ExecutedCommand {
    pub fn is_success(&self) -> bool {
        !self.result.is_error()
    }

    pub fn error(&self) -> Option<&CrisResultError> {
        self.result.error()
    }

    pub fn to_call_result(&self) -> CrisCallResult {
        CrisCallResult {
            result: self.result.clone(),
            validation_messages: self.validation_messages.clone(),
            correlation_id: Some(self.correlation_id.clone()),
        }
    }
}

/// What happened to a decoded command.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// A validation phase failed; the handler never ran.
    Rejected { log_key: Option<LogKey> },
    Executed(ExecutionOutcome),
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    log_key_for_missing_handler: bool,
}

impl EnvelopeBuilder {
    pub fn new(log_key_for_missing_handler: bool) -> Self {
        Self {
            log_key_for_missing_handler,
        }
    }

    /// Assemble the envelope of a command that reached the pipeline.
    pub fn build(
        &self,
        command: Arc<Command>,
        outcome: PipelineOutcome,
        messages: Vec<UserMessage>,
        deferred: bool,
    ) -> ExecutedCommand {
        let token = CorrelationToken::new();
        let (result, validation_messages) = match outcome {
            PipelineOutcome::Rejected { log_key } => {
                let error = CrisResultError::new(true, messages.iter().cloned(), log_key)
                    .unwrap_or_else(|| generic_error(true, command.name()));
                let keep = messages.iter().any(|m| !m.is_error());
                let error = with_fallback_key(error, &token);
                (CrisResult::Error(error), keep.then_some(messages))
            }
            PipelineOutcome::Executed(ExecutionOutcome::Success(payload)) => (
                payload.map_or(CrisResult::Void, CrisResult::Payload),
                non_empty(messages),
            ),
            PipelineOutcome::Executed(ExecutionOutcome::Fault { errors, log_key }) => {
                let error = CrisResultError::new(false, errors, Some(log_key))
                    .unwrap_or_else(|| generic_error(false, command.name()));
                let error = with_fallback_key(error, &token);
                (CrisResult::Error(error), non_empty(messages))
            }
            PipelineOutcome::Executed(ExecutionOutcome::NoHandler { errors }) => {
                let mut error = CrisResultError::new(false, errors, None)
                    .unwrap_or_else(|| generic_error(false, command.name()));
                if self.log_key_for_missing_handler {
                    error = with_fallback_key(error, &token);
                }
                (CrisResult::Error(error), non_empty(messages))
            }
        };
        ExecutedCommand {
            command,
            result,
            validation_messages,
            correlation_id: token.to_string(),
            deferred,
        }
    }

    /// Envelope for a request that never reached the pipeline. Only the
    /// log key given here is attached.
    pub fn request_failure(
        &self,
        messages: Vec<UserMessage>,
        log_key: Option<LogKey>,
    ) -> CrisCallResult {
        let token = CorrelationToken::new();
        let keep = messages.iter().any(|m| !m.is_error());
        let error = CrisResultError::new(true, messages.iter().cloned(), log_key).unwrap_or_else(|| {
            CrisResultError {
                is_validation_error: true,
                errors: vec![UserMessage::error("Unable to process the request.")],
                log_key: None,
            }
        });
        CrisCallResult {
            result: CrisResult::Error(error),
            validation_messages: keep.then_some(messages),
            correlation_id: Some(token.to_string()),
        }
    }

    pub fn decode_failure(&self, error: &DecodeError, log_key: Option<LogKey>) -> CrisCallResult {
        let message = UserMessage::error(format!("Unable to read command: {error}."))
            .with_code(error.code());
        self.request_failure(vec![message], log_key)
    }
}

fn with_fallback_key(mut error: CrisResultError, token: &CorrelationToken) -> CrisResultError {
    if error.log_key.is_none() {
        error.log_key = Some(token.key().to_string());
    }
    error
}

fn generic_error(is_validation_error: bool, command: &str) -> CrisResultError {
    CrisResultError {
        is_validation_error,
        errors: vec![UserMessage::error(format!(
            "An error occurred while processing command '{command}'."
        ))],
        log_key: None,
    }
}

fn non_empty(messages: Vec<UserMessage>) -> Option<Vec<UserMessage>> {
    (!messages.is_empty()).then_some(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_error_keeps_only_errors() {
        let e = CrisResultError::new(
            true,
            vec![UserMessage::info("i"), UserMessage::error("e")],
            None,
        )
        .unwrap();
        assert_eq!(e.errors.len(), 1);
        assert!(CrisResultError::new(true, vec![UserMessage::warn("w")], None).is_none());
    }

    #[test]
    fn test_error_lookalike_payloads_stay_payloads() {
        let empty = json!({"isValidationError": true, "errors": []});
        assert_eq!(CrisResult::from_value(empty.clone()), CrisResult::Payload(empty));

        let warnings = json!({
            "isValidationError": false,
            "errors": [{"level": "Warn", "text": "w", "code": null, "depth": 0}]
        });
        assert_eq!(CrisResult::from_value(warnings.clone()), CrisResult::Payload(warnings));
    }

    #[test]
    fn test_result_classification() {
        assert_eq!(CrisResult::from_value(Value::Null), CrisResult::Void);
        assert_eq!(
            CrisResult::from_value(json!({"total": 3})),
            CrisResult::Payload(json!({"total": 3}))
        );
        let err = CrisResult::from_value(json!({
            "isValidationError": false,
            "errors": [{"level": "Error", "text": "boom", "code": null, "depth": 0}],
            "logKey": "abc"
        }));
        assert!(err.is_error());
        assert_eq!(err.error().unwrap().log_key.as_deref(), Some("abc"));
    }

    #[test]
    fn test_void_envelope_serializes_nulls() {
        let envelope = CrisCallResult {
            result: CrisResult::Void,
            validation_messages: None,
            correlation_id: Some("c".into()),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"result": null, "validationMessages": null, "correlationId": "c"})
        );
    }

    #[test]
    fn test_envelope_round_trip_preserves_order_and_correlation() {
        let envelope = CrisCallResult {
            result: CrisResult::Error(CrisResultError {
                is_validation_error: true,
                errors: vec![UserMessage::error("second").with_code("X")],
                log_key: Some("k".into()),
            }),
            validation_messages: Some(vec![
                UserMessage::info("first"),
                UserMessage::error("second").with_code("X"),
                UserMessage::warn("third").with_depth(1),
            ]),
            correlation_id: Some("corr".into()),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let back: CrisCallResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_request_failure_has_no_fallback_key() {
        let builder = EnvelopeBuilder::default();
        let envelope = builder.decode_failure(&DecodeError::EmptyBody, None);
        let (is_validation, has_key, errors) = envelope.error_triple().unwrap();
        assert!(is_validation);
        assert!(!has_key);
        assert_eq!(errors[0].text, "Unable to read command: empty request body.");
        assert_eq!(errors[0].code.as_deref(), Some("Cris.EmptyBody"));
        assert!(envelope.validation_messages.is_none());
        assert!(envelope.correlation_id.is_some());
    }

    #[test]
    fn test_correlation_tokens_are_unique() {
        let a = CorrelationToken::new();
        let b = CorrelationToken::new();
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.key().as_str(), a.id().simple().to_string());
    }
}
