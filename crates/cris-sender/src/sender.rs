//! Retrying command sender with an ambient value cache.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use cris_core::{AmbientValuesCollectCommand, CommandDef, CrisCallResult, CrisResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ambient::apply_ambient_values;
use crate::command::CommandRef;
use crate::error::{CommunicationError, Result, SenderError, TransportError};
use crate::transport::Transport;

/// Retry policy of a sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SenderConfig {
    /// Attempts per send, the first one included.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
    /// Wall-clock limit of one attempt (milliseconds).
    pub timeout_ms: u64,
}

impl SenderConfig {
    /// Longest pause between two attempts.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// Pause after failed attempt `attempt` (1-based), capped at
    /// [`MAX_BACKOFF`](Self::MAX_BACKOFF).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor)).min(Self::MAX_BACKOFF)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 100,
            timeout_ms: 30_000,
        }
    }
}

pub struct CrisSender<T> {
    transport: T,
    config: SenderConfig,
    ambient: Mutex<Option<Map<String, Value>>>,
    overrides: RwLock<Map<String, Value>>,
}

impl<T: Transport> CrisSender<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SenderConfig::default())
    }

    pub fn with_config(transport: T, config: SenderConfig) -> Self {
        Self {
            transport,
            config,
            ambient: Mutex::new(None),
            overrides: RwLock::new(Map::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Value used for `field` before the cached server value. `null`
    /// removes the override.
    pub fn set_override(&self, field: impl Into<String>, value: Value) {
        let mut overrides = self.overrides.write().unwrap_or_else(PoisonError::into_inner);
        let field = field.into();
        if value.is_null() {
            overrides.remove(&field);
        } else {
            overrides.insert(field, value);
        }
    }

    pub fn overrides(&self) -> Map<String, Value> {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch the server's ambient values and replace the cache.
    pub async fn update_ambient_values(&self) -> Result<Map<String, Value>> {
        let mut cache = self.ambient.lock().await;
        let values = self.fetch_ambient_values().await?;
        *cache = Some(values.clone());
        Ok(values)
    }

    /// Cached ambient values, fetched on first use.
    pub async fn ambient_values(&self) -> Result<Map<String, Value>> {
        let mut cache = self.ambient.lock().await;
        if let Some(values) = cache.as_ref() {
            return Ok(values.clone());
        }
        let values = self.fetch_ambient_values().await?;
        *cache = Some(values.clone());
        Ok(values)
    }

    /// Apply ambient values once, then send with retries.
    ///
    /// Error envelopes are returned as-is; only transport failures are `Err`.
    pub async fn send(&self, command: &CommandRef) -> Result<CrisCallResult> {
        let cached = self.ambient_values().await?;
        let report = apply_ambient_values(command, &cached, &self.overrides());
        let wire = command.to_wire()?;
        debug!(
            command = %command.name(),
            visited = report.visited,
            assigned = report.assigned,
            "sending command"
        );
        Ok(self.send_wire(&wire).await?)
    }

    /// Like [`send`](Self::send) but an error envelope becomes
    /// [`SenderError::CommandFailed`].
    pub async fn send_or_throw(&self, command: &CommandRef) -> Result<CrisCallResult> {
        let envelope = self.send(command).await?;
        if let Some(error) = envelope.result.error() {
            let message = error
                .errors
                .iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            return Err(SenderError::CommandFailed {
                command: command.name(),
                is_validation_error: error.is_validation_error,
                message,
                log_key: error.log_key.clone(),
            });
        }
        Ok(envelope)
    }

    /// Send and deserialize the payload; void results read as `null`.
    pub async fn send_and_get_result<R: DeserializeOwned>(&self, command: &CommandRef) -> Result<R> {
        let envelope = self.send_or_throw(command).await?;
        let payload = envelope.result.payload().cloned().unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(|e| SenderError::UnexpectedResult {
            command: command.name(),
            reason: e.to_string(),
        })
    }

    async fn fetch_ambient_values(&self) -> Result<Map<String, Value>> {
        let wire = Value::Array(vec![
            Value::String(AmbientValuesCollectCommand::NAME.to_string()),
            Value::Object(Map::new()),
        ]);
        let envelope = self.send_wire(&wire).await?;
        match envelope.result {
            CrisResult::Payload(Value::Object(values)) => Ok(values),
            other => Err(SenderError::UnexpectedResult {
                command: AmbientValuesCollectCommand::NAME.to_string(),
                reason: format!("expected an object, got {other:?}"),
            }),
        }
    }

    async fn send_wire(&self, wire: &Value) -> std::result::Result<CrisCallResult, CommunicationError> {
        let max_attempts = self.config.max_attempts.max(1);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempt = 1;
        loop {
            let error = match tokio::time::timeout(timeout, self.transport.send(wire)).await {
                Ok(Ok(envelope)) => return Ok(envelope),
                Ok(Err(e)) => e,
                Err(_elapsed) => TransportError::Timeout(timeout),
            };
            if attempt == max_attempts {
                warn!(attempts = attempt, error = %error, "giving up on command");
                return Err(CommunicationError {
                    attempts: attempt,
                    source: error,
                });
            }
            let delay = self.config.backoff_delay(attempt);
            warn!(attempt = attempt, error = %error, delay_ms = delay.as_millis() as u64, "transport failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_config_default() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.backoff_base_ms, 100);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(cfg.backoff_delay(64), SenderConfig::MAX_BACKOFF);
        assert_eq!(cfg.backoff_delay(u32::MAX), SenderConfig::MAX_BACKOFF);

        let immediate = SenderConfig {
            backoff_base_ms: 0,
            ..SenderConfig::default()
        };
        assert_eq!(immediate.backoff_delay(80), Duration::ZERO);
    }
}
