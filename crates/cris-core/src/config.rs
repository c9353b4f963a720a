//! Host configuration of the command pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CrisError, Result};

/// Environment variable switching permissive error detail on or off.
pub const EXPOSE_ERROR_DETAIL_ENV: &str = "CRIS_EXPOSE_ERROR_DETAIL";

/// Limits of the background executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Deferred commands executing at the same time.
    pub max_concurrency: usize,
    /// Pending submissions before `submit` fails with `QueueFull`.
    pub queue_capacity: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrisConfig {
    /// Copy fault chains into user messages (development hosts only).
    pub expose_internal_error_detail: bool,
    /// Type filter used when a request names none.
    pub default_type_filter_name: String,
    /// Culture used when a request carries none.
    pub default_culture: String,
    /// Request cultures outside this list fall back to `default_culture`.
    pub supported_cultures: Vec<String>,
    /// Attach the fallback log key to "no handler" errors.
    pub log_key_for_missing_handler: bool,
    pub background: BackgroundConfig,
}

impl Default for CrisConfig {
    fn default() -> Self {
        Self {
            expose_internal_error_detail: false,
            default_type_filter_name: "TypeScript".to_string(),
            default_culture: "en".to_string(),
            supported_cultures: vec!["en".to_string()],
            log_key_for_missing_handler: false,
            background: BackgroundConfig::default(),
        }
    }
}

impl CrisConfig {
    /// Load a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: CrisConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CRIS_EXPOSE_ERROR_DETAIL` when set to `1|true|0|false`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(EXPOSE_ERROR_DETAIL_ENV) {
            match parse_flag(&raw) {
                Some(flag) => self.expose_internal_error_detail = flag,
                None => tracing::warn!(
                    variable = EXPOSE_ERROR_DETAIL_ENV,
                    value = %raw,
                    "ignoring unrecognized flag value"
                ),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_type_filter_name.trim().is_empty() {
            return Err(CrisError::InvalidConfig(
                "default_type_filter_name must not be empty".to_string(),
            ));
        }
        if self.default_culture.trim().is_empty() {
            return Err(CrisError::InvalidConfig(
                "default_culture must not be empty".to_string(),
            ));
        }
        if !self.supported_cultures.iter().any(|c| c == &self.default_culture) {
            return Err(CrisError::InvalidConfig(format!(
                "default culture '{}' is not in supported_cultures",
                self.default_culture
            )));
        }
        if self.background.max_concurrency == 0 || self.background.queue_capacity == 0 {
            return Err(CrisError::InvalidConfig(
                "background limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}
