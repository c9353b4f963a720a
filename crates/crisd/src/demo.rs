//! Demo command set hosted by `crisd` and the transport status mapping.

use anyhow::Context;
use cris_core::{CommandDef, CommandRegistry, CrisCallResult, CrisConfig, RegistryBuilder};
use serde::{Deserialize, Serialize};

pub const STATUS_OK: u16 = 200;
pub const STATUS_VALIDATION_ERROR: u16 = 400;
pub const STATUS_EXECUTION_ERROR: u16 = 456;

/// Echoes its message back.
#[derive(Debug, Deserialize)]
pub struct Ping {
    #[serde(default)]
    pub message: Option<String>,
}

impl CommandDef for Ping {
    const NAME: &'static str = "Ping";

    fn result_facets() -> Vec<&'static str> {
        vec!["Pong"]
    }
}

#[derive(Debug, Serialize)]
pub struct Pong {
    pub message: String,
}

/// Integer division; a zero divisor is a validation error, overflow an
/// execution error.
#[derive(Debug, Deserialize)]
pub struct Divide {
    pub dividend: i64,
    pub divisor: i64,
}

impl CommandDef for Divide {
    const NAME: &'static str = "Divide";

    fn result_facets() -> Vec<&'static str> {
        vec!["Quotient"]
    }
}

pub fn registry(config: &CrisConfig) -> anyhow::Result<CommandRegistry> {
    RegistryBuilder::new()
        .result_type("Pong", &[])
        .result_type("Quotient", &[])
        .command::<Ping>()
        .command::<Divide>()
        .with_culture(config.supported_cultures.clone())
        .with_delayed_commands()
        .handler_fn::<Ping, _, _>(|cmd, ctx| {
            Ok(Pong {
                message: cmd
                    .message
                    .unwrap_or_else(|| format!("pong ({})", ctx.culture().name())),
            })
        })
        .handling_validator::<Divide, _>(|cmd, _, messages| {
            if cmd.divisor == 0 {
                messages.error_code("Divisor must not be zero.", "Demo.DivideByZero");
            }
            Ok(())
        })
        .handler_fn::<Divide, _, _>(|cmd, _| {
            cmd.dividend
                .checked_div(cmd.divisor)
                .with_context(|| format!("{} / {} overflows", cmd.dividend, cmd.divisor))
        })
        .build()
        .context("invalid demo registry")
}

/// Status code a transport answers with for this envelope.
pub fn status_code(result: &CrisCallResult) -> u16 {
    match result.error_triple() {
        None => STATUS_OK,
        Some((true, _, _)) => STATUS_VALIDATION_ERROR,
        Some((false, _, _)) => STATUS_EXECUTION_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cris_core::{AuthenticationInfo, CrisService, RequestContext};
    use serde_json::json;

    async fn call(payload: &str) -> CrisCallResult {
        let config = CrisConfig::default();
        let service = CrisService::builder(registry(&config).unwrap())
            .config(config)
            .start()
            .unwrap();
        let request = RequestContext::new(AuthenticationInfo::anonymous("test"));
        service.handle_request(payload.as_bytes(), &request).await.result
    }

    #[tokio::test]
    async fn test_ping_is_ok() {
        let result = call(r#"["Ping",{"message":"hi"}]"#).await;
        assert_eq!(status_code(&result), STATUS_OK);
        assert_eq!(result.result.payload(), Some(&json!({"message": "hi"})));
    }

    #[tokio::test]
    async fn test_zero_divisor_is_validation_error() {
        let result = call(r#"["Divide",{"dividend":1,"divisor":0}]"#).await;
        assert_eq!(status_code(&result), STATUS_VALIDATION_ERROR);
    }

    #[tokio::test]
    async fn test_overflow_is_execution_error() {
        let result = call(r#"["Divide",{"dividend":-9223372036854775808,"divisor":-1}]"#).await;
        assert_eq!(status_code(&result), STATUS_EXECUTION_ERROR);
        assert!(result.result.error().unwrap().has_log_key());
    }

    #[tokio::test]
    async fn test_unknown_command_is_validation_error() {
        let result = call(r#"["Nope",{}]"#).await;
        assert_eq!(status_code(&result), STATUS_VALIDATION_ERROR);
    }
}
