//! Request entry point.
//!
//! [`CrisService::handle_request`] turns one request body into one envelope:
//! - checks the type filter name and decodes the command
//! - runs the incoming phase under the request's call context
//! - hands the command to the background executor when the shape asks for
//!   it or the ambient configuration adjusted the context, and awaits it
//! - otherwise finishes inline

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn, Instrument};

use crate::auth::{CapturedIdentity, IdentityProvider};
use crate::command::{Capability, Command, CommandDecoder, JsonCommandDecoder};
use crate::config::CrisConfig;
use crate::context::{AuthenticationInfo, CallContext, CurrentCulture};
use crate::deferred::{BackgroundExecutor, DeferredHandle};
use crate::envelope::{CrisCallResult, ExecutedCommand, LogKey};
use crate::error::{CrisError, Result};
use crate::message::UserMessage;
use crate::metrics::METRICS;
use crate::obs;
use crate::processor::CommandProcessor;
use crate::registry::CommandRegistry;

const TYPE_FILTER_PREFIX: &str = "TypeScript";
const FALLBACK_TYPE_FILTER: &str = "AllExchangeable";

/// What the transport knows about a request besides its body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestContext {
    pub culture: Option<String>,
    pub auth: AuthenticationInfo,
    pub type_filter_name: Option<String>,
    pub issuer: Option<String>,
}

impl RequestContext {
    pub fn new(auth: AuthenticationInfo) -> Self {
        Self {
            auth,
            ..Self::default()
        }
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = Some(culture.into());
        self
    }

    pub fn with_type_filter(mut self, name: impl Into<String>) -> Self {
        self.type_filter_name = Some(name.into());
        self
    }
}

/// Envelope plus the type filter the transport must serialize with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrisResponse {
    pub result: CrisCallResult,
    pub type_filter_name: String,
}

pub struct CrisServiceBuilder {
    registry: CommandRegistry,
    config: CrisConfig,
    identity: Arc<dyn IdentityProvider>,
    decoder: Arc<dyn CommandDecoder>,
}

impl CrisServiceBuilder {
    pub fn config(mut self, config: CrisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity_provider(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn decoder(mut self, decoder: impl CommandDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Validate the configuration and spawn the background executor.
    /// Must be called inside a Tokio runtime.
    pub fn start(self) -> Result<CrisService> {
        self.config.validate()?;
        let processor = Arc::new(CommandProcessor::new(Arc::new(self.registry), &self.config));
        let executor =
            BackgroundExecutor::start(Arc::clone(&processor), self.identity, &self.config.background);
        debug!(
            commands = processor.registry().len(),
            max_concurrency = self.config.background.max_concurrency,
            "cris service started"
        );
        Ok(CrisService {
            processor,
            config: self.config,
            decoder: self.decoder,
            executor,
        })
    }
}

pub struct CrisService {
    processor: Arc<CommandProcessor>,
    config: CrisConfig,
    decoder: Arc<dyn CommandDecoder>,
    executor: BackgroundExecutor,
}

impl CrisService {
    pub fn builder(registry: CommandRegistry) -> CrisServiceBuilder {
        CrisServiceBuilder {
            registry,
            config: CrisConfig::default(),
            identity: Arc::new(CapturedIdentity),
            decoder: Arc::new(JsonCommandDecoder),
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        self.processor.registry()
    }

    pub fn config(&self) -> &CrisConfig {
        &self.config
    }

    /// Call context of a request. A missing or unsupported request culture
    /// falls back to the default culture.
    pub fn call_context(&self, request: &RequestContext) -> CallContext {
        let culture = match request.culture.as_deref() {
            Some(name) if self.config.supported_cultures.iter().any(|c| c == name) => {
                name.to_string()
            }
            Some(name) => {
                debug!(
                    culture = %name,
                    fallback = %self.config.default_culture,
                    "unsupported request culture"
                );
                self.config.default_culture.clone()
            }
            None => self.config.default_culture.clone(),
        };
        CallContext {
            culture: CurrentCulture::new(culture),
            auth: request.auth.clone(),
            issuer: request.issuer.clone(),
        }
    }

    /// Handle one request body. Never fails: every problem ends up in the
    /// envelope.
    pub async fn handle_request(&self, payload: &[u8], request: &RequestContext) -> CrisResponse {
        METRICS.inc_commands_received();
        let requested = request
            .type_filter_name
            .as_deref()
            .unwrap_or(&self.config.default_type_filter_name);
        if !requested.starts_with(TYPE_FILTER_PREFIX) {
            warn!(type_filter_name = %requested, "invalid type filter name");
            let message = UserMessage::error(format!("Invalid TypeFilterName '{requested}'."))
                .with_code("Cris.InvalidTypeFilterName");
            return CrisResponse {
                result: self.processor.envelopes().request_failure(vec![message], None),
                type_filter_name: FALLBACK_TYPE_FILTER.to_string(),
            };
        }
        let type_filter_name = requested.to_string();

        let command = match self.decoder.decode(self.registry(), payload) {
            Ok(command) => command,
            Err(e) => {
                METRICS.inc_validation_failures();
                let log_key = e.is_logged().then(|| {
                    let key = LogKey::new();
                    warn!(
                        log_key = %key,
                        error = %e,
                        body = %String::from_utf8_lossy(payload),
                        "unable to read command"
                    );
                    key
                });
                return CrisResponse {
                    result: self.processor.envelopes().decode_failure(&e, log_key),
                    type_filter_name,
                };
            }
        };

        obs::emit_command_received(command.name(), &type_filter_name);
        let span = obs::command_span(command.name());
        let call = self.call_context(request);
        let result = match self.dispatch(Arc::new(command), call).instrument(span).await {
            Ok(executed) => executed.to_call_result(),
            Err(e) => self.background_failure(&e),
        };
        CrisResponse {
            result,
            type_filter_name,
        }
    }

    /// Like [`handle_request`](Self::handle_request) but gives up when
    /// `cancelled` completes first. Work already handed to the background
    /// executor still runs.
    pub async fn handle_request_until<F>(
        &self,
        payload: &[u8],
        request: &RequestContext,
        cancelled: F,
    ) -> Result<CrisResponse>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            response = self.handle_request(payload, request) => Ok(response),
            _ = cancelled => Err(CrisError::Cancelled),
        }
    }

    /// Run an already built command through the pipeline.
    pub async fn execute(&self, command: Command, call: CallContext) -> Result<ExecutedCommand> {
        let span = obs::command_span(command.name());
        self.dispatch(Arc::new(command), call).instrument(span).await
    }

    /// Queue a command for background execution under `call`.
    pub fn submit(
        &self,
        command: Command,
        call: CallContext,
        execute_at: Option<DateTime<Utc>>,
    ) -> Result<DeferredHandle> {
        self.executor
            .submitter()
            .submit(Arc::new(command), call, None, execute_at)
    }

    /// Stop the background executor and flush the counters.
    pub async fn shutdown(self) {
        self.executor.shutdown().await;
        METRICS.flush();
    }

    async fn dispatch(&self, command: Arc<Command>, call: CallContext) -> Result<ExecutedCommand> {
        let mut incoming = self.processor.validate_incoming(&command, &call).await;
        if !incoming.passed() {
            return Ok(self.processor.reject(command, incoming, false));
        }

        let background = command.has_capability(Capability::BackgroundExecution);
        let adjusted = incoming.adjusted.take();
        if background || adjusted.is_some() {
            let context = adjusted.unwrap_or(call);
            debug!(command = %command.name(), "routing to background executor");
            let handle = self
                .executor
                .submitter()
                .handoff(command, context, incoming)?;
            return handle.executed_command().await;
        }

        Ok(self
            .processor
            .complete(command, &call, incoming, Some(self.executor.submitter()), false)
            .await)
    }

    fn background_failure(&self, error: &CrisError) -> CrisCallResult {
        let key = LogKey::new();
        warn!(log_key = %key, error = %error, "background execution unavailable");
        let message = UserMessage::error(format!("Unable to execute the command: {error}."))
            .with_code("Cris.BackgroundUnavailable");
        self.processor
            .envelopes()
            .request_failure(vec![message], Some(key))
    }
}
