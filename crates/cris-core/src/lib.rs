//! Cris core library
//!
//! Command registry, two-phase validation, execution, result envelopes and
//! background execution for a typed command bus.

pub mod ambient;
pub mod auth;
pub mod command;
pub mod config;
pub mod context;
pub mod culture;
pub mod deferred;
pub mod delayed;
pub mod envelope;
pub mod error;
pub mod execution;
mod fault;
pub mod message;
pub mod metrics;
pub mod obs;
pub mod processor;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod validation;

pub use ambient::{
    AmbientConfigurator, AmbientValueProvider, AmbientValuesCollectCommand, FnAmbientValue,
};
pub use auth::{
    AuthAmbientValues, AuthenticationValidator, CapturedIdentity, IdentityProvider,
    SessionRegistry,
};
pub use command::{
    Capability, Command, CommandDecoder, CommandDef, JsonCommandDecoder, ACTOR_ID,
    ACTUAL_ACTOR_ID, CURRENT_CULTURE_NAME, DEVICE_ID,
};
pub use config::{BackgroundConfig, CrisConfig};
pub use context::{AuthLevel, AuthenticationInfo, CallContext, CurrentCulture};
pub use culture::{CultureAmbientValue, CultureConfigurator};
pub use deferred::{
    BackgroundExecutor, BackgroundSubmitter, DeferredCommandExecuted, DeferredCommandListener,
    DeferredHandle,
};
pub use delayed::DelayedCommand;
pub use envelope::{
    CorrelationToken, CrisCallResult, CrisResult, CrisResultError, EnvelopeBuilder,
    ExecutedCommand, LogKey, PipelineOutcome,
};
pub use error::{CrisError, DecodeError, Result};
pub use execution::{ExecutionEngine, ExecutionOutcome, HandlerContext};
pub use message::{MessageCollector, MessageGroup, MessageLevel, UserMessage};
pub use metrics::METRICS;
pub use processor::{CommandProcessor, IncomingValidation};
pub use registry::{
    CommandHandler, CommandRegistry, CommandShape, CommandValidator, DynValidator, FnHandler,
    FnValidator, PostHandler, RegistryBuilder, ResultType, ResultTypeCatalog,
};
pub use service::{CrisResponse, CrisService, CrisServiceBuilder, RequestContext};
pub use telemetry::init_tracing;
pub use validation::{
    ValidationContext, ValidationPhase, ValidationPipeline, ValidationRun, ValidationState,
};

/// Cris version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
