//! Validator, handler and post-handler bindings.
//!
//! The registry stores type-erased bindings that work on a decoded
//! [`Command`]. Typed adapters decode the command into its [`CommandDef`]
//! type before calling user code.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::command::{Command, CommandDef};
use crate::context::CallContext;
use crate::execution::HandlerContext;
use crate::message::MessageCollector;
use crate::validation::ValidationContext;

/// A validator bound to one phase.
///
/// Expected failures are reported by appending Error messages. An `Err`
/// (or a panic) is an unexpected fault and is turned into a system message
/// with a log key by the pipeline.
#[async_trait]
pub trait CommandValidator: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn validate(
        &self,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> anyhow::Result<()>;
}

/// Typed command handler.
#[async_trait]
pub trait CommandHandler<C: CommandDef>: Send + Sync + 'static {
    type Output: Serialize + Send;

    async fn handle(&self, command: C, ctx: &mut HandlerContext<'_>) -> anyhow::Result<Self::Output>;
}

/// Type-erased handler as stored on a shape. `None` means a void result.
#[async_trait]
pub trait HandlerBinding: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        command: &Command,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<Option<Value>>;
}

/// Side-effect hook run after a successful handler.
#[async_trait]
pub trait PostHandler: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn after(
        &self,
        command: &Command,
        result: Option<&Value>,
        ctx: &CallContext,
    ) -> anyhow::Result<()>;
}

/// Synchronous validator over the typed command.
pub struct FnValidator<C, F> {
    name: String,
    f: F,
    _command: PhantomData<fn() -> C>,
}

impl<C, F> FnValidator<C, F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F> CommandValidator for FnValidator<C, F>
where
    C: CommandDef,
    F: Fn(&C, &ValidationContext<'_>, &mut MessageCollector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> anyhow::Result<()> {
        let typed: C = command.decode()?;
        (self.f)(&typed, ctx, messages)
    }
}

/// Synchronous validator over the raw command; used for marker-bound parts.
pub struct DynValidator<F> {
    name: String,
    f: F,
}

impl<F> DynValidator<F>
where
    F: Fn(&Command, &ValidationContext<'_>, &mut MessageCollector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> CommandValidator for DynValidator<F>
where
    F: Fn(&Command, &ValidationContext<'_>, &mut MessageCollector) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> anyhow::Result<()> {
        (self.f)(command, ctx, messages)
    }
}

/// Synchronous handler closure.
pub struct FnHandler<F, R> {
    f: F,
    _output: PhantomData<fn() -> R>,
}

impl<F, R> FnHandler<F, R> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F, R> CommandHandler<C> for FnHandler<F, R>
where
    C: CommandDef,
    F: Fn(C, &mut HandlerContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Serialize + Send + 'static,
{
    type Output = R;

    async fn handle(&self, command: C, ctx: &mut HandlerContext<'_>) -> anyhow::Result<R> {
        (self.f)(command, ctx)
    }
}

/// Erases a typed handler.
pub(crate) struct TypedHandler<C, H> {
    name: String,
    handler: H,
    _command: PhantomData<fn() -> C>,
}

impl<C, H> TypedHandler<C, H>
where
    C: CommandDef,
    H: CommandHandler<C>,
{
    pub(crate) fn new(handler: H) -> Self {
        Self {
            name: std::any::type_name::<H>().to_string(),
            handler,
            _command: PhantomData,
        }
    }
}

#[async_trait]
impl<C, H> HandlerBinding for TypedHandler<C, H>
where
    C: CommandDef,
    H: CommandHandler<C>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        command: &Command,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<Option<Value>> {
        let typed: C = command.decode()?;
        let output = self.handler.handle(typed, ctx).await?;
        let value = serde_json::to_value(output)?;
        Ok(if value.is_null() { None } else { Some(value) })
    }
}
