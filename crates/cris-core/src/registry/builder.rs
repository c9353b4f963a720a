use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::binding::{
    CommandHandler, CommandValidator, FnHandler, FnValidator, HandlerBinding, PostHandler,
    TypedHandler,
};
use super::{CommandRegistry, CommandShape, FieldCheck, ResultTypeCatalog};
use crate::ambient::{
    AmbientConfigurator, AmbientValueProvider, AmbientValuesCollectCommand, CollectAmbientValues,
    FnAmbientValue,
};
use crate::command::{Capability, CommandDef};
use crate::context::CallContext;
use crate::deferred::DeferredCommandListener;
use crate::error::{CrisError, Result};
use crate::execution::HandlerContext;
use crate::message::MessageCollector;
use crate::validation::{ValidationContext, ValidationPhase};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Command(String),
    Capability(Capability),
}

impl Target {
    fn applies_to(&self, name: &str, capabilities: &BTreeSet<Capability>) -> bool {
        match self {
            Target::Command(target) => target == name,
            Target::Capability(capability) => capabilities.contains(capability),
        }
    }
}

struct ShapeDraft {
    name: String,
    capabilities: BTreeSet<Capability>,
    result_facets: Vec<String>,
    ambient_fields: Vec<String>,
    field_check: FieldCheck,
}

struct ValidatorBinding {
    phase: ValidationPhase,
    target: Target,
    validator: Arc<dyn CommandValidator>,
}

fn check_fields<C: CommandDef>(fields: &Map<String, Value>) -> std::result::Result<(), String> {
    serde_json::from_value::<C>(Value::Object(fields.clone()))
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Collects registrations; [`RegistryBuilder::build`] resolves them once.
///
/// Validators run in registration order within their phase, whether they
/// were bound to a single command or to a capability marker.
pub struct RegistryBuilder {
    drafts: Vec<ShapeDraft>,
    validators: Vec<ValidatorBinding>,
    handlers: Vec<(String, Arc<dyn HandlerBinding>)>,
    post_handlers: Vec<(Target, Arc<dyn PostHandler>)>,
    providers: Vec<Arc<dyn AmbientValueProvider>>,
    configurators: Vec<Arc<dyn AmbientConfigurator>>,
    listeners: Vec<Arc<dyn DeferredCommandListener>>,
    result_types: ResultTypeCatalog,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// A builder that already knows [`AmbientValuesCollectCommand`].
    pub fn new() -> Self {
        Self {
            drafts: Vec::new(),
            validators: Vec::new(),
            handlers: Vec::new(),
            post_handlers: Vec::new(),
            providers: Vec::new(),
            configurators: Vec::new(),
            listeners: Vec::new(),
            result_types: ResultTypeCatalog::new(),
        }
        .command::<AmbientValuesCollectCommand>()
    }

    pub fn command<C: CommandDef>(mut self) -> Self {
        let capabilities = Capability::closure(C::capabilities());
        let mut ambient_fields: Vec<String> = Vec::new();
        let implied = capabilities.iter().filter_map(|c| c.ambient_field());
        for field in implied.chain(C::ambient_fields()) {
            if !ambient_fields.iter().any(|f| f == field) {
                ambient_fields.push(field.to_string());
            }
        }
        self.drafts.push(ShapeDraft {
            name: C::NAME.to_string(),
            capabilities,
            result_facets: C::result_facets().into_iter().map(str::to_string).collect(),
            ambient_fields,
            field_check: check_fields::<C>,
        });
        self
    }

    /// Declare a result type and the types it can be used as.
    pub fn result_type(mut self, name: &str, parents: &[&str]) -> Self {
        self.result_types.declare(name, parents);
        self
    }

    pub fn incoming_validator<C, F>(self, f: F) -> Self
    where
        C: CommandDef,
        F: Fn(&C, &ValidationContext<'_>, &mut MessageCollector) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let name = format!("{}.incoming", C::NAME);
        self.validator(
            ValidationPhase::Incoming,
            C::NAME,
            FnValidator::<C, F>::new(name, f),
        )
    }

    pub fn handling_validator<C, F>(self, f: F) -> Self
    where
        C: CommandDef,
        F: Fn(&C, &ValidationContext<'_>, &mut MessageCollector) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let name = format!("{}.handling", C::NAME);
        self.validator(
            ValidationPhase::Handling,
            C::NAME,
            FnValidator::<C, F>::new(name, f),
        )
    }

    /// Bind a validator to one command by name.
    pub fn validator(
        mut self,
        phase: ValidationPhase,
        command: &str,
        validator: impl CommandValidator + 'static,
    ) -> Self {
        self.validators.push(ValidatorBinding {
            phase,
            target: Target::Command(command.to_string()),
            validator: Arc::new(validator),
        });
        self
    }

    /// Bind a validator to every command carrying `capability`.
    pub fn validator_for(
        mut self,
        phase: ValidationPhase,
        capability: Capability,
        validator: impl CommandValidator + 'static,
    ) -> Self {
        self.validators.push(ValidatorBinding {
            phase,
            target: Target::Capability(capability),
            validator: Arc::new(validator),
        });
        self
    }

    pub fn handler<C, H>(mut self, handler: H) -> Self
    where
        C: CommandDef,
        H: CommandHandler<C>,
    {
        self.handlers.push((
            C::NAME.to_string(),
            Arc::new(TypedHandler::<C, H>::new(handler)),
        ));
        self
    }

    pub fn handler_fn<C, F, R>(self, f: F) -> Self
    where
        C: CommandDef,
        F: Fn(C, &mut HandlerContext<'_>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize + Send + 'static,
    {
        self.handler::<C, FnHandler<F, R>>(FnHandler::new(f))
    }

    pub fn post_handler<C: CommandDef>(mut self, post_handler: impl PostHandler + 'static) -> Self {
        self.post_handlers
            .push((Target::Command(C::NAME.to_string()), Arc::new(post_handler)));
        self
    }

    pub fn post_handler_for(
        mut self,
        capability: Capability,
        post_handler: impl PostHandler + 'static,
    ) -> Self {
        self.post_handlers
            .push((Target::Capability(capability), Arc::new(post_handler)));
        self
    }

    pub fn ambient_provider(mut self, provider: impl AmbientValueProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Contribute one ambient value computed from the call context.
    pub fn ambient_value_fn<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&CallContext) -> Value + Send + Sync + 'static,
    {
        self.ambient_provider(FnAmbientValue::new(name, f))
    }

    pub fn ambient_configurator(mut self, configurator: impl AmbientConfigurator + 'static) -> Self {
        self.configurators.push(Arc::new(configurator));
        self
    }

    pub fn deferred_listener(mut self, listener: impl DeferredCommandListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Resolve every binding.
    ///
    /// Fails on duplicate names, bindings to unknown commands, more than one
    /// handler per command and result facets that do not converge.
    pub fn build(mut self) -> Result<CommandRegistry> {
        let collect = CollectAmbientValues::new(std::mem::take(&mut self.providers));
        self = self.handler::<AmbientValuesCollectCommand, _>(collect);

        let mut known: BTreeSet<&str> = BTreeSet::new();
        for draft in &self.drafts {
            if !known.insert(draft.name.as_str()) {
                return Err(CrisError::DuplicateCommand(draft.name.clone()));
            }
        }

        let targeted = self
            .handlers
            .iter()
            .map(|(name, _)| name)
            .chain(self.validators.iter().filter_map(|v| match &v.target {
                Target::Command(name) => Some(name),
                Target::Capability(_) => None,
            }))
            .chain(self.post_handlers.iter().filter_map(|(t, _)| match t {
                Target::Command(name) => Some(name),
                Target::Capability(_) => None,
            }));
        for name in targeted {
            if !known.contains(name.as_str()) {
                return Err(CrisError::UnknownCommand(name.clone()));
            }
        }

        let mut handlers: HashMap<&str, Vec<&Arc<dyn HandlerBinding>>> = HashMap::new();
        for (name, handler) in &self.handlers {
            handlers.entry(name.as_str()).or_default().push(handler);
        }

        let mut shapes = BTreeMap::new();
        for draft in &self.drafts {
            let bound = handlers.get(draft.name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            if bound.len() > 1 {
                return Err(CrisError::MultipleHandlers {
                    command: draft.name.clone(),
                    count: bound.len(),
                });
            }
            let result_type = self.result_types.unify(&draft.result_facets).ok_or_else(|| {
                CrisError::ResultTypeConflict {
                    command: draft.name.clone(),
                    facets: draft.result_facets.clone(),
                }
            })?;

            let phase_validators = |phase: ValidationPhase| {
                self.validators
                    .iter()
                    .filter(|v| v.phase == phase && v.target.applies_to(&draft.name, &draft.capabilities))
                    .map(|v| Arc::clone(&v.validator))
                    .collect::<Vec<_>>()
            };
            let shape = CommandShape {
                name: draft.name.clone(),
                capabilities: draft.capabilities.clone(),
                result_type,
                ambient_fields: draft.ambient_fields.clone(),
                incoming: phase_validators(ValidationPhase::Incoming),
                handling: phase_validators(ValidationPhase::Handling),
                handler: bound.first().map(|h| Arc::clone(*h)),
                post_handlers: self
                    .post_handlers
                    .iter()
                    .filter(|(t, _)| t.applies_to(&draft.name, &draft.capabilities))
                    .map(|(_, p)| Arc::clone(p))
                    .collect(),
                field_check: draft.field_check,
            };
            debug!(
                command = %shape.name,
                result_type = %shape.result_type,
                incoming = shape.incoming.len(),
                handling = shape.handling.len(),
                has_handler = shape.handler.is_some(),
                "command shape registered"
            );
            shapes.insert(shape.name.clone(), Arc::new(shape));
        }

        Ok(CommandRegistry {
            shapes,
            result_types: self.result_types,
            configurators: self.configurators,
            listeners: self.listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Ping {}

    impl CommandDef for Ping {
        const NAME: &'static str = "Ping";
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Secured {
        #[allow(dead_code)]
        value: i32,
    }

    impl CommandDef for Secured {
        const NAME: &'static str = "Secured";

        fn capabilities() -> Vec<Capability> {
            vec![Capability::AuthNormal, Capability::AuthDeviceId]
        }

        fn ambient_fields() -> Vec<&'static str> {
            vec!["color", "actorId"]
        }
    }

    #[derive(Debug, Deserialize)]
    struct Unified {}

    impl CommandDef for Unified {
        const NAME: &'static str = "Unified";

        fn result_facets() -> Vec<&'static str> {
            vec!["IResult", "IMoreResult", "IAnotherResult"]
        }
    }

    #[test]
    fn test_builtin_ambient_values_command_is_registered() {
        let registry = RegistryBuilder::new().build().unwrap();
        let shape = registry.resolve(AmbientValuesCollectCommand::NAME).unwrap();
        assert!(shape.handler().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ambient_fields_follow_capabilities() {
        let registry = RegistryBuilder::new().command::<Secured>().build().unwrap();
        let shape = registry.resolve("Secured").unwrap();
        assert_eq!(shape.ambient_fields(), ["actorId", "deviceId", "color"]);
        assert!(shape.has_capability(Capability::AuthUnsafe));
    }

    #[test]
    fn test_two_handlers_is_a_startup_error() {
        let err = RegistryBuilder::new()
            .command::<Ping>()
            .handler_fn::<Ping, _, _>(|_, _| Ok(()))
            .handler_fn::<Ping, _, _>(|_, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, CrisError::MultipleHandlers { count: 2, .. }));
    }

    #[test]
    fn test_diverging_results_is_a_startup_error() {
        let err = RegistryBuilder::new()
            .result_type("IResult", &[])
            .result_type("IMoreResult", &["IResult"])
            .result_type("IAnotherResult", &["IResult"])
            .command::<Unified>()
            .build()
            .unwrap_err();
        assert!(matches!(err, CrisError::ResultTypeConflict { .. }));
    }

    #[test]
    fn test_binding_unknown_command_fails() {
        let err = RegistryBuilder::new()
            .handler_fn::<Ping, _, _>(|_, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, CrisError::UnknownCommand(name) if name == "Ping"));
    }

    #[test]
    fn test_duplicate_command_fails() {
        let err = RegistryBuilder::new()
            .command::<Ping>()
            .command::<Ping>()
            .build()
            .unwrap_err();
        assert!(matches!(err, CrisError::DuplicateCommand(_)));
    }

    #[test]
    fn test_command_without_handler_is_allowed() {
        let registry = RegistryBuilder::new().command::<Ping>().build().unwrap();
        assert!(registry.resolve("Ping").unwrap().handler().is_none());
    }
}
