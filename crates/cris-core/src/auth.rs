//! Authentication part.
//!
//! - [`AuthenticationValidator`] is bound to every command carrying
//!   `AuthUnsafe` and checks the ambient identity fields against the call
//!   context
//! - [`AuthAmbientValues`] publishes those fields for the client cache
//! - [`IdentityProvider`] refreshes a captured identity before a deferred
//!   command runs

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::ambient::AmbientValueProvider;
use crate::command::{Capability, Command, ACTOR_ID, ACTUAL_ACTOR_ID, DEVICE_ID};
use crate::context::{AuthLevel, AuthenticationInfo, CallContext};
use crate::message::MessageCollector;
use crate::registry::{CommandValidator, RegistryBuilder};
use crate::validation::{ValidationContext, ValidationPhase};

/// Source of validated identities.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current identity for a previously captured one.
    async fn revalidate(&self, captured: &AuthenticationInfo) -> AuthenticationInfo;
}

/// Keeps the captured identity unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapturedIdentity;

#[async_trait]
impl IdentityProvider for CapturedIdentity {
    async fn revalidate(&self, captured: &AuthenticationInfo) -> AuthenticationInfo {
        captured.clone()
    }
}

/// In-memory sessions keyed by the actual (non impersonated) user id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, AuthenticationInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&self, info: AuthenticationInfo) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(info.actual_user_id, info);
    }

    pub fn logout(&self, user_id: i64) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&user_id).is_some()
    }

    /// Move a session to another device. Returns false without a session.
    pub fn rotate_device(&self, user_id: i64, device_id: impl Into<String>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(&user_id) {
            Some(session) => {
                session.device_id = device_id.into();
                true
            }
            None => false,
        }
    }

    pub fn current(&self, user_id: i64) -> Option<AuthenticationInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&user_id).cloned()
    }
}

#[async_trait]
impl IdentityProvider for SessionRegistry {
    async fn revalidate(&self, captured: &AuthenticationInfo) -> AuthenticationInfo {
        if captured.is_anonymous() && !captured.is_impersonated() {
            return captured.clone();
        }
        match self.current(captured.actual_user_id) {
            Some(session) => session,
            None => {
                debug!(user_id = captured.actual_user_id, "session gone, continuing as anonymous");
                AuthenticationInfo::anonymous(captured.device_id.clone())
            }
        }
    }
}

/// Incoming validator of the authentication markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthenticationValidator;

impl AuthenticationValidator {
    fn required_level(command: &Command) -> Option<AuthLevel> {
        if command.has_capability(Capability::AuthCritical) {
            Some(AuthLevel::Critical)
        } else if command.has_capability(Capability::AuthNormal) {
            Some(AuthLevel::Normal)
        } else {
            None
        }
    }

    fn check(command: &Command, auth: &AuthenticationInfo, messages: &mut MessageCollector) {
        let Some(actor) = command.field(ACTOR_ID) else {
            messages.error_code(
                "Invalid property: ActorId cannot be null.",
                "Cris.Auth.NullActorId",
            );
            return;
        };

        if let Some(required) = Self::required_level(command) {
            if auth.level < required {
                messages.error_code(
                    format!("Invalid authentication level: {required:?} is required."),
                    "Cris.Auth.InvalidLevel",
                );
                return;
            }
        }

        if actor.as_i64() != Some(auth.user_id) {
            messages.error_code(
                "Invalid actor identifier: the provided identifier doesn't match the current authentication.",
                "Cris.Auth.InvalidActorId",
            );
            return;
        }

        if command.has_capability(Capability::AuthImpersonation) {
            let actual = command.field(ACTUAL_ACTOR_ID).and_then(Value::as_i64);
            if actual != Some(auth.actual_user_id) {
                messages.error_code(
                    "Invalid actual actor identifier: the provided identifier doesn't match the current authentication.",
                    "Cris.Auth.InvalidActualActorId",
                );
                return;
            }
        }

        if command.has_capability(Capability::AuthDeviceId) {
            let device = command.field(DEVICE_ID).and_then(Value::as_str);
            if device != Some(auth.device_id.as_str()) {
                messages.error_code(
                    "Invalid device identifier: the provided identifier doesn't match the current authentication.",
                    "Cris.Auth.InvalidDeviceId",
                );
            }
        }
    }
}

#[async_trait]
impl CommandValidator for AuthenticationValidator {
    fn name(&self) -> &str {
        "Authentication"
    }

    async fn validate(
        &self,
        command: &Command,
        ctx: &ValidationContext<'_>,
        messages: &mut MessageCollector,
    ) -> anyhow::Result<()> {
        Self::check(command, ctx.auth(), messages);
        Ok(())
    }
}

/// Publishes `actorId`, `actualActorId` and `deviceId`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthAmbientValues;

#[async_trait]
impl AmbientValueProvider for AuthAmbientValues {
    async fn collect(&self, ctx: &CallContext, values: &mut Map<String, Value>) -> anyhow::Result<()> {
        values.insert(ACTOR_ID.to_string(), Value::from(ctx.auth.user_id));
        values.insert(ACTUAL_ACTOR_ID.to_string(), Value::from(ctx.auth.actual_user_id));
        values.insert(DEVICE_ID.to_string(), Value::from(ctx.auth.device_id.clone()));
        Ok(())
    }
}

impl RegistryBuilder {
    /// Register the authentication validator and ambient values.
    pub fn with_authentication(self) -> Self {
        self.validator_for(
            ValidationPhase::Incoming,
            Capability::AuthUnsafe,
            AuthenticationValidator,
        )
        .ambient_provider(AuthAmbientValues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandDef;
    use crate::registry::CommandRegistry;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Transfer {}

    impl CommandDef for Transfer {
        const NAME: &'static str = "Transfer";

        fn capabilities() -> Vec<Capability> {
            vec![Capability::AuthNormal, Capability::AuthDeviceId]
        }
    }

    fn registry() -> CommandRegistry {
        RegistryBuilder::new()
            .command::<Transfer>()
            .with_authentication()
            .build()
            .unwrap()
    }

    fn check(fields: Value, auth: &AuthenticationInfo) -> Vec<String> {
        let registry = registry();
        let Value::Object(fields) = fields else {
            panic!("fields must be an object");
        };
        let command = registry.create("Transfer", fields).unwrap();
        let mut messages = MessageCollector::new();
        AuthenticationValidator::check(&command, auth, &mut messages);
        messages.messages().iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn test_null_actor_stops_checks() {
        let auth = AuthenticationInfo::authenticated(3712, "Albert", "dev-1");
        let texts = check(json!({"actorId": null, "deviceId": "other"}), &auth);
        assert_eq!(texts, ["Invalid property: ActorId cannot be null."]);
    }

    #[test]
    fn test_level_checked_before_identity() {
        let auth = AuthenticationInfo::authenticated(3712, "Albert", "dev-1").with_level(AuthLevel::Unsafe);
        let texts = check(json!({"actorId": 1, "deviceId": "dev-1"}), &auth);
        assert_eq!(texts, ["Invalid authentication level: Normal is required."]);
    }

    #[test]
    fn test_device_mismatch() {
        let auth = AuthenticationInfo::authenticated(3712, "Albert", "dev-1");
        let texts = check(json!({"actorId": 3712, "deviceId": "dev-2"}), &auth);
        assert_eq!(
            texts,
            ["Invalid device identifier: the provided identifier doesn't match the current authentication."]
        );
    }

    #[test]
    fn test_matching_identity_passes() {
        let auth = AuthenticationInfo::authenticated(3712, "Albert", "dev-1");
        assert!(check(json!({"actorId": 3712, "deviceId": "dev-1"}), &auth).is_empty());
    }

    #[test]
    fn test_validator_bound_through_marker() {
        let registry = registry();
        let shape = registry.resolve("Transfer").unwrap();
        assert_eq!(shape.incoming_validators().len(), 1);
        assert_eq!(shape.incoming_validators()[0].name(), "Authentication");
    }

    #[tokio::test]
    async fn test_session_registry_revalidate() {
        let sessions = SessionRegistry::new();
        let captured = AuthenticationInfo::authenticated(3712, "Albert", "dev-1");
        sessions.login(captured.clone());
        assert_eq!(sessions.revalidate(&captured).await, captured);

        assert!(sessions.rotate_device(3712, "dev-2"));
        assert_eq!(sessions.revalidate(&captured).await.device_id, "dev-2");

        assert!(sessions.logout(3712));
        assert!(sessions.revalidate(&captured).await.is_anonymous());
    }
}
