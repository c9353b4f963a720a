//! Call context: culture and authenticated identity supplied by the host.

use serde::{Deserialize, Serialize};

/// Culture a command runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrentCulture {
    name: String,
}

impl CurrentCulture {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for CurrentCulture {
    fn default() -> Self {
        Self::new("en")
    }
}

/// Authentication strength, ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AuthLevel {
    #[default]
    None,
    Unsafe,
    Normal,
    Critical,
}

/// Identity validated by the authentication collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationInfo {
    pub level: AuthLevel,
    pub user_id: i64,
    pub user_name: String,
    /// Differs from `user_id` when impersonating.
    pub actual_user_id: i64,
    pub device_id: String,
}

impl AuthenticationInfo {
    /// Anonymous identity (user 0) on the given device.
    pub fn anonymous(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Normally authenticated user on a device.
    pub fn authenticated(user_id: i64, user_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            level: AuthLevel::Normal,
            user_id,
            user_name: user_name.into(),
            actual_user_id: user_id,
            device_id: device_id.into(),
        }
    }

    pub fn with_level(mut self, level: AuthLevel) -> Self {
        self.level = level;
        self
    }

    pub fn impersonating(mut self, user_id: i64, user_name: impl Into<String>) -> Self {
        self.user_id = user_id;
        self.user_name = user_name.into();
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == 0
    }

    pub fn is_impersonated(&self) -> bool {
        self.user_id != self.actual_user_id
    }
}

/// Contextual inputs available to validators, handlers and post-handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub culture: CurrentCulture,
    pub auth: AuthenticationInfo,
    /// Opaque token naming who issued the call.
    pub issuer: Option<String>,
}

impl CallContext {
    pub fn new(culture: CurrentCulture, auth: AuthenticationInfo) -> Self {
        Self {
            culture,
            auth,
            issuer: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_culture(mut self, culture: CurrentCulture) -> Self {
        self.culture = culture;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_levels_are_ordered() {
        assert!(AuthLevel::None < AuthLevel::Unsafe);
        assert!(AuthLevel::Unsafe < AuthLevel::Normal);
        assert!(AuthLevel::Normal < AuthLevel::Critical);
    }

    #[test]
    fn test_impersonation() {
        let auth = AuthenticationInfo::authenticated(3712, "Albert", "dev-1").impersonating(7, "Bob");
        assert!(auth.is_impersonated());
        assert_eq!(auth.actual_user_id, 3712);
        assert_eq!(auth.user_id, 7);
        assert!(!AuthenticationInfo::anonymous("dev-1").is_impersonated());
    }
}
