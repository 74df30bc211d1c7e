//! Layered session configuration and credential resolution

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable consulted when no access key is configured
pub const ACCESS_KEY_ENV: &str = "BROWSERSTACK_ACCESS_KEY";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unrecognized configuration key: {0}")]
    UnrecognizedKey(String),

    #[error("Invalid value for {key}: expected {expected}")]
    InvalidValue { key: String, expected: &'static str },

    #[error("Failed to read config file: {0}")]
    ReadFailed(String),

    #[error("Failed to parse config file: {0}")]
    ParseFailed(String),
}

/// Recognized configuration keys
///
/// `Key` and `ApiKey` are synonyms; both set the access-key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Username,
    Key,
    ApiKey,
    LocalConfig,
    Capabilities,
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "username" => Ok(ConfigKey::Username),
            "key" => Ok(ConfigKey::Key),
            "api_key" => Ok(ConfigKey::ApiKey),
            "local_config" => Ok(ConfigKey::LocalConfig),
            "capabilities" => Ok(ConfigKey::Capabilities),
            other => Err(ConfigError::UnrecognizedKey(other.to_string())),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Account username
    pub username: String,

    /// Account access key
    pub access_key: String,

    /// Options forwarded to the local tunnel binary
    pub tunnel_options: Map<String, Value>,

    /// Capability overrides merged over the defaults
    pub capability_overrides: Map<String, Value>,
}

impl SessionConfig {
    /// Apply a keyed value mapping
    ///
    /// Every key must be a recognized [`ConfigKey`]; anything else fails
    /// immediately rather than being silently ignored.
    pub fn apply(&mut self, values: &Map<String, Value>) -> Result<&mut Self, ConfigError> {
        for (name, value) in values {
            match name.parse::<ConfigKey>()? {
                ConfigKey::Username => {
                    self.set_username(expect_str(name, value)?);
                }
                ConfigKey::Key | ConfigKey::ApiKey => {
                    self.set_access_key(expect_str(name, value)?);
                }
                ConfigKey::LocalConfig => {
                    self.set_tunnel_options(expect_map(name, value)?);
                }
                ConfigKey::Capabilities => {
                    self.set_capabilities(expect_map(name, value)?);
                }
            }
        }
        Ok(self)
    }

    /// Set the account username
    pub fn set_username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = username.into();
        self
    }

    /// Set the account access key
    pub fn set_access_key(&mut self, access_key: impl Into<String>) -> &mut Self {
        self.access_key = access_key.into();
        debug!("Access key set ({})", mask(&self.access_key));
        self
    }

    /// Replace the tunnel option mapping wholesale
    pub fn set_tunnel_options(&mut self, options: Map<String, Value>) -> &mut Self {
        self.tunnel_options = options;
        self
    }

    /// Replace the capability override mapping wholesale
    pub fn set_capabilities(&mut self, capabilities: Map<String, Value>) -> &mut Self {
        self.capability_overrides = capabilities;
        self
    }

    /// Resolve the access key through the fallback chain
    ///
    /// Order: configured value, then the process environment. Returns `None`
    /// when both are empty.
    pub fn resolve_access_key(&self, env: &dyn EnvProvider) -> Option<String> {
        if !self.access_key.is_empty() {
            return Some(self.access_key.clone());
        }
        env.var(ACCESS_KEY_ENV).filter(|v| !v.is_empty())
    }
}

fn expect_str(key: &str, value: &Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            expected: "string",
        })
}

fn expect_map(key: &str, value: &Value) -> Result<Map<String, Value>, ConfigError> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            expected: "table",
        })
}

/// Source of environment-provided fallback values
///
/// Seam over the process environment so tests can inject a fake provider
/// instead of mutating real environment variables.
#[cfg_attr(test, mockall::automock)]
pub trait EnvProvider: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads from the real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvProvider for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Read the `services.browserstack` table from an application config file
///
/// A missing file or missing section yields an empty mapping; the caller
/// feeds the result through [`SessionConfig::apply`].
pub fn load_application_section(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    if !path.exists() {
        debug!("No application config at {}", path.display());
        return Ok(Map::new());
    }

    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed(e.to_string()))?;

    let doc: toml::Value =
        toml::from_str(&raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;

    let section = doc
        .get("services")
        .and_then(|services| services.get("browserstack"));

    match section {
        Some(table) => {
            let value = serde_json::to_value(table)
                .map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
            let map = value.as_object().cloned().ok_or(ConfigError::InvalidValue {
                key: "services.browserstack".to_string(),
                expected: "table",
            })?;
            info!(
                "Loaded application config from {} ({} keys)",
                path.display(),
                map.len()
            );
            Ok(map)
        }
        None => Ok(Map::new()),
    }
}

/// Masked prefix for logging secrets
pub(crate) fn mask(secret: &str) -> String {
    let shown: String = secret.chars().take(4).collect();
    format!("{}...", shown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_apply_unknown_key_fails() {
        let mut config = SessionConfig::default();
        let result = config.apply(&map(json!({ "usernme": "u" })));

        assert!(matches!(result, Err(ConfigError::UnrecognizedKey(k)) if k == "usernme"));
    }

    #[test]
    fn test_key_and_api_key_are_synonyms() {
        let mut config = SessionConfig::default();
        config.apply(&map(json!({ "key": "first" }))).unwrap();
        assert_eq!(config.access_key, "first");

        config.apply(&map(json!({ "api_key": "second" }))).unwrap();
        assert_eq!(config.access_key, "second");
    }

    #[test]
    fn test_apply_sets_all_fields() {
        let mut config = SessionConfig::default();
        config
            .apply(&map(json!({
                "username": "u",
                "key": "k",
                "local_config": { "verbose": true },
                "capabilities": { "browserName": "firefox" },
            })))
            .unwrap();

        assert_eq!(config.username, "u");
        assert_eq!(config.access_key, "k");
        assert_eq!(config.tunnel_options["verbose"], json!(true));
        assert_eq!(config.capability_overrides["browserName"], json!("firefox"));
    }

    #[test]
    fn test_set_capabilities_replaces_wholesale() {
        let mut config = SessionConfig::default();
        config.set_capabilities(map(json!({ "a": 1, "b": 2 })));
        config.set_capabilities(map(json!({ "c": 3 })));

        assert!(!config.capability_overrides.contains_key("a"));
        assert_eq!(config.capability_overrides["c"], json!(3));
    }

    #[test]
    fn test_apply_rejects_scalar_for_mapping_key() {
        let mut config = SessionConfig::default();
        let result = config.apply(&map(json!({ "capabilities": "chrome" })));

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_setters_chain() {
        let mut config = SessionConfig::default();
        config.set_username("u").set_access_key("k");

        assert_eq!(config.username, "u");
        assert_eq!(config.access_key, "k");
    }

    #[test]
    fn test_resolve_access_key_prefers_configured_value() {
        let mut env = MockEnvProvider::new();
        env.expect_var().never();

        let mut config = SessionConfig::default();
        config.set_access_key("stored");

        assert_eq!(config.resolve_access_key(&env).as_deref(), Some("stored"));
    }

    #[test]
    fn test_resolve_access_key_falls_back_to_environment() {
        let mut env = MockEnvProvider::new();
        env.expect_var()
            .withf(|name| name == ACCESS_KEY_ENV)
            .return_const(Some("ENVKEY".to_string()));

        let config = SessionConfig::default();

        assert_eq!(config.resolve_access_key(&env).as_deref(), Some("ENVKEY"));
    }

    #[test]
    fn test_resolve_access_key_empty_everywhere() {
        let mut env = MockEnvProvider::new();
        env.expect_var().return_const(None::<String>);

        let config = SessionConfig::default();

        assert!(config.resolve_access_key(&env).is_none());
    }

    #[test]
    fn test_load_application_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            r#"
[services.browserstack]
username = "u"
key = "k"

[services.browserstack.capabilities]
browserName = "edge"
"#,
        )
        .unwrap();

        let section = load_application_section(&path).unwrap();
        assert_eq!(section["username"], json!("u"));
        assert_eq!(section["key"], json!("k"));
        assert_eq!(section["capabilities"]["browserName"], json!("edge"));
    }

    #[test]
    fn test_load_application_section_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let section = load_application_section(&dir.path().join("absent.toml")).unwrap();

        assert!(section.is_empty());
    }

    #[test]
    fn test_load_application_section_missing_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(&path, "[services.other]\nfoo = 1\n").unwrap();

        let section = load_application_section(&path).unwrap();
        assert!(section.is_empty());
    }

    #[test]
    fn test_mask_never_reveals_full_secret() {
        assert_eq!(mask("abcdefgh"), "abcd...");
        assert_eq!(mask("ab"), "ab...");
    }
}
