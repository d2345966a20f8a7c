//! Configuration parsing and validation for llm-bridge.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::ProviderKind;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Logical listeners. Each one gets its own socket and its own model view.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    /// Upper bound for a single upstream completion call, in seconds.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

impl ServerConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.id.clone()).collect()
    }
}

/// A single logical listening endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Identifier referenced by `providers.available_endpoints`
    pub id: String,
    /// Address to listen on (e.g., "0.0.0.0:4321")
    pub listen: String,
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig {
        id: "general".to_string(),
        listen: "127.0.0.1:4321".to_string(),
    }]
}

fn default_upstream_timeout_secs() -> u64 {
    120
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Usage records older than this are purged. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_db_path() -> String {
    "./data/llm-bridge.db".to_string()
}

fn default_retention_days() -> u32 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

/// Circuit-breaker parameters for the health tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before a service is marked unhealthy
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Failures further apart than this do not accumulate
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Cooldown after the last failure before one probe is admitted
    #[serde(default = "default_recovery_time_secs")]
    pub recovery_time_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    5 * 60
}

fn default_recovery_time_secs() -> u64 {
    10 * 60
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            failure_window_secs: default_failure_window_secs(),
            recovery_time_secs: default_recovery_time_secs(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// A configured backend model: one vendor account paired with one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique identifier for this configuration
    pub id: String,
    /// Vendor family, selects URL/model/auth handling
    pub kind: ProviderKind,
    /// Base URL for the provider's API; empty means the kind's default
    #[serde(default)]
    pub base_url: String,
    /// Optional API key
    pub api_key: Option<ApiKey>,
    /// Model name as understood by the provider
    #[serde(default)]
    pub model_name: String,
    /// Name clients use to address this model
    #[serde(default)]
    pub public_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Endpoint ids this model is exposed on
    #[serde(default)]
    pub available_endpoints: HashSet<String>,
}

impl ProviderConfig {
    /// Key used by the health tracker for this configuration.
    pub fn service_id(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.id)
    }

    /// Base URL with the kind's default substituted when none is configured.
    pub fn effective_base_url(&self) -> &str {
        if self.base_url.is_empty() {
            self.kind.default_base_url()
        } else {
            &self.base_url
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to persist usage events to the database
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file without environment expansion.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_config_file(path.as_ref())?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let config = Self::from_raw_literal(raw);
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Unknown endpoint identifiers are rejected here so the endpoint filter
    /// never has to guess about them.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.endpoints.is_empty() {
            return Err(ConfigError::Validation(
                "At least one endpoint must be configured".to_string(),
            ));
        }

        let mut endpoint_ids = HashSet::new();
        for endpoint in &self.server.endpoints {
            if endpoint.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Endpoint id must not be empty".to_string(),
                ));
            }
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate endpoint id '{}'",
                    endpoint.id
                )));
            }
        }

        if self.providers.is_empty() {
            tracing::warn!("No providers configured - proxy will reject all requests");
        }

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err(ConfigError::Validation(
                    "Provider id must not be empty".to_string(),
                ));
            }
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.effective_base_url().is_empty() && provider.kind != ProviderKind::None {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' ({}) requires a base_url",
                    provider.id,
                    provider.kind.as_str()
                )));
            }
            for endpoint in &provider.available_endpoints {
                if !endpoint_ids.contains(endpoint.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' references unknown endpoint '{}'",
                        provider.id, endpoint
                    )));
                }
            }
            if provider.enabled
                && provider.kind.requires_api_key()
                && provider.api_key.is_none()
            {
                tracing::warn!(
                    provider = %provider.id,
                    kind = provider.kind.as_str(),
                    "Provider has no API key; upstream calls will likely be rejected"
                );
            }
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }

    /// Providers with `enabled = true`.
    pub fn enabled_providers(&self) -> Vec<ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled).cloned().collect()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// `api_key` may contain `${VAR}` references not yet expanded, and a missing
/// `available_endpoints` means "every endpoint".
#[derive(Deserialize)]
pub struct RawProviderConfig {
    id: String,
    kind: ProviderKind,
    #[serde(default)]
    base_url: String,
    api_key: Option<String>,
    #[serde(default)]
    model_name: String,
    #[serde(default)]
    public_name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    available_endpoints: Option<HashSet<String>>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    server: ServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_id: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_id.to_string(),
            message: "Unclosed '${' in api_key value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_id.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_id
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, provider_id: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, provider_id, |name| std::env::var(name).ok())
}

/// Derive the convention-based env var name for a provider.
///
/// - "openai-main" -> "LLM_BRIDGE_OPENAI_MAIN_API_KEY"
/// - "lab box" -> "LLM_BRIDGE_LAB_BOX_API_KEY"
pub fn convention_env_var_name(provider_id: &str) -> String {
    let upper_snake = provider_id.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("LLM_BRIDGE_{}_API_KEY", upper_snake)
}

fn convention_key_lookup(provider_id: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(provider_id);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

fn resolve_endpoints(
    declared: Option<HashSet<String>>,
    server: &ServerConfig,
) -> HashSet<String> {
    declared.unwrap_or_else(|| server.endpoint_ids().into_iter().collect())
}

impl Config {
    /// Raw config taken at face value: literal keys, no env lookups.
    fn from_raw_literal(raw: RawConfig) -> Self {
        let providers = raw
            .providers
            .into_iter()
            .map(|rp| ProviderConfig {
                available_endpoints: resolve_endpoints(rp.available_endpoints, &raw.server),
                id: rp.id,
                kind: rp.kind,
                base_url: rp.base_url,
                api_key: rp.api_key.map(ApiKey::from),
                model_name: rp.model_name,
                public_name: rp.public_name,
                enabled: rp.enabled,
            })
            .collect();

        Config {
            server: raw.server,
            database: raw.database,
            health: raw.health,
            providers,
            logging: raw.logging,
        }
    }

    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// For each provider:
    /// - `api_key` containing `${VAR}` is expanded, source = `EnvExpanded`
    /// - a literal `api_key` is wrapped directly, source = `Literal`
    /// - an absent `api_key` tries `LLM_BRIDGE_<ID>_API_KEY`,
    ///   source = `Convention(var_name)` or `KeySource::None`
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = match rp.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars(raw_key, &rp.id)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) if raw_key.is_empty() => (None, KeySource::None),
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => match convention_key_lookup(&rp.id) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
            };

            key_sources.push((rp.id.clone(), source));

            providers.push(ProviderConfig {
                available_endpoints: resolve_endpoints(rp.available_endpoints, &raw.server),
                id: rp.id,
                kind: rp.kind,
                base_url: rp.base_url,
                api_key,
                model_name: rp.model_name,
                public_name: rp.public_name,
                enabled: rp.enabled,
            });
        }

        let config = Config {
            server: raw.server,
            database: raw.database,
            health: raw.health,
            providers,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Parse a TOML string with environment variable expansion.
    pub fn parse_str_with_env(
        content: &str,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_config_file(path.as_ref())?;
        Self::parse_str_with_env(&content)
    }
}

/// Supplies the current provider configurations.
///
/// Called once at startup and again on every reload.
pub trait ConfigSource: Send + Sync {
    fn enabled_configs(&self) -> Result<Vec<ProviderConfig>, ConfigError>;
}

/// Re-reads a TOML file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn enabled_configs(&self) -> Result<Vec<ProviderConfig>, ConfigError> {
        let (config, _) = Config::from_file_with_env(&self.path)?;
        Ok(config.enabled_providers())
    }
}
