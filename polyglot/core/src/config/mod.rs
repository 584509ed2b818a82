//! TOML Configuration File Support
//!
//! Centralized configuration for the orchestrator, loaded from
//! `~/.config/polyglot/polyglot.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backends]
//! base_url = "http://localhost:8080"
//! request_timeout_secs = 120
//!
//! [backends.display_names]
//! "fw-mistral-7b" = "Mistral"
//!
//! [routing]
//! enabled = true
//! classifier = "GPT-4"
//! mandatory = ["GPT-4", "Claude-2-100k"]
//!
//! declared = ["GrandmaGPT"]
//!
//! [[routing.optional]]
//! predicate = "is_related_to_cooking"
//! backend = "leocooks"
//!
//! [enrichment]
//! web_search = false
//!
//! [streaming]
//! channel_capacity = 100
//!
//! [dependencies]
//! max_backends = 10
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::Label;

/// Default HTTP endpoint for bot requests
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Default upper bound on distinct declared backends
pub const DEFAULT_MAX_BACKENDS: usize = 10;

/// Default capacity of every fragment channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Default per-backend idle timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Gate from a routing predicate to an optional backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalBackend {
    /// Verdict key that must be `true`
    pub predicate: String,
    /// Backend added when it is
    pub backend: String,
}

impl OptionalBackend {
    /// Create a routing rule
    pub fn new(predicate: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            backend: backend.into(),
        }
    }
}

/// Backends section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsToml {
    /// HTTP endpoint for bot requests
    pub base_url: Option<String>,

    /// Longest silence allowed from a backend, in seconds (0 = no timeout)
    pub request_timeout_secs: Option<u64>,

    /// Backend id to display name
    pub display_names: Option<BTreeMap<String, String>>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Whether the classification call is made
    pub enabled: Option<bool>,

    /// Backend that classifies requests
    pub classifier: Option<String>,

    /// Backends queried for every request
    pub mandatory: Option<Vec<String>>,

    /// Predicate-gated backends
    pub optional: Option<Vec<OptionalBackend>>,

    /// Backends declared as dependencies but never routed to
    pub declared: Option<Vec<String>>,
}

/// Enrichment section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentToml {
    /// Whether web search enrichment is enabled
    pub web_search: Option<bool>,

    /// Enrichment backend id
    pub backend: Option<String>,

    /// Predicate that gates enrichment
    pub predicate: Option<String>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Capacity of every fragment channel
    pub channel_capacity: Option<usize>,
}

/// Dependencies section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenciesToml {
    /// Maximum number of distinct declared backends
    pub max_backends: Option<usize>,

    /// Backend id to priority weight overrides
    pub weights: Option<BTreeMap<String, u32>>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolyglotToml {
    /// Backends configuration section
    pub backends: BackendsToml,

    /// Routing configuration section
    pub routing: RoutingToml,

    /// Enrichment configuration section
    pub enrichment: EnrichmentToml,

    /// Streaming configuration section
    pub streaming: StreamingToml,

    /// Dependencies configuration section
    pub dependencies: DependenciesToml,
}

// =============================================================================
// Main Configuration Structs
// =============================================================================

/// Which backends answer a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Classify requests before selecting optional backends
    pub enabled: bool,
    /// Backend that answers the classification prompt
    pub classifier: String,
    /// Always queried, in this order
    pub mandatory: Vec<String>,
    /// Added when their predicate is true, in this order
    pub optional: Vec<OptionalBackend>,
    /// Listed in [`PolyglotConfig::dependencies`] without being routed to
    pub declared: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            classifier: "GPT-4".to_string(),
            mandatory: vec![
                "GPT-4".to_string(),
                "Claude-2-100k".to_string(),
                "fw-mistral-7b".to_string(),
                "Llama-2-70b".to_string(),
            ],
            optional: vec![
                OptionalBackend::new("is_related_to_psychology", "PsychologistGPT"),
                OptionalBackend::new("is_related_to_cooking", "leocooks"),
                OptionalBackend::new("is_related_to_fitness", "1FitCoach"),
            ],
            declared: vec!["GrandmaGPT".to_string()],
        }
    }
}

/// Optional web search contribution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentConfig {
    /// Off unless explicitly enabled
    pub web_search: bool,
    /// Enrichment backend id
    pub backend: String,
    /// Verdict key that gates enrichment
    pub predicate: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            web_search: false,
            backend: "Web-Search".to_string(),
            predicate: "requires_internet".to_string(),
        }
    }
}

/// Centralized configuration for the orchestrator
///
/// Consolidates all configuration layers and tracks which one was applied
/// last. Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct PolyglotConfig {
    /// HTTP endpoint for bot requests
    pub base_url: String,

    /// Longest silence allowed between a backend's tokens, `None` for no limit
    pub request_timeout: Option<Duration>,

    /// Backend id to display name, ids without an entry display as themselves
    pub display_names: BTreeMap<String, String>,

    /// Backend selection
    pub routing: RoutingConfig,

    /// Web search enrichment
    pub enrichment: EnrichmentConfig,

    /// Capacity of every fragment channel
    pub channel_capacity: usize,

    /// Maximum number of distinct declared backends
    pub max_backends: usize,

    /// Backend id to priority weight overrides
    pub dependency_weights: BTreeMap<String, u32>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for PolyglotConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            display_names: BTreeMap::new(),
            routing: RoutingConfig::default(),
            enrichment: EnrichmentConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_backends: DEFAULT_MAX_BACKENDS,
            dependency_weights: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl PolyglotConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Label under which `backend` answers
    #[must_use]
    pub fn label_for(&self, backend: &str) -> Label {
        Label::new(
            self.display_names
                .get(backend)
                .map_or(backend, String::as_str),
        )
    }

    /// Declared backends with their priority weights
    ///
    /// Every mandatory, optional, declared-only and enrichment backend weighs
    /// 1 and the classifier weighs 2, unless `dependency_weights` says
    /// otherwise.
    #[must_use]
    pub fn dependencies(&self) -> BTreeMap<String, u32> {
        let mut deps: BTreeMap<String, u32> = self
            .routing
            .mandatory
            .iter()
            .chain(self.routing.optional.iter().map(|rule| &rule.backend))
            .chain(&self.routing.declared)
            .chain(std::iter::once(&self.enrichment.backend))
            .map(|id| (id.clone(), 1))
            .collect();

        deps.insert(self.routing.classifier.clone(), 2);

        for (id, weight) in &self.dependency_weights {
            if let Some(entry) = deps.get_mut(id) {
                *entry = *weight;
            }
        }

        deps
    }

    /// Check invariants that loading alone cannot enforce
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when the mandatory set is
    /// empty, the channel capacity is zero, or more distinct backends are
    /// declared than `max_backends` allows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.mandatory.is_empty() {
            return Err(ConfigError::ValidationError(
                "routing.mandatory must name at least one backend".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "streaming.channel_capacity must be greater than 0".to_string(),
            ));
        }

        let declared: BTreeSet<String> = self.dependencies().into_keys().collect();
        if declared.len() > self.max_backends {
            return Err(ConfigError::ValidationError(format!(
                "{} distinct backends declared, at most {} allowed",
                declared.len(),
                self.max_backends
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/polyglot/polyglot.toml` or
/// `~/.config/polyglot/polyglot.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("polyglot").join("polyglot.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] afterwards.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<PolyglotConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<PolyglotConfig, ConfigError> {
    let mut config = PolyglotConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: PolyglotToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.set_source(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut PolyglotConfig, toml: &PolyglotToml) {
    // Backends
    if let Some(ref url) = toml.backends.base_url {
        config.base_url = url.clone();
    }
    if let Some(secs) = toml.backends.request_timeout_secs {
        config.request_timeout = timeout_from_secs(secs);
    }
    if let Some(ref names) = toml.backends.display_names {
        config.display_names.extend(names.clone());
    }

    // Routing
    if let Some(enabled) = toml.routing.enabled {
        config.routing.enabled = enabled;
    }
    if let Some(ref classifier) = toml.routing.classifier {
        config.routing.classifier = classifier.clone();
    }
    if let Some(ref mandatory) = toml.routing.mandatory {
        config.routing.mandatory = mandatory.clone();
    }
    if let Some(ref optional) = toml.routing.optional {
        config.routing.optional = optional.clone();
    }
    if let Some(ref declared) = toml.routing.declared {
        config.routing.declared = declared.clone();
    }

    // Enrichment
    if let Some(enabled) = toml.enrichment.web_search {
        config.enrichment.web_search = enabled;
    }
    if let Some(ref backend) = toml.enrichment.backend {
        config.enrichment.backend = backend.clone();
    }
    if let Some(ref predicate) = toml.enrichment.predicate {
        config.enrichment.predicate = predicate.clone();
    }

    // Streaming
    if let Some(capacity) = toml.streaming.channel_capacity {
        config.channel_capacity = capacity;
    }

    // Dependencies
    if let Some(max) = toml.dependencies.max_backends {
        config.max_backends = max;
    }
    if let Some(ref weights) = toml.dependencies.weights {
        config.dependency_weights.extend(weights.clone());
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut PolyglotConfig) {
    if let Ok(url) = std::env::var("POLYGLOT_BASE_URL") {
        config.base_url = url;
        config.set_source(ConfigSource::Env);
    }
    if let Ok(timeout) = std::env::var("POLYGLOT_REQUEST_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.request_timeout = timeout_from_secs(secs);
            config.set_source(ConfigSource::Env);
        }
    }
    if let Ok(enabled) = std::env::var("POLYGLOT_ROUTING") {
        config.routing.enabled = parse_flag(&enabled);
        config.set_source(ConfigSource::Env);
    }
    if let Ok(classifier) = std::env::var("POLYGLOT_CLASSIFIER") {
        config.routing.classifier = classifier;
        config.set_source(ConfigSource::Env);
    }
    if let Ok(enabled) = std::env::var("POLYGLOT_WEB_SEARCH") {
        config.enrichment.web_search = parse_flag(&enabled);
        config.set_source(ConfigSource::Env);
    }
    if let Ok(capacity) = std::env::var("POLYGLOT_CHANNEL_CAPACITY") {
        if let Ok(n) = capacity.parse::<usize>() {
            config.channel_capacity = n;
            config.set_source(ConfigSource::Env);
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Request timeout override (seconds, 0 = none)
    pub request_timeout_secs: Option<u64>,

    /// Routing enabled override
    pub routing_enabled: Option<bool>,

    /// Web search override
    pub web_search: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Set routing enabled override
    #[must_use]
    pub fn with_routing_enabled(mut self, enabled: bool) -> Self {
        self.routing_enabled = Some(enabled);
        self
    }

    /// Set web search override
    #[must_use]
    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut PolyglotConfig) {
        if self.base_url.is_some()
            || self.request_timeout_secs.is_some()
            || self.routing_enabled.is_some()
            || self.web_search.is_some()
        {
            config.set_source(ConfigSource::Cli);
        }

        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = timeout_from_secs(secs);
        }
        if let Some(enabled) = self.routing_enabled {
            config.routing.enabled = enabled;
        }
        if let Some(enabled) = self.web_search {
            config.enrichment.web_search = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
