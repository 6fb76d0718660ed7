//! Configuration management for algolia_content_sync
//!
//! Supports loading configuration from TOML files with environment and CLI overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Telemetry / OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable OpenTelemetry trace export (default: false)
    /// Can be overridden by env var ACS_TRACING_ENABLED or OTEL_SDK_DISABLED
    #[serde(default)]
    pub enabled: bool,

    /// OTLP exporter endpoint (default: http://localhost:4317)
    /// Can be overridden by env var OTEL_EXPORTER_OTLP_ENDPOINT
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,

    /// Service name reported to the collector (default: algolia_content_sync)
    /// Can be overridden by env var OTEL_SERVICE_NAME
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "algolia_content_sync".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            service_name: default_service_name(),
        }
    }
}

impl TelemetryConfig {
    /// Apply environment variable overrides.
    /// Env vars take precedence over TOML config values.
    pub fn with_env_overrides(mut self) -> Self {
        // OTEL_SDK_DISABLED=true → disabled (official OTel convention)
        if let Ok(val) = std::env::var("OTEL_SDK_DISABLED") {
            if val.eq_ignore_ascii_case("true") {
                self.enabled = false;
            }
        }
        if let Ok(val) = std::env::var("ACS_TRACING_ENABLED") {
            self.enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
        if let Ok(val) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !val.is_empty() {
                self.otlp_endpoint = val;
            }
        }
        if let Ok(val) = std::env::var("OTEL_SERVICE_NAME") {
            if !val.is_empty() {
                self.service_name = val;
            }
        }
        self
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub algolia: AlgoliaConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Credentials and index naming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoliaConfig {
    /// Algolia application id (env override: ALGOLIA_APPLICATION_ID)
    #[serde(default)]
    pub application_id: String,

    /// Admin API key (env override: ALGOLIA_API_KEY)
    #[serde(default)]
    pub api_key: String,

    /// Prefix prepended to every remote index name
    #[serde(default = "default_index_name_prefix")]
    pub index_name_prefix: String,
}

/// How watchers deliver operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Call the remote service while handling the event
    #[default]
    Immediate,
    /// Append operations to the durable outbox; `drain-outbox` replays them
    Outbox,
}

/// Which indices are kept in sync and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Ids of the indices to enable (e.g. "searchable_posts", "posts_page", "users")
    #[serde(default)]
    pub synced_indices: Vec<String>,

    /// Post types that never get their own index
    #[serde(default = "default_post_types_blacklist")]
    pub post_types_blacklist: Vec<String>,

    /// Taxonomies that never get their own index
    #[serde(default = "default_taxonomies_blacklist")]
    pub taxonomies_blacklist: Vec<String>,

    /// Maximum operations per remote batch request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub mode: SyncMode,

    /// Outbox location (used when mode = "outbox")
    #[serde(default = "default_outbox_path")]
    pub outbox_path: String,

    /// Post meta keys whose change re-syncs the post (glob patterns)
    #[serde(default = "default_watched_meta_keys")]
    pub watched_meta_keys: Vec<String>,
}

/// Remote client behaviour and identification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_integration_name")]
    pub integration_name: String,

    /// Defaults to the crate version
    #[serde(default)]
    pub integration_version: Option<String>,

    /// Host platform reported in the user agent (e.g. "WordPress")
    #[serde(default)]
    pub platform_name: Option<String>,

    #[serde(default)]
    pub platform_version: Option<String>,
}

/// Admin / ingest HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP API to
    #[serde(default = "default_web_address")]
    pub web_address: String,
}

fn default_index_name_prefix() -> String {
    "wp_".to_string()
}

fn default_post_types_blacklist() -> Vec<String> {
    vec!["nav_menu_item".to_string()]
}

fn default_taxonomies_blacklist() -> Vec<String> {
    vec![
        "nav_menu".to_string(),
        "link_category".to_string(),
        "post_format".to_string(),
    ]
}

fn default_batch_size() -> usize {
    100
}

fn default_outbox_path() -> String {
    "algolia_outbox.jsonl".to_string()
}

fn default_watched_meta_keys() -> Vec<String> {
    vec!["_thumbnail_id".to_string()]
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_integration_name() -> String {
    "WP Search with Algolia".to_string()
}

fn default_web_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for AlgoliaConfig {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            api_key: String::new(),
            index_name_prefix: default_index_name_prefix(),
        }
    }
}

impl AlgoliaConfig {
    /// Credentials from the environment win over the file
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ALGOLIA_APPLICATION_ID") {
            if !val.is_empty() {
                self.application_id = val;
            }
        }
        if let Ok(val) = std::env::var("ALGOLIA_API_KEY") {
            if !val.is_empty() {
                self.api_key = val;
            }
        }
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.application_id.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            synced_indices: Vec::new(),
            post_types_blacklist: default_post_types_blacklist(),
            taxonomies_blacklist: default_taxonomies_blacklist(),
            batch_size: default_batch_size(),
            mode: SyncMode::default(),
            outbox_path: default_outbox_path(),
            watched_meta_keys: default_watched_meta_keys(),
        }
    }
}

impl SyncConfig {
    pub fn is_synced(&self, index_id: &str) -> bool {
        self.synced_indices.iter().any(|id| id == index_id)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            integration_name: default_integration_name(),
            integration_version: None,
            platform_name: None,
            platform_version: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_address: default_web_address(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from default locations
    ///
    /// Search order:
    /// 1. ACS_CONFIG environment variable
    /// 2. ./algolia_content_sync.toml (current directory)
    /// 3. ~/.config/algolia_content_sync/config.toml (user config)
    pub fn from_default_locations() -> Result<Option<(Self, PathBuf)>> {
        if let Ok(env_path) = std::env::var("ACS_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                let config = Self::from_file(&path)?;
                return Ok(Some((config, path)));
            }
        }

        let local_path = PathBuf::from("algolia_content_sync.toml");
        if local_path.exists() {
            let config = Self::from_file(&local_path)?;
            return Ok(Some((config, local_path)));
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("algolia_content_sync").join("config.toml");
            if user_path.exists() {
                let config = Self::from_file(&user_path)?;
                return Ok(Some((config, user_path)));
            }
        }

        Ok(None)
    }

    /// Apply environment overrides to every section that supports them
    pub fn with_env_overrides(mut self) -> Self {
        self.algolia = self.algolia.with_env_overrides();
        self.telemetry = self.telemetry.with_env_overrides();
        self
    }

    /// Generate a template configuration file
    pub fn generate_template() -> String {
        r#"# Algolia Content Sync Configuration
# Generated template - customize as needed

[algolia]
# Application id and admin API key
# Env overrides: ALGOLIA_APPLICATION_ID, ALGOLIA_API_KEY
# Leaving either empty disables sync
application_id = ""
api_key = ""

# Prefix prepended to every remote index name
index_name_prefix = "wp_"

[sync]
# Indices to keep in sync. Available ids:
#   searchable_posts, posts_<post type>, terms_<taxonomy>, users
synced_indices = [
    # "searchable_posts",
    # "users",
]

# Post types and taxonomies that never get their own index
post_types_blacklist = ["nav_menu_item"]
taxonomies_blacklist = ["nav_menu", "link_category", "post_format"]

# Maximum operations per remote batch request
batch_size = 100

# "immediate" calls Algolia while handling each change,
# "outbox" queues operations on disk for drain-outbox
mode = "immediate"
outbox_path = "algolia_outbox.jsonl"

# Post meta keys whose change re-syncs the post (glob patterns)
watched_meta_keys = ["_thumbnail_id"]

[client]
max_attempts = 4
initial_backoff_ms = 200
max_backoff_ms = 5000
connect_timeout_ms = 2000
read_timeout_ms = 5000
write_timeout_ms = 30000
integration_name = "WP Search with Algolia"
# platform_name = "WordPress"
# platform_version = "6.4"

[server]
# Address to bind the admin / ingest HTTP API to
web_address = "127.0.0.1:8080"

[telemetry]
# Enable OpenTelemetry trace export (default: false)
# Env overrides: OTEL_SDK_DISABLED=true, ACS_TRACING_ENABLED=true
enabled = false

# OTLP gRPC exporter endpoint (default: http://localhost:4317)
# Env override: OTEL_EXPORTER_OTLP_ENDPOINT
otlp_endpoint = "http://localhost:4317"

# Service name reported to the collector
# Env override: OTEL_SERVICE_NAME
service_name = "algolia_content_sync"
"#
        .to_string()
    }

    /// Write template config to the specified path
    pub fn write_template(path: &Path) -> Result<()> {
        let template = Self::generate_template();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, template)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge CLI overrides into the configuration
    pub fn with_overrides(mut self, web_address: Option<String>, extra_synced: Vec<String>) -> Self {
        if let Some(addr) = web_address {
            self.server.web_address = addr;
        }

        for id in extra_synced {
            if !self.sync.is_synced(&id) {
                self.sync.synced_indices.push(id);
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.algolia.index_name_prefix, "wp_");
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.mode, SyncMode::Immediate);
        assert_eq!(config.sync.post_types_blacklist, vec!["nav_menu_item"]);
        assert!(config.sync.synced_indices.is_empty());
        assert!(!config.algolia.has_credentials());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[algolia]
application_id = "APP"
api_key = "secret"

[sync]
synced_indices = ["searchable_posts", "users"]
mode = "outbox"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.algolia.has_credentials());
        assert!(config.sync.is_synced("users"));
        assert!(!config.sync.is_synced("terms_category"));
        assert_eq!(config.sync.mode, SyncMode::Outbox);
        assert_eq!(config.sync.taxonomies_blacklist.len(), 3);
    }

    #[test]
    fn test_generate_template_parses() {
        let template = Config::generate_template();
        assert!(template.contains("[algolia]"));
        assert!(template.contains("[sync]"));
        let config: Config = toml::from_str(&template).unwrap();
        assert_eq!(config.client.max_attempts, 4);
        assert_eq!(config.server.web_address, "127.0.0.1:8080");
    }

    #[test]
    fn test_with_overrides_dedupes_synced() {
        let config = Config::default().with_overrides(
            Some("0.0.0.0:9000".into()),
            vec!["users".into(), "users".into()],
        );
        assert_eq!(config.server.web_address, "0.0.0.0:9000");
        assert_eq!(config.sync.synced_indices, vec!["users"]);
    }
}
