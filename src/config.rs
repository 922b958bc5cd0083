//! Configuration loading and types for statebridge.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every field has a default, so an empty file (or no
//! file at all) yields a runnable in-memory development server.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential issuing and request verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Unit store backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Dependency graph refresh.
    #[serde(default)]
    pub deps: DepsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Region reported in listings and used by the admin CLI when signing.
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Largest request body accepted, in bytes (default 256 MiB).
    #[serde(default = "default_max_state_size")]
    pub max_state_size: usize,

    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
            max_state_size: default_max_state_size(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Accepted distance between `X-Amz-Date` and the server clock, in
    /// seconds. Zero disables the check.
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew: u64,

    #[serde(default)]
    pub sts: StsConfig,

    #[serde(default)]
    pub token: TokenConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_clock_skew: default_max_clock_skew(),
            sts: StsConfig::default(),
            token: TokenConfig::default(),
        }
    }
}

/// Stateless credential issuing.
#[derive(Debug, Clone, Deserialize)]
pub struct StsConfig {
    /// Key id used for newly issued access keys.
    #[serde(default = "default_active_kid")]
    pub active_kid: String,

    /// Credential lifetime, e.g. `15m`, `900s`, `1h`.
    #[serde(default = "default_ttl")]
    pub ttl: String,

    /// Environment variable prefix for master secrets (`<prefix><kid>`).
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    /// Master secrets by kid, base64url-encoded. Kids missing here are
    /// looked up in the environment.
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

impl Default for StsConfig {
    fn default() -> Self {
        Self {
            active_kid: default_active_kid(),
            ttl: default_ttl(),
            env_prefix: default_env_prefix(),
            keys: HashMap::new(),
        }
    }
}

/// Bearer token verification.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// `HS256` or `EdDSA`.
    #[serde(default = "default_token_algorithm")]
    pub algorithm: String,

    /// Shared secret for HS256.
    #[serde(default)]
    pub hmac_secret: String,

    /// Path to a PEM public key for EdDSA.
    #[serde(default)]
    pub public_key_pem: String,

    /// Required `iss` claim, if non-empty.
    #[serde(default)]
    pub issuer: String,

    /// Leeway for `exp` checks, in seconds.
    #[serde(default = "default_token_leeway")]
    pub leeway: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            algorithm: default_token_algorithm(),
            hmac_secret: String::new(),
            public_key_pem: String::new(),
            issuer: String::new(),
            leeway: default_token_leeway(),
        }
    }
}

/// Unit store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend: `memory`, `sqlite` or `aws`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default)]
    pub sqlite: SqliteConfig,

    /// Required when `backend` is `aws`.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite: SqliteConfig::default(),
            aws: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Database file path.
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

/// S3-compatible bucket holding unit state and lock objects.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// Backing bucket name.
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix in the backing bucket.
    #[serde(default)]
    pub prefix: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
}

/// Dependency graph refresh after state writes.
#[derive(Debug, Clone, Deserialize)]
pub struct DepsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unit whose state holds the dependency edges.
    #[serde(default = "default_graph_unit_id")]
    pub graph_unit_id: String,

    /// Terraform resource type of an edge.
    #[serde(default = "default_dependency_resource_type")]
    pub resource_type: String,

    /// Units with a refresh waiting before new ones are dropped.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            graph_unit_id: default_graph_unit_id(),
            resource_type: default_dependency_resource_type(),
            max_pending: default_max_pending(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_state_size() -> usize {
    256 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_clock_skew() -> u64 {
    900
}

fn default_active_kid() -> String {
    "k1".to_string()
}

fn default_ttl() -> String {
    "15m".to_string()
}

fn default_env_prefix() -> String {
    crate::credentials::DEFAULT_ENV_PREFIX.to_string()
}

fn default_token_algorithm() -> String {
    "HS256".to_string()
}

fn default_token_leeway() -> u64 {
    30
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> String {
    "./data/units.db".to_string()
}

fn default_graph_unit_id() -> String {
    "__statebridge_graph".to_string()
}

fn default_dependency_resource_type() -> String {
    "statebridge_dependency".to_string()
}

fn default_max_pending() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
