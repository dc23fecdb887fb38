//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (prefix: TMFPDP_)
//! 2. Current working directory: ./tmfpdp.toml
//! 3. Defaults derived from the selected deployment environment

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Result;

/// Deployment environment, binding upstream domain, DB file and issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production marketplace
    Pro,
    /// Second development cluster
    Dev2,
    /// Sandbox
    #[default]
    Sbx,
    /// Local development against a stub upstream
    Lcl,
}

impl Environment {
    /// Upstream marketplace domain for this environment
    pub fn domain(&self) -> &'static str {
        match self {
            Self::Pro => "https://dome-marketplace-prd.org",
            Self::Dev2 => "https://dome-marketplace-dev2.org",
            Self::Sbx => "https://dome-marketplace-sbx.org",
            Self::Lcl => "http://localhost:8632",
        }
    }

    /// Database file for this environment (`./tmf[-env].db`)
    pub fn db_file(&self) -> &'static str {
        match self {
            Self::Pro => "./tmf.db",
            Self::Dev2 => "./tmf-dev2.db",
            Self::Sbx => "./tmf-sbx.db",
            Self::Lcl => "./tmf-lcl.db",
        }
    }

    /// OpenID issuer advertising the token signing keys
    pub fn issuer(&self) -> &'static str {
        match self {
            Self::Pro => "https://verifier.dome-marketplace-prd.org",
            Self::Dev2 => "https://verifier.dome-marketplace-dev2.org",
            Self::Sbx => "https://verifier.dome-marketplace-sbx.org",
            Self::Lcl => "http://localhost:8633",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pro => "pro",
            Self::Dev2 => "dev2",
            Self::Sbx => "sbx",
            Self::Lcl => "lcl",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pro" => Ok(Self::Pro),
            "dev2" => Ok(Self::Dev2),
            "sbx" => Ok(Self::Sbx),
            "lcl" => Ok(Self::Lcl),
            other => Err(format!("unknown environment {other:?} (pro|dev2|sbx|lcl)")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Cache database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upstream client configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Policy engine configuration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Token verification configuration
    #[serde(default)]
    pub token: TokenConfig,

    /// Cloner configuration
    #[serde(default)]
    pub cloner: ClonerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log filter (tracing EnvFilter syntax)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HTTP read/write timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Graceful shutdown drain window in seconds
    #[serde(default = "default_timeout")]
    pub shutdown_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            shutdown_secs: default_timeout(),
        }
    }
}

/// Cache database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path; empty selects the environment default
    #[serde(default)]
    pub path: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upsert freshness window in seconds
    #[serde(default = "default_max_freshness")]
    pub max_freshness_secs: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_connections: default_max_connections(),
            max_freshness_secs: default_max_freshness(),
        }
    }
}

/// How upstream hosts are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Single public domain plus per-resource path prefixes
    #[default]
    External,
    /// Per-resource pod hostname table, hot-updatable
    Internal,
    /// Legacy proxy interposed, with its own prefix table
    Proxy,
}

/// Upstream client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Host resolution mode
    #[serde(default)]
    pub mode: UpstreamMode,

    /// Base domain; empty selects the environment default
    #[serde(default)]
    pub domain: String,

    /// Per-resource host table for internal mode
    #[serde(default)]
    pub hosts: HashMap<String, String>,

    /// Legacy proxy base URL for proxy mode
    #[serde(default)]
    pub proxy_base: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::default(),
            domain: String::new(),
            hosts: HashMap::new(),
            proxy_base: String::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Policy engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Directory holding policy scripts
    #[serde(default = "default_policy_dir")]
    pub dir: PathBuf,

    /// Name of the policy evaluated per request
    #[serde(default = "default_policy_name")]
    pub name: String,

    /// Source cache freshness window in seconds
    #[serde(default = "default_policy_freshness")]
    pub freshness_secs: u64,

    /// Largest accepted source file in bytes (inclusive)
    #[serde(default = "default_policy_max_bytes")]
    pub max_source_bytes: u64,

    /// Idle workers kept per source version
    #[serde(default = "default_policy_max_idle")]
    pub max_idle_workers: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            dir: default_policy_dir(),
            name: default_policy_name(),
            freshness_secs: default_policy_freshness(),
            max_source_bytes: default_policy_max_bytes(),
            max_idle_workers: default_policy_max_idle(),
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenConfig {
    /// OpenID issuer base URL; empty selects the environment default
    #[serde(default)]
    pub issuer: String,
}

/// Cloner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClonerConfig {
    /// Seconds between clone passes
    #[serde(default = "default_clone_period")]
    pub period_secs: u64,

    /// Root kinds walked per pass
    #[serde(default = "default_clone_roots")]
    pub roots: Vec<String>,

    /// Upstream page size while walking
    #[serde(default = "default_clone_page")]
    pub page_size: u32,
}

impl Default for ClonerConfig {
    fn default() -> Self {
        Self {
            period_secs: default_clone_period(),
            roots: default_clone_roots(),
            page_size: default_clone_page(),
        }
    }
}

impl Config {
    /// Load configuration for an environment, merging file and env sources
    pub fn load(environment: Environment) -> Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config {
                environment,
                ..Config::default()
            }))
            .merge(Toml::file("tmfpdp.toml"))
            .merge(Env::prefixed("TMFPDP_").split("__"))
            .extract()?;
        config.apply_environment_defaults();
        Ok(config)
    }

    /// Fill in fields the environment binds when not set explicitly
    fn apply_environment_defaults(&mut self) {
        if self.database.path.is_empty() {
            self.database.path = self.environment.db_file().to_string();
        }
        if self.upstream.domain.is_empty() {
            self.upstream.domain = self.environment.domain().to_string();
        }
        if self.token.issuer.is_empty() {
            self.token.issuer = self.environment.issuer().to_string();
        }
    }

    /// Configuration with environment defaults applied, no file or env
    /// sources; used by tests and the sync tool
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Config {
            environment,
            ..Config::default()
        };
        config.apply_environment_defaults();
        config
    }
}

fn default_listen() -> String {
    "0.0.0.0:9991".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_freshness() -> i64 {
    3600
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("./policies")
}

fn default_policy_name() -> String {
    "authz".to_string()
}

fn default_policy_freshness() -> u64 {
    20
}

fn default_policy_max_bytes() -> u64 {
    1024 * 1024
}

fn default_policy_max_idle() -> usize {
    64
}

fn default_clone_period() -> u64 {
    600
}

fn default_clone_roots() -> Vec<String> {
    vec!["productOffering".to_string(), "catalog".to_string()]
}

fn default_clone_page() -> u32 {
    50
}
