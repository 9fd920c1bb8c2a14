//! Layered configuration.
//!
//! Settings merge three layers, later ones winning:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables are prefixed with `PROXIMA_` and use double
//! underscores to separate nested levels:
//! - `PROXIMA_SEARCH__NPROBE=16` sets `search.nprobe`
//! - `PROXIMA_SERVER__BIND=0.0.0.0:8080` sets `server.bind`
//! - `PROXIMA_RESOLVER__TIMEOUT_MS=250` sets `resolver.timeout_ms`

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::engine::{DEFAULT_NPROBE, DEFAULT_OVER_FETCH, SearchConfig};
use crate::error::EngineError;
use crate::index::DEFAULT_NUM_SUBSPACES;
use crate::resolver::RetryPolicy;
use crate::vector::Metric;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Directory the index artifact is written to and served from.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// Index construction settings.
    #[serde(default)]
    pub index: IndexConfig,

    /// Query-time settings.
    #[serde(default)]
    pub search: SearchSettings,

    /// Embedding resolution settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexConfig {
    /// Distance metric baked into the artifact at build time.
    #[serde(default)]
    pub metric: Metric,

    /// Partition count; omitted means ceil(sqrt(N)).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,

    /// Sub-vector count for quantization; must divide the dimension.
    #[serde(default = "default_num_subspaces")]
    pub num_subspaces: usize,

    /// Clustering iteration cap.
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,

    /// Seed for reproducible builds; omitted means entropy-seeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchSettings {
    /// Partitions probed per query.
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,

    /// Candidate over-fetch factor for exact re-ranking.
    #[serde(default = "default_over_fetch")]
    pub over_fetch: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResolverConfig {
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_resolver_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds; doubles per retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Whole-request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default result count when a request does not set one.
    #[serde(default = "default_show")]
    pub default_show: usize,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("index")
}

fn default_num_subspaces() -> usize {
    DEFAULT_NUM_SUBSPACES
}

fn default_kmeans_iterations() -> usize {
    25
}

fn default_nprobe() -> usize {
    DEFAULT_NPROBE
}

fn default_over_fetch() -> usize {
    DEFAULT_OVER_FETCH
}

fn default_resolver_timeout_ms() -> u64 {
    500
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    50
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_show() -> usize {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            artifact_path: default_artifact_path(),
            index: IndexConfig::default(),
            search: SearchSettings::default(),
            resolver: ResolverConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            partitions: None,
            num_subspaces: default_num_subspaces(),
            kmeans_iterations: default_kmeans_iterations(),
            seed: None,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            nprobe: default_nprobe(),
            over_fetch: default_over_fetch(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_resolver_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            request_timeout_ms: default_request_timeout_ms(),
            default_show: default_show(),
        }
    }
}

impl Settings {
    /// Loads settings from `proxima.toml` in the working directory (if
    /// present) with `PROXIMA_` environment overrides on top.
    pub fn load() -> Result<Self, EngineError> {
        Self::figment(Path::new("proxima.toml")).extract().map_err(|e| {
            EngineError::Config {
                reason: e.to_string(),
            }
        })
    }

    /// Loads settings from an explicit TOML file path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::figment(path.as_ref()).extract().map_err(|e| EngineError::Config {
            reason: e.to_string(),
        })
    }

    fn figment(toml_path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(toml_path))
            .merge(Env::prefixed("PROXIMA_").split("__"))
    }

    /// Query-time view of these settings.
    #[must_use]
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            nprobe: self.search.nprobe,
            over_fetch: self.search.over_fetch,
        }
    }

    /// Resolver retry/timeout view of these settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.resolver.timeout_ms),
            max_retries: self.resolver.max_retries,
            backoff: Duration::from_millis(self.resolver.backoff_ms),
        }
    }

    /// Renders the effective settings as TOML, for `proxima config`.
    pub fn to_toml(&self) -> Result<String, EngineError> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config {
            reason: e.to_string(),
        })
    }
}
