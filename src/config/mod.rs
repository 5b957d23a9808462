/// Configuration management for the workflow control plane
///
/// Handles server configuration, database connection, lifecycle tuning, and the
/// deployment backend endpoint. Every value can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Lifecycle manager and state machine tuning
    pub lifecycle: LifecycleConfig,
    /// External deployment backend
    pub backend: BackendConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration for the resource and operation stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL shared by both stores (default: "sqlite://data/workflowctl.db")
    pub url: String,
}

/// Lifecycle manager tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Service account template used when a workflow omits one.
    /// `{project}` is replaced with the workflow's project id.
    pub default_service_account: String,
    /// Upper bound applied to list page sizes
    pub max_page_size: usize,
    /// Page size used when the caller passes zero or a negative value
    pub default_page_size: usize,
    /// How many times a lost conditional write is retried before `Aborted`
    pub cas_retries: usize,
    /// Lifetime of a transition lease before the reaper may reclaim it
    pub lease_secs: u64,
    /// Interval between reaper sweeps over expired leases
    pub reaper_interval_secs: u64,
    /// Maximum number of concurrent state-machine runs
    pub workers: usize,
    /// Capacity of the transition work queue
    pub queue_capacity: usize,
}

/// Deployment backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the HTTP deployment backend. `None` selects the local backend.
    pub url: Option<String>,
}

impl LifecycleConfig {
    /// Lease lifetime as a chrono duration for timestamp arithmetic
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }

    /// Reaper sweep interval as a tokio-friendly duration
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Resolve the default service account for a project
    pub fn service_account_for(&self, project: &str) -> String {
        self.default_service_account.replace("{project}", project)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_service_account: env_or(
                "WORKFLOWCTL_DEFAULT_SERVICE_ACCOUNT",
                "{project}-compute@developer.gserviceaccount.com",
            ),
            max_page_size: env_parse("WORKFLOWCTL_MAX_PAGE_SIZE", 1000),
            default_page_size: env_parse("WORKFLOWCTL_DEFAULT_PAGE_SIZE", 500),
            cas_retries: env_parse("WORKFLOWCTL_CAS_RETRIES", 3),
            lease_secs: env_parse("WORKFLOWCTL_LEASE_SECS", 600),
            reaper_interval_secs: env_parse("WORKFLOWCTL_REAPER_INTERVAL_SECS", 30),
            workers: env_parse("WORKFLOWCTL_WORKERS", 8),
            queue_capacity: env_parse("WORKFLOWCTL_QUEUE_CAPACITY", 1024),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("WORKFLOWCTL_HOST", "0.0.0.0"),
                port: env_parse("WORKFLOWCTL_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("WORKFLOWCTL_DATABASE_URL", "sqlite://data/workflowctl.db"),
            },
            lifecycle: LifecycleConfig::default(),
            backend: BackendConfig {
                url: std::env::var("WORKFLOWCTL_BACKEND_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Malformed values fall back to the default rather than failing startup
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
