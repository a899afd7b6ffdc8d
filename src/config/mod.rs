/// Configuration management for the Pipeway engine
///
/// Handles the health server bind address, the data directory that holds the
/// SQLite stores and run artifacts, job queue sizing, the scheduler tick and
/// outbound HTTP hardening.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Health server configuration
    pub server: ServerConfig,
    /// Database and artifact storage configuration
    pub storage: StorageConfig,
    /// Job queue and scheduler configuration
    pub runtime: RuntimeConfig,
    /// Outbound HTTP client configuration (external-call, ai-processor, clickhouse)
    pub http: HttpConfig,
}

/// Health server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory (default: "data")
    /// Creates: pipeway.db, runs/{execution_id}/...
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of queued jobs running at once
    pub max_concurrent_jobs: usize,
    /// Six-field cron expression for the due-evaluation tick
    pub tick_schedule: String,
    /// Debug sampling for scheduled runs
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("pipeway.db")
    }

    pub fn runs_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("runs")
    }
}

impl HttpConfig {
    /// Build the shared outbound client with request and connect timeouts
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("PIPEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("PIPEWAY_PORT", 3004),
            },
            storage: StorageConfig {
                data_dir: std::env::var("PIPEWAY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            runtime: RuntimeConfig {
                max_concurrent_jobs: env_or("PIPEWAY_MAX_CONCURRENT_JOBS", 5),
                tick_schedule: std::env::var("PIPEWAY_TICK_SCHEDULE")
                    .unwrap_or_else(|_| "0 * * * * *".to_string()),
                debug: env_or("PIPEWAY_DEBUG", false),
            },
            http: HttpConfig {
                timeout_secs: env_or("PIPEWAY_HTTP_TIMEOUT_SECS", 300),
                connect_timeout_secs: env_or("PIPEWAY_HTTP_CONNECT_TIMEOUT_SECS", 30),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_data_dir() {
        let storage = StorageConfig { data_dir: "/tmp/pw".to_string() };
        assert_eq!(storage.database_path(), PathBuf::from("/tmp/pw/pipeway.db"));
        assert_eq!(storage.runs_dir(), PathBuf::from("/tmp/pw/runs"));
    }

    #[test]
    fn unparseable_env_values_fall_back() {
        std::env::set_var("PIPEWAY_TEST_BOGUS_PORT", "not-a-port");
        assert_eq!(env_or("PIPEWAY_TEST_BOGUS_PORT", 3004u16), 3004);
    }
}
