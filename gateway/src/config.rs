// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::time::Duration;

use worker_pool::PoolConfig;

/// Where the generated auth token is persisted when none is supplied.
pub const TOKEN_FILE: &str = "/gateway/auth_token.txt";

const DEFAULT_NETWORK: &str = "code-interpreter_workers_isolated_net";
const DEFAULT_GATEWAY_IP: &str = "172.28.0.2";
const WORKER_IMAGE: &str = "code-interpreter-worker:latest";

///
/// Gateway configuration, read from the environment once at startup. Every
/// knob has a default that works in the stock docker-compose deployment.
///
#[derive(Clone, Debug)]
pub struct Config {
    pub internal_network: String,
    pub gateway_internal_ip: String,
    pub worker_image: String,
    pub min_idle_workers: usize,
    pub max_total_workers: usize,
    pub worker_cpu: f64,
    pub worker_ram_mb: u64,
    pub worker_disk_mb: u64,
    pub worker_idle_timeout: Duration,
    pub recycling_interval: Duration,
    pub max_execution_timeout: Duration,
    pub max_file_size_mb: u64,
    pub ssrf_protection_enabled: bool,
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            internal_network: env_or("INTERNAL_NETWORK_NAME", DEFAULT_NETWORK),
            gateway_internal_ip: env_or("GATEWAY_INTERNAL_IP", DEFAULT_GATEWAY_IP),
            worker_image: env_or("WORKER_IMAGE_NAME", WORKER_IMAGE),
            min_idle_workers: env_parsed("MIN_IDLE_WORKERS", 10),
            max_total_workers: env_parsed("MAX_TOTAL_WORKERS", 50),
            worker_cpu: env_parsed("WORKER_CPU", 1.5),
            worker_ram_mb: env_parsed("WORKER_RAM_MB", 1536),
            worker_disk_mb: env_parsed("WORKER_MAX_DISK_SIZE_MB", 500),
            worker_idle_timeout: Duration::from_secs(env_parsed("WORKER_IDLE_TIMEOUT", 3600)),
            recycling_interval: Duration::from_secs(env_parsed("RECYCLING_INTERVAL", 300)),
            max_execution_timeout: Duration::from_secs(env_parsed("MAX_EXECUTION_TIMEOUT", 120)),
            max_file_size_mb: env_parsed("MAX_FILE_SIZE_MB", 100),
            ssrf_protection_enabled: env_or("SSRF_PROTECTION_ENABLED", "true").to_lowercase()
                == "true",
            cors_allowed_origins: parse_cors_origins(&env_or("CORS_ALLOWED_ORIGINS", "*")),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    ///
    /// How long the gateway waits on a worker's execute endpoint. The
    /// worker's own receive loop is bounded by the same configured timeout;
    /// the margin here makes sure the worker's verdict (a 503 for a timed-out
    /// execution) wins the race against our transport timeout.
    ///
    pub fn proxy_timeout(&self) -> Duration {
        self.max_execution_timeout + Duration::from_secs(10)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_image: self.worker_image.clone(),
            internal_network: self.internal_network.clone(),
            gateway_internal_ip: self.gateway_internal_ip.clone(),
            min_idle_workers: self.min_idle_workers,
            max_total_workers: self.max_total_workers,
            worker_idle_timeout: self.worker_idle_timeout,
            recycling_interval: self.recycling_interval,
            execution_timeout: self.max_execution_timeout,
            worker_cpu: self.worker_cpu,
            worker_ram_mb: self.worker_ram_mb,
            worker_disk_mb: self.worker_disk_mb,
            vdisks_base_dir: PathBuf::from("/virtual_disks"),
            worker_mounts_dir: PathBuf::from("/worker_mounts"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_owned(),
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// `*` means any origin; otherwise a comma-separated list, entries trimmed,
/// empties dropped.
pub fn parse_cors_origins(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return vec!["*".to_owned()];
    }
    raw.split(',')
        .map(|origin| origin.trim().to_owned())
        .filter(|origin| !origin.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_cors_origins;

    #[test]
    fn cors_wildcard() {
        assert_eq!(parse_cors_origins("*"), vec!["*"]);
        assert_eq!(parse_cors_origins(" * "), vec!["*"]);
    }

    #[test]
    fn cors_list_is_trimmed_and_filtered() {
        assert_eq!(
            parse_cors_origins("https://a.example , https://b.example,,"),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
