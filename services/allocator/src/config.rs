use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::allocation::DispatcherConfig;
use crate::store::DbConfig;

/// Where allocations and nodes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" => Ok(StorageBackend::Postgres),
            other => bail!("unknown storage backend '{other}' (expected memory or postgres)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub storage: StorageBackend,
    pub database: DbConfig,
    pub match_timeout: Duration,
    pub dispatch_workers: usize,
    pub dispatch_mailbox: usize,

    /// JSON array of nodes to enroll at startup.
    pub nodes_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("METALLOC_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:6385".to_string())
            .parse()
            .context("invalid METALLOC_LISTEN_ADDR")?;

        let log_level = lookup("METALLOC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("METALLOC_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let storage = lookup("METALLOC_STORAGE")
            .as_deref()
            .unwrap_or("memory")
            .parse()?;

        let match_timeout = positive(&lookup, "METALLOC_MATCH_TIMEOUT_SECS", 60)?;
        let dispatch_workers = positive(&lookup, "METALLOC_DISPATCH_WORKERS", 4)?;
        let dispatch_mailbox = positive(&lookup, "METALLOC_DISPATCH_MAILBOX", 256)?;

        let nodes_file = lookup("METALLOC_NODES_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            storage,
            database: DbConfig::from_lookup(&lookup),
            match_timeout: Duration::from_secs(match_timeout),
            dispatch_workers: dispatch_workers as usize,
            dispatch_mailbox: dispatch_mailbox as usize,
            nodes_file,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.dispatch_workers,
            mailbox: self.dispatch_mailbox,
            match_timeout: self.match_timeout,
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be a positive integer, got '{raw}'"))?;
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:6385".parse().unwrap());
        assert_eq!(config.log_level, "info");
        assert!(!config.dev_mode);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.match_timeout, Duration::from_secs(60));
        assert_eq!(config.dispatch_workers, 4);
        assert_eq!(config.dispatch_mailbox, 256);
        assert!(config.nodes_file.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("METALLOC_LISTEN_ADDR", "0.0.0.0:9000"),
            ("METALLOC_STORAGE", "Postgres"),
            ("METALLOC_DEV", "true"),
            ("METALLOC_MATCH_TIMEOUT_SECS", "5"),
            ("METALLOC_DISPATCH_WORKERS", "8"),
            ("METALLOC_NODES_FILE", "/etc/metalloc/nodes.json"),
            ("DATABASE_URL", "postgres://db/metalloc"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.storage, StorageBackend::Postgres);
        assert!(config.dev_mode);
        assert_eq!(config.dispatcher_config().match_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatcher_config().workers, 8);
        assert_eq!(
            config.nodes_file,
            Some(PathBuf::from("/etc/metalloc/nodes.json"))
        );
        assert_eq!(config.database.database_url, "postgres://db/metalloc");
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = config(&[("METALLOC_DISPATCH_WORKERS", "0")]).unwrap_err();
        assert!(err.to_string().contains("METALLOC_DISPATCH_WORKERS"));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let err = config(&[("METALLOC_STORAGE", "redis")]).unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        assert!(config(&[("METALLOC_LISTEN_ADDR", "localhost")]).is_err());
    }
}
