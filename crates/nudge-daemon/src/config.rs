use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use nudge_core::peers::ServiceRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub hostname: String,
    pub poll_interval: Duration,
    pub delay: Duration,
    pub queue_capacity: usize,
    pub peer_ttl_secs: u32,
    pub peers: Vec<ServiceRecord>,
    pub peer_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "NUDGE_BIND_ADDR", "0.0.0.0:7878");
        if bind_port(&bind_addr).is_none() {
            return Err(ConfigError::Invalid(
                "NUDGE_BIND_ADDR must look like host:port".to_string(),
            ));
        }

        let db_path = optional_trimmed(&lookup, "NUDGE_DB_PATH")
            .map_or_else(default_db_path, PathBuf::from);

        let hostname = optional_trimmed(&lookup, "NUDGE_HOSTNAME")
            .or_else(|| optional_trimmed(&lookup, "HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());

        let poll_interval_secs = ranged(&lookup, "NUDGE_POLL_INTERVAL_SECS", 30, 5..=300)?;
        let delay_secs = ranged(&lookup, "NUDGE_DELAY_SECS", 300, 10..=86_400)?;
        let queue_capacity = ranged(&lookup, "NUDGE_QUEUE_CAPACITY", 64, 1..=10_000)?;
        let peer_ttl_secs = ranged(&lookup, "NUDGE_PEER_TTL_SECS", 120, 10..=3_600)?;
        let peer_timeout_secs = ranged(&lookup, "NUDGE_PEER_TIMEOUT_SECS", 10, 1..=120)?;
        let shutdown_grace_secs = ranged(&lookup, "NUDGE_SHUTDOWN_GRACE_SECS", 5, 0..=60)?;

        let peers = optional_trimmed(&lookup, "NUDGE_PEERS")
            .map(|raw| parse_peers(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            db_path,
            hostname,
            poll_interval: Duration::from_secs(poll_interval_secs),
            delay: Duration::from_secs(delay_secs),
            queue_capacity: usize::try_from(queue_capacity)
                .map_err(|_| ConfigError::Invalid("NUDGE_QUEUE_CAPACITY is too large".into()))?,
            peer_ttl_secs: u32::try_from(peer_ttl_secs)
                .map_err(|_| ConfigError::Invalid("NUDGE_PEER_TTL_SECS is too large".into()))?,
            peers,
            peer_timeout: Duration::from_secs(peer_timeout_secs),
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
        })
    }

    /// Port the HTTP surface listens on, advertised to peers.
    pub fn port(&self) -> u16 {
        bind_port(&self.bind_addr).unwrap_or_default()
    }
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nudge")
        .join("nudge.db")
}

fn parse_peers(raw: &str) -> Result<Vec<ServiceRecord>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            ServiceRecord::parse_address(entry)
                .map_err(|err| ConfigError::Invalid(format!("NUDGE_PEERS: {err}")))
        })
        .collect()
}

fn bind_port(bind_addr: &str) -> Option<u16> {
    bind_addr
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
}

fn ranged(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_defaults() {
        let config = config_from(&[("HOSTNAME", "desk")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7878");
        assert_eq!(config.port(), 7878);
        assert_eq!(config.hostname, "desk");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.delay, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.peer_ttl_secs, 120);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.peers.is_empty());
        assert!(config.db_path.ends_with("nudge/nudge.db"));
    }

    #[test]
    fn config_reads_overrides() {
        let config = config_from(&[
            ("NUDGE_BIND_ADDR", "127.0.0.1:9000"),
            ("NUDGE_DB_PATH", "/tmp/nudge-test.db"),
            ("NUDGE_HOSTNAME", "laptop"),
            ("HOSTNAME", "ignored"),
            ("NUDGE_POLL_INTERVAL_SECS", "5"),
            ("NUDGE_PEERS", " desk:7878, ,tablet:7879 "),
        ])
        .unwrap();
        assert_eq!(config.port(), 9000);
        assert_eq!(config.db_path, PathBuf::from("/tmp/nudge-test.db"));
        assert_eq!(config.hostname, "laptop");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        let hosts: Vec<&str> = config.peers.iter().map(|p| p.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["desk", "tablet"]);
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let err = config_from(&[("NUDGE_POLL_INTERVAL_SECS", "1")]).unwrap_err();
        assert!(err.to_string().contains("NUDGE_POLL_INTERVAL_SECS"));
        let err = config_from(&[("NUDGE_DELAY_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("integer"));
        assert!(config_from(&[("NUDGE_BIND_ADDR", "localhost")]).is_err());
        assert!(config_from(&[("NUDGE_PEERS", "desk")]).is_err());
    }
}
