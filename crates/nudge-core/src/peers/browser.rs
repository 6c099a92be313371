//! Service discovery seam

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Service type every instance registers and browses for.
pub const SERVICE_TYPE: &str = "_nudge._tcp";

/// Default discovery domain
pub const DEFAULT_DOMAIN: &str = "local";

/// Advertised instance name for `hostname`.
pub fn instance_name(hostname: &str) -> String {
    format!("nudge on {hostname}")
}

/// One service announcement as seen on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub instance_name: String,
    pub hostname: String,
    pub domain: String,
    pub port: u16,
}

impl ServiceRecord {
    /// Record advertising the instance running on `hostname:port`.
    pub fn for_host(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        Self {
            instance_name: instance_name(&hostname),
            hostname,
            domain: DEFAULT_DOMAIN.to_string(),
            port,
        }
    }

    /// Parse a `host:port` address.
    pub fn parse_address(address: &str) -> Result<Self> {
        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("peer address '{address}' needs host:port")))?;
        if host.is_empty() {
            return Err(Error::InvalidInput(format!(
                "peer address '{address}' has no host"
            )));
        }
        let port = port
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid port in peer address '{address}'")))?;
        Ok(Self::for_host(host, port))
    }
}

/// Registers this instance and finds the others.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Announce `record` under `service_type`.
    async fn register(&self, service_type: &str, record: &ServiceRecord) -> Result<()>;

    /// Current announcements for `service_type`.
    async fn browse(&self, service_type: &str) -> Result<Vec<ServiceRecord>>;
}

/// Browser over a fixed list of peers, for networks without multicast.
#[derive(Debug, Default)]
pub struct StaticBrowser {
    records: Vec<ServiceRecord>,
    registered: Mutex<Option<ServiceRecord>>,
}

impl StaticBrowser {
    pub fn new(records: Vec<ServiceRecord>) -> Self {
        Self {
            records,
            registered: Mutex::new(None),
        }
    }

    /// Browser announcing each `host:port` entry as a nudge instance.
    pub fn from_addresses<S: AsRef<str>>(addresses: &[S]) -> Result<Self> {
        let records = addresses
            .iter()
            .map(|address| ServiceRecord::parse_address(address.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(records))
    }

    /// The record passed to the last `register` call.
    pub fn registered(&self) -> Option<ServiceRecord> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ServiceBrowser for StaticBrowser {
    async fn register(&self, service_type: &str, record: &ServiceRecord) -> Result<()> {
        tracing::info!(service_type, instance = %record.instance_name, port = record.port, "service registered");
        *self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<Vec<ServiceRecord>> {
        if service_type != SERVICE_TYPE {
            return Ok(Vec::new());
        }
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_address() {
        let record = ServiceRecord::parse_address(" laptop:7878 ").unwrap();
        assert_eq!(
            record,
            ServiceRecord {
                instance_name: "nudge on laptop".into(),
                hostname: "laptop".into(),
                domain: "local".into(),
                port: 7878,
            }
        );
        assert!(ServiceRecord::parse_address("laptop").is_err());
        assert!(ServiceRecord::parse_address(":7878").is_err());
        assert!(ServiceRecord::parse_address("laptop:http").is_err());
    }

    #[tokio::test]
    async fn test_static_browser_only_answers_own_type() {
        let browser = StaticBrowser::from_addresses(&["a:1", "b:2"]).unwrap();
        assert_eq!(browser.browse(SERVICE_TYPE).await.unwrap().len(), 2);
        assert!(browser.browse("_http._tcp").await.unwrap().is_empty());

        let me = ServiceRecord::for_host("me", 7878);
        browser.register(SERVICE_TYPE, &me).await.unwrap();
        assert_eq!(browser.registered(), Some(me));
    }
}
