//! Peer model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Another running instance discovered on the network.
///
/// Pure cache state: peers are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Advertised service instance name
    pub instance_name: String,
    /// Host the instance runs on
    pub hostname: String,
    /// Discovery domain, usually `local`
    pub domain: String,
    /// HTTP port of the instance
    pub port: u16,
    /// When the entry was last (re)announced
    pub first_seen: DateTime<Utc>,
    /// Seconds the entry stays valid after `first_seen`
    pub ttl_secs: u32,
}

impl Peer {
    /// Cache key, `hostname:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Instant after which the entry is evicted.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.first_seen + Duration::seconds(i64::from(self.ttl_secs))
    }

    /// Whether the entry has outlived its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    /// Base URL of the peer's HTTP surface.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}
