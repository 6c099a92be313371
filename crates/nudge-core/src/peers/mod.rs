//! Peer directory
//!
//! Cache of other nudge instances found through a [`ServiceBrowser`].
//! Entries live for a fixed TTL after their last announcement and are never
//! persisted.

mod browser;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::Peer;

pub use browser::{
    instance_name, ServiceBrowser, ServiceRecord, StaticBrowser, DEFAULT_DOMAIN, SERVICE_TYPE,
};

/// Concurrent cache of discovered peers keyed by `hostname:port`.
pub struct PeerDirectory {
    peers: Mutex<HashMap<String, Peer>>,
    own_hostname: String,
    ttl_secs: u32,
    service_name: Regex,
    clock: Arc<dyn Clock>,
}

impl PeerDirectory {
    pub fn new(own_hostname: impl Into<String>, ttl_secs: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            own_hostname: own_hostname.into(),
            ttl_secs,
            service_name: Regex::new(r"^nudge on (?P<host>\S.*)$").expect("Invalid regex"),
            clock,
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn own_hostname(&self) -> &str {
        &self.own_hostname
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.ttl_secs))
    }

    /// Whether `hostname` names this machine, with or without a domain suffix.
    fn is_own_host(&self, hostname: &str) -> bool {
        let short = |name: &str| {
            name.trim_end_matches('.')
                .split('.')
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase()
        };
        short(hostname) == short(&self.own_hostname)
    }

    /// Cache or refresh an announcement.
    ///
    /// Announcements of this instance and names that don't look like a
    /// nudge service are dropped. Returns the cached entry.
    pub fn observe(&self, record: &ServiceRecord) -> Option<Peer> {
        if !self.service_name.is_match(&record.instance_name) {
            debug!(instance = %record.instance_name, "ignoring foreign service");
            return None;
        }
        if self.is_own_host(&record.hostname) {
            return None;
        }

        let peer = Peer {
            instance_name: record.instance_name.clone(),
            hostname: record.hostname.clone(),
            domain: record.domain.clone(),
            port: record.port,
            first_seen: self.clock.now(),
            ttl_secs: self.ttl_secs,
        };
        let previous = self.peers().insert(peer.key(), peer.clone());
        if previous.is_none() {
            info!(peer = %peer.key(), instance = %peer.instance_name, "peer discovered");
        }
        Some(peer)
    }

    /// Evict entries whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut peers = self.peers();
        let before = peers.len();
        peers.retain(|key, peer| {
            let keep = !peer.is_expired(now);
            if !keep {
                info!(peer = %key, "peer expired");
            }
            keep
        });
        before - peers.len()
    }

    /// Every cached peer, ordered by key.
    pub fn all(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers().values().cloned().collect();
        peers.sort_by_key(Peer::key);
        peers
    }

    /// Look a peer up by `hostname:port`, instance name or bare hostname.
    pub fn find(&self, name: &str) -> Option<Peer> {
        let peers = self.peers();
        if let Some(peer) = peers.get(name) {
            return Some(peer.clone());
        }
        let mut matches: Vec<&Peer> = peers
            .values()
            .filter(|peer| peer.instance_name == name || peer.hostname == name)
            .collect();
        matches.sort_by_key(|peer| peer.key());
        matches.first().map(|peer| (*peer).clone())
    }

    /// Feed one browse result into the cache.
    pub async fn refresh(&self, browser: &dyn ServiceBrowser) -> crate::Result<usize> {
        let records = browser.browse(SERVICE_TYPE).await?;
        Ok(records
            .iter()
            .filter_map(|record| self.observe(record))
            .count())
    }

    /// Register this instance, then keep browsing and purging until
    /// `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        browser: Arc<dyn ServiceBrowser>,
        own_record: ServiceRecord,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).browse_loop(browser, own_record, cancel.clone())),
            tokio::spawn(Arc::clone(self).purge_loop(cancel.clone())),
        ]
    }

    async fn browse_loop(
        self: Arc<Self>,
        browser: Arc<dyn ServiceBrowser>,
        own_record: ServiceRecord,
        cancel: CancellationToken,
    ) {
        if let Err(error) = browser.register(SERVICE_TYPE, &own_record).await {
            warn!(%error, "service registration failed");
        }
        // Refresh well before entries expire
        let period = (self.ttl() / 2).max(Duration::from_secs(1));
        loop {
            if let Err(error) = self.refresh(browser.as_ref()).await {
                warn!(%error, "service browse failed");
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("peer browser cancelled");
                    break;
                }
                () = tokio::time::sleep(period) => {}
            }
        }
    }

    async fn purge_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.ttl().max(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(period) => {
                    let purged = self.purge_expired();
                    if purged > 0 {
                        debug!(purged, "expired peers purged");
                    }
                }
            }
        }
    }
}
