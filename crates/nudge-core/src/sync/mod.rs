//! Replica synchronization with peer instances
//!
//! One round against a peer pulls its whole collection, merges it locally
//! with last-writer-wins on `changed`, then pushes back the local records
//! the peer is missing or holds an older version of.

mod client;
mod merge;

use serde::{Deserialize, Serialize};

use crate::db::GatewayPool;
use crate::error::Result;
use crate::models::{Peer, Reminder};

pub use client::{PeerClient, DEFAULT_TIMEOUT, PULL_PATH, PUSH_PATH};
pub use merge::{compute_delta, merge_remote, MergeReport};

/// Outcome of one sync round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Records received from the peer
    pub pulled: usize,
    /// What merging them did locally
    pub merge: MergeReport,
    /// Records sent back
    pub pushed: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    pool: GatewayPool,
    client: PeerClient,
}

impl SyncEngine {
    pub const fn new(pool: GatewayPool, client: PeerClient) -> Self {
        Self { pool, client }
    }

    /// Full collection, as served on the pull endpoint.
    pub async fn local_snapshot(&self) -> Result<Vec<Reminder>> {
        self.pool.run(|gateway| gateway.get_all_reminders()).await
    }

    /// Merge records received from a peer.
    pub async fn accept(&self, remote: Vec<Reminder>) -> Result<MergeReport> {
        self.pool
            .run(move |gateway| merge_remote(gateway, &remote))
            .await
    }

    /// Run one pull, merge, push round against `peer`.
    pub async fn synchronize(&self, peer: &Peer) -> Result<SyncReport> {
        let base_url = peer.base_url();
        tracing::info!(peer = %peer.key(), "sync started");

        let remote = self.client.pull(&base_url).await?;
        let pulled = remote.len();
        let local_view = remote.clone();
        let merge = self.accept(remote).await?;

        let local = self.local_snapshot().await?;
        let delta = compute_delta(&local, &local_view);
        if !delta.is_empty() {
            self.client.push(&base_url, &delta).await?;
        }

        let report = SyncReport {
            pulled,
            merge,
            pushed: delta.len(),
        };
        tracing::info!(
            peer = %peer.key(),
            pulled = report.pulled,
            inserted = report.merge.inserted,
            updated = report.merge.updated,
            pushed = report.pushed,
            "sync finished"
        );
        Ok(report)
    }
}
