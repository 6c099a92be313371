//! Connection pool handing out one gateway per unit of work

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, OpenFlags};

use crate::clock::Clock;
use crate::error::{Error, Result};

use super::connection::Gateway;

/// Idle connections kept around for reuse.
const MAX_IDLE: usize = 8;

enum Target {
    File(PathBuf),
    Memory(String),
}

struct PoolInner {
    target: Target,
    clock: Arc<dyn Clock>,
    idle: Mutex<Vec<Gateway>>,
    // Keeps a shared-cache in-memory database alive between checkouts
    _anchor: Option<Mutex<Connection>>,
}

/// Shared handle to the reminder store.
///
/// Cheap to clone. Every checkout owns a whole connection, so explicit
/// transactions on different checkouts never interleave.
#[derive(Clone)]
pub struct GatewayPool {
    inner: Arc<PoolInner>,
}

impl GatewayPool {
    /// Pool over the database file at `path`, creating it and its parent
    /// directory if needed.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let first = Gateway::open(&path, Arc::clone(&clock))?;
        tracing::info!(path = %path.display(), "opened reminder store");
        Ok(Self::with_first(Target::File(path), clock, first, None))
    }

    /// Pool over a fresh in-memory database shared by all its connections.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let uri = format!("file:nudge-{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
        let anchor = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        let first = Gateway::open_uri(&uri, Arc::clone(&clock))?;
        Ok(Self::with_first(
            Target::Memory(uri),
            clock,
            first,
            Some(Mutex::new(anchor)),
        ))
    }

    fn with_first(
        target: Target,
        clock: Arc<dyn Clock>,
        first: Gateway,
        anchor: Option<Mutex<Connection>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                target,
                clock,
                idle: Mutex::new(vec![first]),
                _anchor: anchor,
            }),
        }
    }

    /// Reference clock shared by every connection.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Take a connection, opening a new one when none is idle.
    ///
    /// Blocking; call from synchronous code or inside [`GatewayPool::run`].
    pub fn checkout(&self) -> Result<PooledGateway> {
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let gateway = match idle {
            Some(gateway) => gateway,
            None => self.connect()?,
        };
        Ok(PooledGateway {
            gateway: Some(gateway),
            pool: Arc::clone(&self.inner),
        })
    }

    fn connect(&self) -> Result<Gateway> {
        let clock = Arc::clone(&self.inner.clock);
        match &self.inner.target {
            Target::File(path) => Gateway::open(path, clock),
            Target::Memory(uri) => Gateway::open_uri(uri, clock),
        }
    }

    /// Run blocking storage work on tokio's blocking pool.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Gateway) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut gateway = pool.checkout()?;
            work(&mut *gateway)
        })
        .await
        .map_err(|e| Error::Worker(format!("storage task failed: {e}")))?
    }
}

/// A checked-out connection, returned to the pool on drop.
pub struct PooledGateway {
    gateway: Option<Gateway>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledGateway {
    type Target = Gateway;

    fn deref(&self) -> &Gateway {
        self.gateway.as_ref().unwrap_or_else(|| unreachable!("gateway taken before drop"))
    }
}

impl DerefMut for PooledGateway {
    fn deref_mut(&mut self) -> &mut Gateway {
        self.gateway.as_mut().unwrap_or_else(|| unreachable!("gateway taken before drop"))
    }
}

impl Drop for PooledGateway {
    fn drop(&mut self) {
        let Some(gateway) = self.gateway.take() else {
            return;
        };
        if gateway.in_transaction() {
            tracing::warn!("discarding connection with an open transaction");
            return;
        }
        let mut idle = self.pool.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(gateway);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::models::Reminder;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_in_memory_connections_share_data() {
        let pool = GatewayPool::in_memory(Arc::new(SystemClock)).unwrap();
        let first = pool.checkout().unwrap();
        let second = pool.checkout().unwrap();

        let stored = first
            .add_reminder(&Reminder::daily("Shared", 60, first.now()))
            .unwrap();
        assert_eq!(second.get_all_reminders().unwrap(), vec![stored]);
    }

    #[test]
    fn test_separate_pools_are_isolated() {
        let a = GatewayPool::in_memory(Arc::new(SystemClock)).unwrap();
        let b = GatewayPool::in_memory(Arc::new(SystemClock)).unwrap();
        let gateway = a.checkout().unwrap();
        gateway
            .add_reminder(&Reminder::daily("Only in a", 60, gateway.now()))
            .unwrap();
        assert!(b.checkout().unwrap().get_all_reminders().unwrap().is_empty());
    }

    #[test]
    fn test_file_pool_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("nudge.db");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        {
            let pool = GatewayPool::open(&path, Arc::clone(&clock)).unwrap();
            let gateway = pool.checkout().unwrap();
            gateway
                .add_reminder(&Reminder::daily("Persisted", 60, gateway.now()))
                .unwrap();
        }
        let pool = GatewayPool::open(&path, clock).unwrap();
        let all = pool.checkout().unwrap().get_all_reminders().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Persisted");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_on_blocking_pool() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let pool = GatewayPool::in_memory(Arc::new(ManualClock::new(now))).unwrap();

        let stored = pool
            .run(move |gateway| gateway.add_reminder(&Reminder::daily("Async", 120, now)))
            .await
            .unwrap();
        let id = stored.require_id().unwrap();

        let fetched = pool
            .run(move |gateway| gateway.get_reminder_by_id(id))
            .await
            .unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transactions_on_separate_checkouts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = GatewayPool::open(dir.path().join("nudge.db"), Arc::new(SystemClock)).unwrap();

        let writer = pool.clone();
        let inserted = pool
            .run(move |gateway| {
                let scope = gateway.transaction()?;
                scope.add_reminder(&Reminder::daily("In tx", 60, scope.now()))?;
                // Another checkout waits for the write lock and then sees the commit
                let other = std::thread::spawn(move || {
                    let gateway = writer.checkout()?;
                    gateway.add_reminder(&Reminder::daily("After", 120, gateway.now()))
                });
                scope.commit()?;
                other
                    .join()
                    .map_err(|_| Error::Worker("writer panicked".into()))?
            })
            .await
            .unwrap();
        assert_eq!(inserted.title, "After");

        let titles: Vec<String> = pool
            .run(|gateway| gateway.get_all_reminders())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["In tx".to_string(), "After".to_string()]);
    }
}
