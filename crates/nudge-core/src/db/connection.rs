//! Gateway connection, transaction scopes and savepoints

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};

use crate::clock::Clock;
use crate::error::{Error, Result, SavepointError};

use super::migrations;

/// Attempts made on a busy database before the error is surfaced.
const BUSY_RETRY_ATTEMPTS: u32 = 100;

/// Fixed pause between busy retries.
const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// One connection to the reminder store.
///
/// Every mutating call either joins the explicit transaction opened through
/// [`Gateway::transaction`] or wraps itself in an implicit one. A connection
/// carries at most one explicit transaction and must not be shared between
/// workers; use [`GatewayPool`](super::GatewayPool) for concurrent access.
pub struct Gateway {
    conn: Connection,
    clock: Arc<dyn Clock>,
    in_transaction: bool,
    savepoints: Vec<String>,
}

impl Gateway {
    /// Open the database file at `path`, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn, clock)
    }

    /// Open a private in-memory database (useful for testing)
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, clock)
    }

    /// Open a `file:` URI, used for shared-cache in-memory pools.
    pub(crate) fn open_uri(uri: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_with_flags(uri, uri_flags())?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        let gateway = Self {
            conn,
            clock,
            in_transaction: false,
            savepoints: Vec::new(),
        };
        gateway.configure()?;
        gateway.migrate()?;
        Ok(gateway)
    }

    /// Configure `SQLite` for concurrent local access
    fn configure(&self) -> Result<()> {
        // In-memory databases report "memory" and ignore WAL
        self.conn
            .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get::<_, String>(0))
            .ok();
        self.conn.execute_batch("PRAGMA synchronous = NORMAL;").ok();
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        retry_on_busy(|| migrations::run(&self.conn))
    }

    /// Current instant of the reference clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Clock used for `changed` stamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Whether an explicit transaction is open on this connection.
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Names of the active savepoints, oldest first.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    /// Open the explicit transaction for this connection.
    ///
    /// All gateway calls made through the returned scope join it. Dropping
    /// the scope without [`TransactionScope::commit`] rolls everything back.
    pub fn transaction(&mut self) -> Result<TransactionScope<'_>> {
        if self.in_transaction {
            return Err(SavepointError::TransactionActive.into());
        }
        retry_on_busy(|| self.conn.execute_batch("BEGIN IMMEDIATE"))?;
        self.in_transaction = true;
        tracing::debug!("db_tx_begin");
        Ok(TransactionScope {
            gateway: self,
            finished: false,
        })
    }

    fn end_transaction(&mut self, commit: bool) -> Result<()> {
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        let result = retry_on_busy(|| self.conn.execute_batch(sql));
        if result.is_err() && !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK").ok();
        }
        self.in_transaction = false;
        self.savepoints.clear();
        result
    }

    /// Mark a rollback point inside the explicit transaction.
    pub fn create_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_transaction()?;
        validate_savepoint_name(name)?;
        retry_on_busy(|| self.conn.execute_batch(&format!("SAVEPOINT {name}")))?;
        self.savepoints.push(name.to_string());
        Ok(())
    }

    /// Keep the work done since `name`.
    ///
    /// Savepoints do not nest independently: this releases `name` together
    /// with every savepoint created before it. Newer savepoints stay usable.
    ///
    /// No SQL `RELEASE` is issued, since SQLite would drop the newer marks
    /// too. The released marks stay in the connection until the transaction
    /// ends and can no longer be named.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_transaction()?;
        let index = self.savepoint_index(name)?;
        self.savepoints.drain(..=index);
        Ok(())
    }

    /// Undo the work done since `name`.
    ///
    /// `name` and every savepoint created after it leave the namespace; the
    /// surrounding transaction stays open.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_transaction()?;
        let index = self.savepoint_index(name)?;
        retry_on_busy(|| {
            self.conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
            ))
        })?;
        self.savepoints.truncate(index);
        Ok(())
    }

    fn require_transaction(&self) -> Result<()> {
        if self.in_transaction {
            Ok(())
        } else {
            Err(SavepointError::NoTransaction.into())
        }
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|active| active == name)
            .ok_or_else(|| SavepointError::UnknownSavepoint(name.to_string()).into())
    }

    /// Run a mutation in the active explicit transaction, or in an implicit
    /// one that commits before returning.
    pub(crate) fn write<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        if self.in_transaction {
            return retry_on_busy(|| op(&self.conn));
        }
        retry_on_busy(|| {
            let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Run a read-only query.
    pub(crate) fn read<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        retry_on_busy(|| op(&self.conn))
    }
}

/// The explicit transaction of one [`Gateway`].
///
/// Derefs to the gateway so the usual operations can be called on it.
pub struct TransactionScope<'g> {
    gateway: &'g mut Gateway,
    finished: bool,
}

impl TransactionScope<'_> {
    /// Make the transaction's work durable.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let result = self.gateway.end_transaction(true);
        if result.is_ok() {
            tracing::debug!("db_tx_commit");
        }
        result
    }

    /// Discard the transaction's work.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        tracing::debug!("db_tx_rollback");
        self.gateway.end_transaction(false)
    }
}

impl Deref for TransactionScope<'_> {
    type Target = Gateway;

    fn deref(&self) -> &Gateway {
        self.gateway
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Gateway {
        self.gateway
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("db_tx_rollback: scope dropped without commit");
            if let Err(error) = self.gateway.end_transaction(false) {
                tracing::error!(%error, "db_tx_rollback_failed");
            }
        }
    }
}

fn uri_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

fn validate_savepoint_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid savepoint name '{name}'")))
    }
}

/// Whether SQLite reported transient lock contention.
fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Run `op`, sleeping and retrying while the database is busy.
pub(crate) fn retry_on_busy<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if is_busy(&error) => {
                if attempt >= BUSY_RETRY_ATTEMPTS {
                    tracing::warn!(attempts = attempt, "database stayed busy, giving up");
                    return Err(Error::Busy { attempts: attempt });
                }
                tracing::trace!(attempt, "database busy, retrying");
                std::thread::sleep(BUSY_BACKOFF);
            }
            Err(error) => return Err(map_sqlite_error(error)),
        }
    }
}

fn map_sqlite_error(error: rusqlite::Error) -> Error {
    match error {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::Constraint(message.unwrap_or_else(|| failure.to_string()))
        }
        other => Error::Database(other),
    }
}

/// Instant from unix seconds stored in column `index`.
pub(crate) fn secs_to_instant(index: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| out_of_range(index, secs))
}

/// Instant from unix milliseconds stored in column `index`.
pub(crate) fn millis_to_instant(index: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| out_of_range(index, millis))
}

fn out_of_range(index: usize, value: i64) -> rusqlite::Error {
    conversion_error(
        index,
        Type::Integer,
        Error::InvalidInput(format!("instant {value} out of range")),
    )
}

pub(crate) fn conversion_error(
    index: usize,
    ty: Type,
    error: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, ty, Box::new(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use pretty_assertions::assert_eq;

    fn setup() -> Gateway {
        Gateway::open_in_memory(Arc::new(SystemClock)).unwrap()
    }

    fn count_reminders(gateway: &Gateway) -> i64 {
        gateway
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM reminder", [], |row| row.get(0)))
            .unwrap()
    }

    fn insert_raw(gateway: &Gateway, uuid: &str) {
        gateway
            .write(|conn| {
                conn.execute(
                    "INSERT INTO reminder (uuid, title, timestamp, repeat_rule, changed)
                     VALUES (?1, 'raw', 3600, 'daily', 0)",
                    [uuid],
                )
            })
            .unwrap();
    }

    #[test]
    fn test_savepoint_requires_transaction() {
        let mut gateway = setup();
        let err = gateway.create_savepoint("s1").unwrap_err();
        assert!(matches!(
            err,
            Error::Savepoint(SavepointError::NoTransaction)
        ));
    }

    #[test]
    fn test_one_explicit_transaction_per_connection() {
        let mut gateway = setup();
        let scope = gateway.transaction().unwrap();
        assert!(scope.in_transaction());
        scope.commit().unwrap();
        assert!(!gateway.in_transaction());

        let mut scope = gateway.transaction().unwrap();
        let err = scope.transaction().err().unwrap();
        assert!(matches!(
            err,
            Error::Savepoint(SavepointError::TransactionActive)
        ));
    }

    #[test]
    fn test_rollback_to_savepoint_discards_it_and_later_ones() {
        let mut gateway = setup();
        let mut scope = gateway.transaction().unwrap();
        insert_raw(&scope, "a");
        scope.create_savepoint("s1").unwrap();
        insert_raw(&scope, "b");
        scope.create_savepoint("s2").unwrap();
        insert_raw(&scope, "c");

        scope.rollback_to_savepoint("s1").unwrap();
        assert!(scope.savepoints().is_empty());
        assert_eq!(count_reminders(&scope), 1);

        let err = scope.release_savepoint("s2").unwrap_err();
        assert_eq!(err.to_string(), "Savepoint error: unknown savepoint: s2");

        scope.commit().unwrap();
        assert_eq!(count_reminders(&gateway), 1);
    }

    #[test]
    fn test_release_savepoint_releases_earlier_ones() {
        let mut gateway = setup();
        let mut scope = gateway.transaction().unwrap();
        scope.create_savepoint("s1").unwrap();
        insert_raw(&scope, "a");
        scope.create_savepoint("s2").unwrap();
        insert_raw(&scope, "b");
        scope.create_savepoint("s3").unwrap();
        insert_raw(&scope, "c");

        scope.release_savepoint("s2").unwrap();
        assert_eq!(scope.savepoints(), ["s3".to_string()]);

        let err = scope.release_savepoint("s1").unwrap_err();
        assert!(matches!(
            err,
            Error::Savepoint(SavepointError::UnknownSavepoint(ref name)) if name == "s1"
        ));
        assert!(scope.rollback_to_savepoint("s2").is_err());

        // The newer savepoint still undoes its own work only
        scope.rollback_to_savepoint("s3").unwrap();
        assert!(scope.savepoints().is_empty());
        assert_eq!(count_reminders(&scope), 2);

        scope.commit().unwrap();
        assert_eq!(count_reminders(&gateway), 2);
    }

    #[test]
    fn test_released_name_can_be_reused() {
        let mut gateway = setup();
        let mut scope = gateway.transaction().unwrap();
        scope.create_savepoint("edit").unwrap();
        insert_raw(&scope, "a");
        scope.release_savepoint("edit").unwrap();

        scope.create_savepoint("edit").unwrap();
        insert_raw(&scope, "b");
        scope.rollback_to_savepoint("edit").unwrap();

        scope.commit().unwrap();
        assert_eq!(count_reminders(&gateway), 1);
    }

    #[test]
    fn test_dropped_scope_rolls_back() {
        let mut gateway = setup();
        {
            let scope = gateway.transaction().unwrap();
            insert_raw(&scope, "a");
        }
        assert!(!gateway.in_transaction());
        assert_eq!(count_reminders(&gateway), 0);
    }

    #[test]
    fn test_invalid_savepoint_name_rejected() {
        let mut gateway = setup();
        let mut scope = gateway.transaction().unwrap();
        assert!(scope.create_savepoint("drop table; --").is_err());
        assert!(scope.create_savepoint("1abc").is_err());
        assert!(scope.create_savepoint("merge_1").is_ok());
    }

    #[test]
    fn test_busy_is_retried_then_surfaced() {
        let mut calls = 0;
        let result: Result<()> = retry_on_busy(|| {
            calls += 1;
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            ))
        });
        assert!(matches!(result, Err(Error::Busy { attempts }) if attempts == BUSY_RETRY_ATTEMPTS));
        assert_eq!(calls, BUSY_RETRY_ATTEMPTS);
    }

    #[test]
    fn test_busy_recovers() {
        let mut calls = 0;
        let value = retry_on_busy(|| {
            calls += 1;
            if calls < 3 {
                Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    None,
                ))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_other_errors_propagate_immediately() {
        let mut calls = 0;
        let result: Result<()> = retry_on_busy(|| {
            calls += 1;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(calls, 1);
    }
}
