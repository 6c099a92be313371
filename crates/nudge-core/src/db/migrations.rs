//! Database migrations

use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> rusqlite::Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Run `statements` in one immediate transaction.
fn apply(conn: &Connection, statements: &[&str]) -> rusqlite::Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    for stmt in statements {
        if let Err(e) = conn.execute_batch(stmt) {
            conn.execute_batch("ROLLBACK").ok();
            return Err(e);
        }
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e);
    }

    Ok(())
}

/// Migration to version 1: reminders and their notifications
fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Reminders; `timestamp` is unix seconds for once, seconds into the day otherwise
        "CREATE TABLE IF NOT EXISTS reminder (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL CHECK (length(trim(title)) > 0),
            description TEXT NOT NULL DEFAULT '',
            timestamp INTEGER NOT NULL,
            repeat_rule TEXT NOT NULL CHECK (repeat_rule IN ('once', 'daily', 'custom')),
            weekday_mask INTEGER NOT NULL DEFAULT 0 CHECK (weekday_mask BETWEEN 0 AND 127),
            repeat_counter INTEGER NOT NULL DEFAULT 0 CHECK (repeat_counter >= 0),
            repeat_limit INTEGER CHECK (repeat_limit IS NULL OR repeat_limit >= 0),
            finished INTEGER NOT NULL DEFAULT 0 CHECK (finished IN (0, 1)),
            changed INTEGER NOT NULL,
            CHECK (repeat_rule = 'once' OR (timestamp >= 0 AND timestamp < 86400))
        )",
        "CREATE INDEX IF NOT EXISTS idx_reminder_finished ON reminder(finished)",
        "CREATE TRIGGER IF NOT EXISTS reminder_uuid_immutable BEFORE UPDATE OF uuid ON reminder
         FOR EACH ROW
         WHEN NEW.uuid <> OLD.uuid
         BEGIN
             SELECT RAISE(ABORT, 'reminder uuid is immutable');
         END",
        // One notification per reminder and whole-minute occurrence
        "CREATE TABLE IF NOT EXISTS notification (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reminder_id INTEGER NOT NULL REFERENCES reminder(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL CHECK (timestamp % 60 = 0),
            displayed INTEGER,
            acknowledged INTEGER,
            UNIQUE (reminder_id, timestamp),
            CHECK (acknowledged IS NULL OR displayed IS NOT NULL)
        )",
        "CREATE INDEX IF NOT EXISTS idx_notification_pending ON notification(acknowledged, timestamp)",
        // Record migration version
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements)?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
