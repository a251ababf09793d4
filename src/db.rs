use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::PathBuf;
use std::time::Duration;

pub type DbPool = Pool<Sqlite>;

/// How long a writer waits for the database lock before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

pub async fn open_pool(dsn: &str) -> Result<DbPool, String> {
    ensure_sqlite_file(dsn)?;
    let options = dsn
        .parse::<SqliteConnectOptions>()
        .map_err(|err| format!("database_dsn_parse_failed: {err}"))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);
    // every pooled connection to an in-memory database would see its own empty database
    let max_connections = if is_memory_dsn(dsn) { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .map_err(|err| format!("database_init_failed: {err}"))
}

/// Starts a write transaction that holds the database write lock from its first statement.
///
/// SQLite has no `SELECT ... FOR UPDATE`; taking the lock up front gives the same guarantee
/// for the rows read afterwards: no other writer can change them until commit or rollback.
/// Dropping the returned transaction without committing rolls it back.
pub async fn begin_immediate(pool: &DbPool) -> Result<Transaction<'static, Sqlite>, String> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| e.to_string())
}

/// Fixed-width UTC timestamp; lexical order of these strings is chronological order.
pub fn db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_db_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
}

/// Group id sets are stored as JSON integer arrays.
pub fn parse_id_set(raw: Option<&str>) -> Vec<i64> {
    raw.and_then(|v| serde_json::from_str::<Vec<i64>>(v).ok())
        .unwrap_or_default()
}

pub fn encode_id_set(ids: &[i64]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}
