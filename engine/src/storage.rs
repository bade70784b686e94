//! Retention store for the perfwatch engine
//!
//! Metrics, error records and credentials live in one SQLite database.
//! Every statement runs behind a single connection lock, so writes never
//! interleave and readers never observe half-written rows. Each row gets
//! an `inserted_at` sequence number under that lock; the sequence is
//! strictly increasing and is what retention eviction orders by, never
//! the self-reported `timestamp`.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::auth::{self, CredentialInfo, CredentialValidator};
use crate::config::RetryConfig;
use crate::error::{AuthError, EngineError, Result, StorageError, StorageResult};
use crate::records::{ErrorLevel, ErrorRecord, MetricRecord, NewError, NewMetric};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        cpu_usage REAL NOT NULL,
        memory_usage REAL NOT NULL,
        disk_usage REAL NOT NULL,
        network_sent INTEGER NOT NULL,
        network_recv INTEGER NOT NULL,
        execution_time REAL NOT NULL,
        operation_name TEXT NOT NULL,
        status TEXT NOT NULL,
        owner_key TEXT,
        inserted_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        trace_context TEXT NOT NULL,
        operation_name TEXT NOT NULL,
        cpu_impact REAL NOT NULL,
        memory_impact REAL NOT NULL,
        severity REAL NOT NULL,
        explanation TEXT NOT NULL,
        suggested_fix TEXT NOT NULL,
        owner_key TEXT,
        inserted_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        secret_hash TEXT UNIQUE NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_used_at TEXT,
        active INTEGER NOT NULL DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_metrics_inserted_at ON metrics(inserted_at);
    CREATE INDEX IF NOT EXISTS idx_metrics_owner ON metrics(owner_key);
    CREATE INDEX IF NOT EXISTS idx_errors_inserted_at ON errors(inserted_at);
    CREATE INDEX IF NOT EXISTS idx_errors_level ON errors(level);
    CREATE INDEX IF NOT EXISTS idx_errors_owner ON errors(owner_key);
";

const METRIC_COLUMNS: &str = "id, timestamp, cpu_usage, memory_usage, disk_usage, network_sent, \
     network_recv, execution_time, operation_name, status, owner_key, inserted_at";

const ERROR_COLUMNS: &str = "id, timestamp, level, category, message, trace_context, operation_name, \
     cpu_impact, memory_impact, severity, explanation, suggested_fix, owner_key, inserted_at";

/// SQLite-backed retention store
#[derive(Debug)]
pub struct RetentionStore {
    state: Mutex<StoreState>,
    retry: RetryConfig,
}

#[derive(Debug)]
struct StoreState {
    connection: Connection,
    last_sequence: i64,
}

impl StoreState {
    /// Next insertion sequence: wall-clock microseconds when the clock
    /// moves forward, otherwise one past the previous value.
    fn next_sequence(&mut self) -> i64 {
        let now = Utc::now().timestamp_micros();
        self.last_sequence = now.max(self.last_sequence + 1);
        self.last_sequence
    }
}

impl RetentionStore {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>, retry: RetryConfig) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|_| StorageError::DirectoryCreationFailed {
                path: parent.to_string_lossy().to_string(),
            })?;
        }

        let connection = Connection::open(path)?;
        let journal_mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %journal_mode, "Journal mode set");
        connection.busy_timeout(std::time::Duration::from_millis(retry.busy_timeout_ms))?;

        let store = Self::from_connection(connection, retry)?;
        tracing::info!(path = %path.display(), "Retention store opened");
        Ok(store)
    }

    /// Private in-memory database, gone when the store is dropped
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, RetryConfig::default())
    }

    fn from_connection(connection: Connection, retry: RetryConfig) -> StorageResult<Self> {
        connection.execute_batch(SCHEMA)?;

        let last_sequence: i64 = connection.query_row(
            "SELECT MAX(
                 COALESCE((SELECT MAX(inserted_at) FROM metrics), 0),
                 COALESCE((SELECT MAX(inserted_at) FROM errors), 0)
             )",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            state: Mutex::new(StoreState {
                connection,
                last_sequence,
            }),
            retry,
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Run a write under the lock, retrying transient failures with
    /// backoff. The final failure is logged before it is returned.
    fn write_with_retry<T>(
        &self,
        table: &'static str,
        mut op: impl FnMut(&mut StoreState) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let mut state = self.lock()?;
                op(&mut state)
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_attempts && is_transient(&e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(table, attempt, error = %e, ?delay, "Write failed, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    tracing::error!(table, attempt, error = %e, "Write failed");
                    return Err(StorageError::WriteFailed {
                        table,
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Append a metric row, returning its id
    pub fn insert_metric(&self, metric: &NewMetric) -> StorageResult<i64> {
        self.write_with_retry("metrics", |state| {
            let sequence = state.next_sequence();
            state.connection.execute(
                "INSERT INTO metrics (timestamp, cpu_usage, memory_usage, disk_usage,
                                      network_sent, network_recv, execution_time,
                                      operation_name, status, owner_key, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    metric.timestamp,
                    metric.cpu_usage,
                    metric.memory_usage,
                    metric.disk_usage,
                    clamp_counter(metric.network_sent),
                    clamp_counter(metric.network_recv),
                    metric.execution_time,
                    metric.operation_name,
                    metric.status.as_str(),
                    metric.owner_key,
                    sequence,
                ],
            )?;
            Ok(state.connection.last_insert_rowid())
        })
    }

    /// Append an error row, returning its id
    pub fn insert_error(&self, error: &NewError) -> StorageResult<i64> {
        self.write_with_retry("errors", |state| {
            let sequence = state.next_sequence();
            state.connection.execute(
                "INSERT INTO errors (timestamp, level, category, message, trace_context,
                                     operation_name, cpu_impact, memory_impact, severity,
                                     explanation, suggested_fix, owner_key, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    error.timestamp,
                    error.level.as_str(),
                    error.category,
                    error.message,
                    error.trace_context,
                    error.operation_name,
                    error.cpu_impact,
                    error.memory_impact,
                    error.severity,
                    error.explanation,
                    error.suggested_fix,
                    error.owner_key,
                    sequence,
                ],
            )?;
            Ok(state.connection.last_insert_rowid())
        })
    }

    /// Most recent metrics first, optionally restricted to one owner
    pub fn query_metrics(&self, limit: usize, owner_key: Option<&str>) -> StorageResult<Vec<MetricRecord>> {
        let state = self.lock()?;
        let mut statement = state.connection.prepare_cached(&format!(
            "SELECT {METRIC_COLUMNS} FROM metrics
             WHERE (?2 IS NULL OR owner_key = ?2)
             ORDER BY inserted_at DESC, id DESC
             LIMIT ?1"
        ))?;

        let rows = statement.query_map(params![sql_limit(limit), owner_key], metric_from_row)?;
        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row?);
        }
        Ok(metrics)
    }

    /// Most recent errors first, optionally restricted to a level
    /// (case-insensitive) and to one owner
    pub fn query_errors(
        &self,
        limit: usize,
        level: Option<&str>,
        owner_key: Option<&str>,
    ) -> StorageResult<Vec<ErrorRecord>> {
        let level = level.map(|l| match l.parse::<ErrorLevel>() {
            Ok(level) => level.as_str().to_string(),
            Err(_) => l.trim().to_uppercase(),
        });
        let state = self.lock()?;
        let mut statement = state.connection.prepare_cached(&format!(
            "SELECT {ERROR_COLUMNS} FROM errors
             WHERE (?2 IS NULL OR level = ?2)
               AND (?3 IS NULL OR owner_key = ?3)
             ORDER BY inserted_at DESC, id DESC
             LIMIT ?1"
        ))?;

        let rows = statement.query_map(params![sql_limit(limit), level, owner_key], error_from_row)?;
        let mut errors = Vec::new();
        for row in rows {
            errors.push(row?);
        }
        Ok(errors)
    }

    /// Delete every metric row except the `max_rows` most recently
    /// inserted. One DELETE statement decides and removes, so rows
    /// written concurrently are either kept or were already older than
    /// the cut.
    pub fn evict_excess_metrics(&self, max_rows: usize) -> StorageResult<usize> {
        self.evict_excess("metrics", max_rows)
    }

    /// Same policy as [`Self::evict_excess_metrics`] for error rows
    pub fn evict_excess_errors(&self, max_rows: usize) -> StorageResult<usize> {
        self.evict_excess("errors", max_rows)
    }

    fn evict_excess(&self, table: &'static str, max_rows: usize) -> StorageResult<usize> {
        let state = self.lock()?;
        let deleted = state.connection.execute(
            &format!(
                "DELETE FROM {table} WHERE id NOT IN (
                     SELECT id FROM {table} ORDER BY inserted_at DESC, id DESC LIMIT ?1
                 )"
            ),
            params![sql_limit(max_rows)],
        )?;

        if deleted > 0 {
            tracing::debug!(table, deleted, max_rows, "Evicted excess rows");
        }
        Ok(deleted)
    }

    pub fn count_metrics(&self) -> StorageResult<usize> {
        self.count("metrics")
    }

    pub fn count_errors(&self) -> StorageResult<usize> {
        self.count("errors")
    }

    fn count(&self, table: &'static str) -> StorageResult<usize> {
        let state = self.lock()?;
        let count: i64 = state
            .connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Issue a new credential and return the token. The token itself is
    /// not stored and cannot be recovered.
    pub fn create_credential(&self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::EmptyName.into());
        }

        let token = auth::generate_token();
        let hash = auth::hash_token(&token)?;

        self.write_with_retry("credentials", |state| {
            state.connection.execute(
                "INSERT INTO credentials (secret_hash, name, created_at, active)
                 VALUES (?1, ?2, ?3, 1)",
                params![hash, name, Utc::now()],
            )
        })?;

        tracing::info!(name, "Created new API key");
        Ok(token)
    }

    /// Deactivate every active credential with the given name
    pub fn revoke_credential(&self, name: &str) -> Result<usize> {
        let revoked = self.write_with_retry("credentials", |state| {
            state.connection.execute(
                "UPDATE credentials SET active = 0 WHERE name = ?1 AND active = 1",
                params![name],
            )
        })?;

        if revoked == 0 {
            return Err(AuthError::UnknownCredential { name: name.to_string() }.into());
        }
        tracing::info!(name, revoked, "Revoked API key");
        Ok(revoked)
    }

    /// Credential metadata, newest first
    pub fn list_credentials(&self) -> StorageResult<Vec<CredentialInfo>> {
        let state = self.lock()?;
        let mut statement = state.connection.prepare(
            "SELECT id, name, created_at, last_used_at, active
             FROM credentials ORDER BY id DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(CredentialInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                last_used_at: row.get(3)?,
                active: row.get::<_, i64>(4)? != 0,
            })
        })?;

        let mut credentials = Vec::new();
        for row in rows {
            credentials.push(row?);
        }
        Ok(credentials)
    }

    /// Check a token against every active credential and, on a match,
    /// mark it used. Returns the id and name of the matching credential.
    ///
    /// Hash verification is deliberately slow, so it runs outside the
    /// connection lock. The touch is conditional on the key still being
    /// active, which keeps a revocation that lands in between from being
    /// overridden.
    pub fn authenticate_credential(&self, token: &str) -> Result<Option<(i64, String)>> {
        let candidates: Vec<(i64, String, String)> = {
            let state = self.lock()?;
            let mut statement = state
                .connection
                .prepare_cached("SELECT id, secret_hash, name FROM credentials WHERE active = 1")?;
            let rows = statement.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            let mut candidates = Vec::new();
            for row in rows {
                candidates.push(row?);
            }
            candidates
        };

        let Some((id, _, name)) = candidates
            .into_iter()
            .find(|(_, hash, _)| auth::verify_token(token, hash))
        else {
            return Ok(None);
        };

        let touched = self.write_with_retry("credentials", |state| {
            state.connection.execute(
                "UPDATE credentials SET last_used_at = ?1 WHERE id = ?2 AND active = 1",
                params![Utc::now(), id],
            )
        })?;
        Ok((touched == 1).then_some((id, name)))
    }

    pub fn validate_credential(&self, token: &str) -> Result<bool> {
        Ok(self.authenticate_credential(token)?.is_some())
    }
}

impl CredentialValidator for RetentionStore {
    fn validate_credential(&self, token: &str) -> Result<bool> {
        RetentionStore::validate_credential(self, token)
    }
}

fn is_transient(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked)
            | Some(rusqlite::ErrorCode::SystemIoFailure)
    )
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn clamp_counter(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_text<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = EngineError>,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|e: EngineError| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<MetricRecord> {
    Ok(MetricRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        cpu_usage: row.get(2)?,
        memory_usage: row.get(3)?,
        disk_usage: row.get(4)?,
        network_sent: row.get::<_, i64>(5)?.max(0) as u64,
        network_recv: row.get::<_, i64>(6)?.max(0) as u64,
        execution_time: row.get(7)?,
        operation_name: row.get(8)?,
        status: parse_text(row, 9)?,
        owner_key: row.get(10)?,
        inserted_at: row.get(11)?,
    })
}

fn error_from_row(row: &Row<'_>) -> rusqlite::Result<ErrorRecord> {
    Ok(ErrorRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        level: parse_text(row, 2)?,
        category: row.get(3)?,
        message: row.get(4)?,
        trace_context: row.get(5)?,
        operation_name: row.get(6)?,
        cpu_impact: row.get(7)?,
        memory_impact: row.get(8)?,
        severity: row.get(9)?,
        explanation: row.get(10)?,
        suggested_fix: row.get(11)?,
        owner_key: row.get(12)?,
        inserted_at: row.get(13)?,
    })
}
