use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::pipeline::NormalizedRecord;
use crate::session::{NormalizationSession, SessionOptions, SessionStatus};

/// One raw row from a source database. `offset` is its ordinal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub offset: u64,
    pub reference: String,
    pub name: String,
    pub tax_id: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl SourceRecord {
    pub fn new(reference: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            offset: 0,
            reference: reference.into(),
            name: name.into(),
            tax_id: None,
            raw: None,
        }
    }

    pub fn with_tax_id(mut self, tax_id: impl Into<String>) -> Self {
        self.tax_id = Some(tax_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub tax_id: String,
    pub references: Vec<String>,
}

pub trait SessionStore: Send + Sync {
    fn create(
        &self,
        database_ref: &str,
        total: u64,
        options: &SessionOptions,
    ) -> AppResult<NormalizationSession>;
    fn load(&self, id: i64) -> AppResult<Option<NormalizationSession>>;
    fn latest_for_database(&self, database_ref: &str) -> AppResult<Option<NormalizationSession>>;
    /// Ordered by priority, then id.
    fn with_status(&self, status: SessionStatus) -> AppResult<Vec<NormalizationSession>>;
    fn save(&self, session: &NormalizationSession) -> AppResult<()>;
    /// Never lowers a stored processed count.
    fn save_progress(&self, id: i64, processed: u64, errors: u64, at: DateTime<Utc>) -> AppResult<()>;
}

pub trait RecordSource: Send + Sync {
    fn total(&self, database_ref: &str) -> AppResult<u64>;
    /// Up to `limit` records starting at ordinal `offset`, in source order.
    fn fetch(&self, database_ref: &str, offset: u64, limit: usize) -> AppResult<Vec<SourceRecord>>;
}

pub trait NormalizedSink: Send + Sync {
    fn upsert_normalized(&self, record: &NormalizedRecord) -> AppResult<()>;
    fn duplicate_groups(&self, database_ref: &str) -> AppResult<Vec<DuplicateGroup>>;
}

pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(path, flags)?;
        run_migrations(&connection)?;
        info!(
            target: "session_store",
            path = %path.display(),
            "session store ready"
        );
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Appends records after the ones already imported for `database_ref`.
    pub fn import_records(&self, database_ref: &str, records: &[SourceRecord]) -> AppResult<usize> {
        let mut connection = self.connection.lock();
        let tx = connection.transaction()?;
        let start: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM source_records WHERE database_ref = ?1",
            [database_ref],
            |row| row.get(0),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO source_records (database_ref, position, reference, name, tax_id, raw_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (index, record) in records.iter().enumerate() {
                let raw_json = record
                    .raw
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    database_ref,
                    start + index as i64,
                    record.reference,
                    record.name,
                    record.tax_id,
                    raw_json,
                ])?;
            }
        }
        tx.commit()?;
        info!(
            target: "session_store",
            database = database_ref,
            count = records.len(),
            "imported source records"
        );
        Ok(records.len())
    }

    pub fn normalized_records(&self, database_ref: &str) -> AppResult<Vec<NormalizedRecord>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(
            "SELECT position, reference, name, normalized_name, tax_id, enrichment_json
            FROM normalized_records WHERE database_ref = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([database_ref], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (position, reference, name, normalized_name, tax_id, enrichment) = row?;
            records.push(NormalizedRecord {
                database_ref: database_ref.to_string(),
                offset: from_sql_count(position),
                reference,
                name,
                normalized_name,
                tax_id,
                enrichment: enrichment
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?,
            });
        }
        Ok(records)
    }
}

const SESSION_COLUMNS: &str = "id, database_ref, status, processed, total, errors, priority, last_error, started_at, finished_at, enrich, worker_count, last_activity_at";

impl SessionStore for SqliteStore {
    fn create(
        &self,
        database_ref: &str,
        total: u64,
        options: &SessionOptions,
    ) -> AppResult<NormalizationSession> {
        let started_at = Utc::now();
        let connection = self.connection.lock();
        connection.execute(
            "INSERT INTO normalization_sessions
                (database_ref, status, processed, total, priority, enrich, worker_count, started_at, last_activity_at)
            VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                database_ref,
                SessionStatus::Created.as_str(),
                to_sql_count(total),
                options.priority,
                options.enrich,
                options.worker_count.map(to_sql_size),
                started_at.to_rfc3339(),
            ],
        )?;
        Ok(NormalizationSession {
            id: connection.last_insert_rowid(),
            database_ref: database_ref.to_string(),
            status: SessionStatus::Created,
            processed: 0,
            total,
            errors: 0,
            priority: options.priority,
            enrich: options.enrich,
            worker_count: options.worker_count,
            last_error: None,
            started_at,
            finished_at: None,
            last_activity_at: started_at,
        })
    }

    fn load(&self, id: i64) -> AppResult<Option<NormalizationSession>> {
        let connection = self.connection.lock();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM normalization_sessions WHERE id = ?1");
        Ok(connection.query_row(&sql, [id], map_session).optional()?)
    }

    fn latest_for_database(&self, database_ref: &str) -> AppResult<Option<NormalizationSession>> {
        let connection = self.connection.lock();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM normalization_sessions
            WHERE database_ref = ?1 ORDER BY id DESC LIMIT 1"
        );
        Ok(connection
            .query_row(&sql, [database_ref], map_session)
            .optional()?)
    }

    fn with_status(&self, status: SessionStatus) -> AppResult<Vec<NormalizationSession>> {
        let connection = self.connection.lock();
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM normalization_sessions
            WHERE status = ?1 ORDER BY priority, id"
        );
        let mut stmt = connection.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], map_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn save(&self, session: &NormalizationSession) -> AppResult<()> {
        let connection = self.connection.lock();
        let updated = connection.execute(
            "UPDATE normalization_sessions
            SET status = ?2, processed = ?3, total = ?4, errors = ?5, priority = ?6,
                last_error = ?7, finished_at = ?8, enrich = ?9, worker_count = ?10,
                last_activity_at = ?11
            WHERE id = ?1",
            params![
                session.id,
                session.status.as_str(),
                to_sql_count(session.processed),
                to_sql_count(session.total),
                to_sql_count(session.errors),
                session.priority,
                session.last_error,
                session.finished_at.map(|at| at.to_rfc3339()),
                session.enrich,
                session.worker_count.map(to_sql_size),
                session.last_activity_at.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(AppError::SessionNotFound(session.id));
        }
        Ok(())
    }

    fn save_progress(&self, id: i64, processed: u64, errors: u64, at: DateTime<Utc>) -> AppResult<()> {
        let connection = self.connection.lock();
        connection.execute(
            "UPDATE normalization_sessions
            SET processed = MIN(MAX(processed, ?2), total), errors = MAX(errors, ?3),
                last_activity_at = ?4
            WHERE id = ?1",
            params![id, to_sql_count(processed), to_sql_count(errors), at.to_rfc3339()],
        )?;
        Ok(())
    }
}

impl RecordSource for SqliteStore {
    fn total(&self, database_ref: &str) -> AppResult<u64> {
        let connection = self.connection.lock();
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM source_records WHERE database_ref = ?1",
            [database_ref],
            |row| row.get(0),
        )?;
        Ok(from_sql_count(count))
    }

    fn fetch(&self, database_ref: &str, offset: u64, limit: usize) -> AppResult<Vec<SourceRecord>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(
            "SELECT reference, name, tax_id, raw_json FROM source_records
            WHERE database_ref = ?1 ORDER BY position LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![database_ref, limit as i64, to_sql_count(offset)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for (index, row) in rows.enumerate() {
            let (reference, name, tax_id, raw_json) = row?;
            records.push(SourceRecord {
                offset: offset + index as u64,
                reference,
                name,
                tax_id,
                raw: raw_json.as_deref().map(serde_json::from_str).transpose()?,
            });
        }
        Ok(records)
    }
}

impl NormalizedSink for SqliteStore {
    fn upsert_normalized(&self, record: &NormalizedRecord) -> AppResult<()> {
        let enrichment = record
            .enrichment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let connection = self.connection.lock();
        connection.execute(
            "INSERT INTO normalized_records
                (database_ref, position, reference, name, normalized_name, tax_id, enrichment_json, normalized_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(database_ref, position) DO UPDATE SET
                reference = excluded.reference,
                name = excluded.name,
                normalized_name = excluded.normalized_name,
                tax_id = excluded.tax_id,
                enrichment_json = excluded.enrichment_json,
                normalized_at = excluded.normalized_at",
            params![
                record.database_ref,
                to_sql_count(record.offset),
                record.reference,
                record.name,
                record.normalized_name,
                record.tax_id,
                enrichment,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn duplicate_groups(&self, database_ref: &str) -> AppResult<Vec<DuplicateGroup>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(
            "SELECT tax_id, reference FROM normalized_records
            WHERE database_ref = ?1 AND tax_id IS NOT NULL AND tax_id IN (
                SELECT tax_id FROM normalized_records
                WHERE database_ref = ?1 AND tax_id IS NOT NULL
                GROUP BY tax_id HAVING COUNT(*) > 1
            )
            ORDER BY tax_id, position",
        )?;
        let rows = stmt.query_map([database_ref], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for row in rows {
            let (tax_id, reference) = row?;
            match groups.last_mut() {
                Some(group) if group.tax_id == tax_id => group.references.push(reference),
                _ => groups.push(DuplicateGroup {
                    tax_id,
                    references: vec![reference],
                }),
            }
        }
        Ok(groups)
    }
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS normalization_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            database_ref TEXT NOT NULL,
            status TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS source_records (
            database_ref TEXT NOT NULL,
            position INTEGER NOT NULL,
            reference TEXT NOT NULL,
            name TEXT NOT NULL,
            tax_id TEXT,
            raw_json TEXT,
            PRIMARY KEY (database_ref, position)
        );

        CREATE TABLE IF NOT EXISTS normalized_records (
            database_ref TEXT NOT NULL,
            position INTEGER NOT NULL,
            reference TEXT NOT NULL,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            tax_id TEXT,
            enrichment_json TEXT,
            normalized_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            PRIMARY KEY (database_ref, position)
        );
        "#,
    )?;

    ensure_column(
        connection,
        "normalization_sessions",
        "errors INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(
        connection,
        "normalization_sessions",
        "priority INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(connection, "normalization_sessions", "last_error TEXT")?;
    ensure_column(
        connection,
        "normalization_sessions",
        "enrich INTEGER NOT NULL DEFAULT 0",
    )?;
    ensure_column(connection, "normalization_sessions", "worker_count INTEGER")?;
    ensure_column(connection, "normalization_sessions", "last_activity_at TEXT")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_database ON normalization_sessions(database_ref, id)",
        [],
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON normalization_sessions(status, priority)",
        [],
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_normalized_tax_id ON normalized_records(database_ref, tax_id)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    connection.execute(&format!("ALTER TABLE {table} ADD COLUMN {definition}"), [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let mut stmt = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<NormalizationSession> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(8)?;
    let finished_at: Option<String> = row.get(9)?;
    let worker_count: Option<i64> = row.get(11)?;
    let last_activity_at: Option<String> = row.get(12)?;
    let started_at = parse_timestamp(8, &started_at)?;
    Ok(NormalizationSession {
        id: row.get(0)?,
        database_ref: row.get(1)?,
        status: status
            .parse()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?,
        processed: from_sql_count(row.get(3)?),
        total: from_sql_count(row.get(4)?),
        errors: from_sql_count(row.get(5)?),
        priority: row.get(6)?,
        enrich: row.get(10)?,
        worker_count: worker_count.and_then(|count| usize::try_from(count).ok()),
        last_error: row.get(7)?,
        started_at,
        finished_at: finished_at
            .as_deref()
            .map(|value| parse_timestamp(9, value))
            .transpose()?,
        // Rows written before the column existed.
        last_activity_at: last_activity_at
            .as_deref()
            .map(|value| parse_timestamp(12, value))
            .transpose()?
            .unwrap_or(started_at),
    })
}

fn parse_timestamp(column: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err)))
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_sql_size(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// In-process backend for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    sessions: Mutex<BTreeMap<i64, NormalizationSession>>,
    records: RwLock<HashMap<String, Vec<SourceRecord>>>,
    normalized: Mutex<BTreeMap<(String, u64), NormalizedRecord>>,
    unreadable: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn seed(&self, database_ref: &str, records: impl IntoIterator<Item = SourceRecord>) {
        let mut all = self.records.write();
        let rows = all.entry(database_ref.to_string()).or_default();
        for mut record in records {
            record.offset = rows.len() as u64;
            rows.push(record);
        }
    }

    /// Makes every subsequent fetch for `database_ref` fail.
    pub fn set_unreadable(&self, database_ref: &str, unreadable: bool) {
        let mut set = self.unreadable.write();
        if unreadable {
            set.insert(database_ref.to_string());
        } else {
            set.remove(database_ref);
        }
    }

    pub fn normalized_records(&self, database_ref: &str) -> Vec<NormalizedRecord> {
        self.normalized
            .lock()
            .iter()
            .filter(|((db, _), _)| db == database_ref)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

impl SessionStore for MemoryStore {
    fn create(
        &self,
        database_ref: &str,
        total: u64,
        options: &SessionOptions,
    ) -> AppResult<NormalizationSession> {
        let started_at = Utc::now();
        let session = NormalizationSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            database_ref: database_ref.to_string(),
            status: SessionStatus::Created,
            processed: 0,
            total,
            errors: 0,
            priority: options.priority,
            enrich: options.enrich,
            worker_count: options.worker_count,
            last_error: None,
            started_at,
            finished_at: None,
            last_activity_at: started_at,
        };
        self.sessions.lock().insert(session.id, session.clone());
        Ok(session)
    }

    fn load(&self, id: i64) -> AppResult<Option<NormalizationSession>> {
        Ok(self.sessions.lock().get(&id).cloned())
    }

    fn latest_for_database(&self, database_ref: &str) -> AppResult<Option<NormalizationSession>> {
        Ok(self
            .sessions
            .lock()
            .values()
            .rev()
            .find(|session| session.database_ref == database_ref)
            .cloned())
    }

    fn with_status(&self, status: SessionStatus) -> AppResult<Vec<NormalizationSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .lock()
            .values()
            .filter(|session| session.status == status)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| (session.priority, session.id));
        Ok(sessions)
    }

    fn save(&self, session: &NormalizationSession) -> AppResult<()> {
        let mut sessions = self.sessions.lock();
        let stored = sessions
            .get_mut(&session.id)
            .ok_or(AppError::SessionNotFound(session.id))?;
        *stored = session.clone();
        Ok(())
    }

    fn save_progress(&self, id: i64, processed: u64, errors: u64, at: DateTime<Utc>) -> AppResult<()> {
        let mut sessions = self.sessions.lock();
        let stored = sessions.get_mut(&id).ok_or(AppError::SessionNotFound(id))?;
        stored.processed = stored.processed.max(processed).min(stored.total);
        stored.errors = stored.errors.max(errors);
        stored.last_activity_at = at;
        Ok(())
    }
}

impl RecordSource for MemoryStore {
    fn total(&self, database_ref: &str) -> AppResult<u64> {
        Ok(self
            .records
            .read()
            .get(database_ref)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    fn fetch(&self, database_ref: &str, offset: u64, limit: usize) -> AppResult<Vec<SourceRecord>> {
        if self.unreadable.read().contains(database_ref) {
            return Err(AppError::SourceUnavailable(format!(
                "{database_ref} cannot be read"
            )));
        }
        let records = self.records.read();
        let rows = records.get(database_ref).map(Vec::as_slice).unwrap_or(&[]);
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(rows.len());
        let end = start.saturating_add(limit).min(rows.len());
        Ok(rows[start..end].to_vec())
    }
}

impl NormalizedSink for MemoryStore {
    fn upsert_normalized(&self, record: &NormalizedRecord) -> AppResult<()> {
        self.normalized.lock().insert(
            (record.database_ref.clone(), record.offset),
            record.clone(),
        );
        Ok(())
    }

    fn duplicate_groups(&self, database_ref: &str) -> AppResult<Vec<DuplicateGroup>> {
        let mut by_tax_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ((db, _), record) in self.normalized.lock().iter() {
            if db != database_ref {
                continue;
            }
            if let Some(tax_id) = &record.tax_id {
                by_tax_id
                    .entry(tax_id.clone())
                    .or_default()
                    .push(record.reference.clone());
            }
        }
        Ok(by_tax_id
            .into_iter()
            .filter(|(_, references)| references.len() > 1)
            .map(|(tax_id, references)| DuplicateGroup { tax_id, references })
            .collect())
    }
}
