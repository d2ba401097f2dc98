// 💾 Database Layer - toll record model, audit events, SQLite stores
//
// SQLite runs in WAL mode. rusqlite is blocking, so every call hops onto the
// blocking pool through `SqliteStore::with_conn`.

use crate::error::{EngineError, Result};
use crate::hashing::{compare_fields, content_hash, identity_hash};
use crate::jobs::Job;
use crate::reconciliation::{Mapping, MappingStatus, MatchType};
use crate::session::ImportSession;
use crate::store::{
    poisoned, JobStore, MappingStore, RecordBatch, SessionStore, StagedWrite, TollRecordStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// SQLite's default host-parameter limit is 999; stay well below it.
const IN_CLAUSE_CHUNK: usize = 500;

// ============================================================================
// TOLL RECORD
// ============================================================================

/// One toll-gate passage as billed on an ETC statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollRecord {
    // ========================================================================
    // IDENTITY FIELDS (immutable once stored)
    // ========================================================================
    pub usage_date: NaiveDate,
    pub usage_time: String,
    pub entry_ic: String,
    pub exit_ic: String,
    pub vehicle_number: String,
    pub card_number: String,

    // ========================================================================
    // CORRECTABLE FIELDS
    // ========================================================================
    /// Yen, before discount
    pub toll_amount: i64,
    pub discount_amount: i64,
    pub usage_type: String,

    // ========================================================================
    // PROVENANCE
    // ========================================================================
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub line_number: usize,

    // ========================================================================
    // IDENTITY & VERSIONING
    // ========================================================================
    /// Stable id, assigned at import time
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub identity_hash: String,
    #[serde(default)]
    pub content_hash: String,
    /// Starts at 1, bumped on every applied correction
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TollRecord {
    pub fn new(
        usage_date: NaiveDate,
        usage_time: &str,
        entry_ic: &str,
        exit_ic: &str,
        vehicle_number: &str,
    ) -> Self {
        TollRecord {
            usage_date,
            usage_time: usage_time.to_string(),
            entry_ic: entry_ic.to_string(),
            exit_ic: exit_ic.to_string(),
            vehicle_number: vehicle_number.to_string(),
            card_number: String::new(),
            toll_amount: 0,
            discount_amount: 0,
            usage_type: String::new(),
            account_id: String::new(),
            source_file: String::new(),
            line_number: 0,
            id: String::new(),
            identity_hash: String::new(),
            content_hash: String::new(),
            version: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_card(mut self, card_number: &str) -> Self {
        self.card_number = card_number.to_string();
        self
    }

    pub fn with_amounts(mut self, toll_amount: i64, discount_amount: i64) -> Self {
        self.toll_amount = toll_amount;
        self.discount_amount = discount_amount;
        self
    }

    pub fn with_usage_type(mut self, usage_type: &str) -> Self {
        self.usage_type = usage_type.to_string();
        self
    }

    pub fn with_provenance(mut self, account_id: &str, source_file: &str, line_number: usize) -> Self {
        self.account_id = account_id.to_string();
        self.source_file = source_file.to_string();
        self.line_number = line_number;
        self
    }

    /// Amount actually charged.
    pub fn net_amount(&self) -> i64 {
        self.toll_amount - self.discount_amount
    }

    pub fn refresh_hashes(&mut self) {
        self.identity_hash = identity_hash(self);
        self.content_hash = content_hash(self);
    }

    /// Prepare a freshly parsed record for its first insert.
    pub fn init_identity(&mut self, id: &str, now: DateTime<Utc>) {
        if self.id.is_empty() {
            self.id = id.to_string();
        }
        if self.version == 0 {
            self.version = 1;
        }
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        self.updated_at = Some(now);
        self.refresh_hashes();
    }

    /// Take the correctable fields of `incoming` and return what changed.
    ///
    /// Identity fields and `identity_hash` are left untouched; the version is
    /// bumped and `content_hash` recomputed only when something changed.
    pub fn apply_correction(&mut self, incoming: &TollRecord, now: DateTime<Utc>) -> Vec<&'static str> {
        let changed = compare_fields(self, incoming);
        if changed.is_empty() {
            return changed;
        }

        self.toll_amount = incoming.toll_amount;
        self.discount_amount = incoming.discount_amount;
        self.usage_type = incoming.usage_type.clone();
        self.version += 1;
        self.updated_at = Some(now);
        self.content_hash = content_hash(self);
        changed
    }
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Audit trail entry: every correction, review flag and mapping change is an event.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Pin the timestamp to an injected clock.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases report "memory")
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS toll_records (
            id TEXT PRIMARY KEY,
            identity_hash TEXT UNIQUE NOT NULL,
            content_hash TEXT NOT NULL,
            usage_date TEXT NOT NULL,
            usage_time TEXT NOT NULL,
            entry_ic TEXT NOT NULL,
            exit_ic TEXT NOT NULL,
            vehicle_number TEXT NOT NULL,
            card_number TEXT NOT NULL,
            toll_amount INTEGER NOT NULL,
            discount_amount INTEGER NOT NULL,
            usage_type TEXT NOT NULL,
            account_id TEXT NOT NULL,
            source_file TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    // Sessions and jobs are stored as JSON snapshots
    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_sessions (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            data TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            data TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mappings (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            toll_record_id TEXT NOT NULL,
            entity_ref TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            match_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_toll_usage_date ON toll_records(usage_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mappings_record ON mappings(toll_record_id)",
        [],
    )?;

    // At most one active mapping per toll record
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_one_active
         ON mappings(toll_record_id) WHERE status = 'active'",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for one entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(row.get(1)?, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| conversion(5, e))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// ROW HELPERS
// ============================================================================

const RECORD_COLUMNS: &str = "id, identity_hash, content_hash, usage_date, usage_time, entry_ic,
    exit_ic, vehicle_number, card_number, toll_amount, discount_amount, usage_type,
    account_id, source_file, line_number, version, created_at, updated_at";

const MAPPING_COLUMNS: &str = "id, toll_record_id, entity_ref, entity_type, match_type,
    confidence, status, created_at, updated_at";

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn parse_optional_timestamp(raw: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(s, idx)).transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TollRecord> {
    let usage_date: String = row.get(3)?;
    let line_number: i64 = row.get(14)?;

    Ok(TollRecord {
        id: row.get(0)?,
        identity_hash: row.get(1)?,
        content_hash: row.get(2)?,
        usage_date: NaiveDate::parse_from_str(&usage_date, "%Y-%m-%d")
            .map_err(|e| conversion(3, e))?,
        usage_time: row.get(4)?,
        entry_ic: row.get(5)?,
        exit_ic: row.get(6)?,
        vehicle_number: row.get(7)?,
        card_number: row.get(8)?,
        toll_amount: row.get(9)?,
        discount_amount: row.get(10)?,
        usage_type: row.get(11)?,
        account_id: row.get(12)?,
        source_file: row.get(13)?,
        line_number: line_number.max(0) as usize,
        version: row.get(15)?,
        created_at: parse_optional_timestamp(row.get(16)?, 16)?,
        updated_at: parse_optional_timestamp(row.get(17)?, 17)?,
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<Mapping> {
    let match_type: String = row.get(4)?;
    let status: String = row.get(6)?;

    Ok(Mapping {
        id: row.get(0)?,
        toll_record_id: row.get(1)?,
        entity_ref: row.get(2)?,
        entity_type: row.get(3)?,
        match_type: MatchType::from_str(&match_type).map_err(|e| conversion(4, e))?,
        confidence: row.get(5)?,
        status: MappingStatus::from_str(&status).map_err(|e| conversion(6, e))?,
        created_at: parse_timestamp(row.get(7)?, 7)?,
        updated_at: parse_timestamp(row.get(8)?, 8)?,
    })
}

fn insert_record(conn: &Connection, record: &TollRecord) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM toll_records WHERE identity_hash = ?1",
            params![record.identity_hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = existing {
        return Err(EngineError::conflict(
            "toll_record",
            existing,
            format!("identity hash {} already stored", record.identity_hash),
        ));
    }

    conn.execute(
        &format!(
            "INSERT INTO toll_records ({}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            RECORD_COLUMNS
        ),
        params![
            record.id,
            record.identity_hash,
            record.content_hash,
            record.usage_date.format("%Y-%m-%d").to_string(),
            record.usage_time,
            record.entry_ic,
            record.exit_ic,
            record.vehicle_number,
            record.card_number,
            record.toll_amount,
            record.discount_amount,
            record.usage_type,
            record.account_id,
            record.source_file,
            record.line_number as i64,
            record.version,
            record.created_at.map(|dt| dt.to_rfc3339()),
            record.updated_at.map(|dt| dt.to_rfc3339()),
        ],
    )
    .map_err(|e| clash(e, "toll_record", &record.id))?;
    Ok(())
}

/// Constraint failures on an insert clash with the stored row carrying `id`.
fn clash(err: rusqlite::Error, entity: &str, id: &str) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(code, detail)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            EngineError::conflict(
                entity,
                id,
                detail.unwrap_or_else(|| format!("{} {} already stored", entity, id)),
            )
        }
        other => other.into(),
    }
}

fn update_record(conn: &Connection, record: &TollRecord) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT identity_hash FROM toll_records WHERE id = ?1",
            params![record.id],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => return Err(EngineError::not_found("toll_record", &record.id)),
        Some(hash) if hash != record.identity_hash => {
            return Err(EngineError::fatal(format!(
                "update of {} would change its identity hash",
                record.id
            )));
        }
        Some(_) => {}
    }

    conn.execute(
        "UPDATE toll_records SET
            content_hash = ?2, toll_amount = ?3, discount_amount = ?4, usage_type = ?5,
            version = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            record.id,
            record.content_hash,
            record.toll_amount,
            record.discount_amount,
            record.usage_type,
            record.version,
            record.updated_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn active_mapping_conflict(conn: &Connection, mapping: &Mapping) -> Result<()> {
    if mapping.status != MappingStatus::Active {
        return Ok(());
    }
    let active: Option<String> = conn
        .query_row(
            "SELECT id FROM mappings WHERE toll_record_id = ?1 AND status = 'active' AND id != ?2",
            params![mapping.toll_record_id, mapping.id],
            |row| row.get(0),
        )
        .optional()?;
    match active {
        Some(active) => Err(EngineError::conflict(
            "mapping",
            active,
            format!("toll record {} already has an active mapping", mapping.toll_record_id),
        )),
        None => Ok(()),
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Every persistence port over one SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(poisoned)?;
            work(&mut guard)
        })
        .await
        .map_err(|e| EngineError::fatal(format!("{} worker failed: {}", operation, e)))?
    }
}

pub struct SqliteBatch {
    store: SqliteStore,
    writes: Vec<StagedWrite>,
}

#[async_trait]
impl RecordBatch for SqliteBatch {
    fn insert(&mut self, record: TollRecord) {
        self.writes.push(StagedWrite::Insert(record));
    }

    fn update(&mut self, record: TollRecord) {
        self.writes.push(StagedWrite::Update(record));
    }

    fn record_event(&mut self, event: Event) {
        self.writes.push(StagedWrite::Event(event));
    }

    fn staged(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| !matches!(w, StagedWrite::Event(_)))
            .count()
    }

    async fn commit(self: Box<Self>) -> Result<usize> {
        let SqliteBatch { store, writes } = *self;
        store
            .with_conn("commit_batch", move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                for write in &writes {
                    match write {
                        StagedWrite::Insert(record) => {
                            insert_record(&tx, record)?;
                            written += 1;
                        }
                        StagedWrite::Update(record) => {
                            update_record(&tx, record)?;
                            written += 1;
                        }
                        StagedWrite::Event(event) => insert_event(&tx, event)?,
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Nothing reached the database before commit.
        Ok(())
    }
}

#[async_trait]
impl TollRecordStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn RecordBatch>> {
        Ok(Box::new(SqliteBatch {
            store: self.clone(),
            writes: Vec::new(),
        }))
    }

    async fn find_by_identity_hash(&self, hash: &str) -> Result<Option<TollRecord>> {
        let hash = hash.to_string();
        self.with_conn("find_by_identity_hash", move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {} FROM toll_records WHERE identity_hash = ?1", RECORD_COLUMNS),
                    params![hash],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn find_duplicates(
        &self,
        hashes: &[String],
        exclude_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<TollRecord>> {
        let mut unique: Vec<String> = Vec::with_capacity(hashes.len());
        let mut seen = HashSet::new();
        for hash in hashes {
            if seen.insert(hash.as_str()) {
                unique.push(hash.clone());
            }
        }
        let excluded = exclude_ids.cloned().unwrap_or_default();

        self.with_conn("find_duplicates", move |conn| {
            let mut found = Vec::new();
            for chunk in unique.chunks(IN_CLAUSE_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM toll_records WHERE identity_hash IN ({})",
                    RECORD_COLUMNS, placeholders
                ))?;
                let rows = stmt
                    .query_map(params_from_iter(chunk.iter()), record_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                found.extend(rows.into_iter().filter(|r| !excluded.contains(&r.id)));
            }
            Ok(found)
        })
        .await
    }

    async fn get_record(&self, id: &str) -> Result<Option<TollRecord>> {
        let id = id.to_string();
        self.with_conn("get_record", move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {} FROM toll_records WHERE id = ?1", RECORD_COLUMNS),
                    params![id],
                    record_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn find_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<TollRecord>> {
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();
        self.with_conn("find_in_range", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM toll_records
                 WHERE usage_date >= ?1 AND usage_date <= ?2
                 ORDER BY usage_date ASC, usage_time ASC",
                RECORD_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![from, to], record_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn count_records(&self) -> Result<usize> {
        self.with_conn("count_records", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM toll_records", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    async fn append_event(&self, event: Event) -> Result<()> {
        self.with_conn("append_event", move |conn| insert_event(conn, &event))
            .await
    }

    async fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        self.with_conn("events_for", move |conn| {
            get_events_for_entity(conn, &entity_type, &entity_id)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn save_session(&self, session: &ImportSession) -> Result<()> {
        let data = serde_json::to_string(session)?;
        let id = session.id.clone();
        let status = session.status.as_str();
        let created_at = session.created_at.to_rfc3339();
        self.with_conn("save_session", move |conn| {
            conn.execute(
                "INSERT INTO import_sessions (id, status, created_at, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
                params![id, status, created_at, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_session(&self, id: &str) -> Result<Option<ImportSession>> {
        let id = id.to_string();
        self.with_conn("load_session", move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM import_sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            match data {
                Some(data) => Ok(Some(serde_json::from_str(&data)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<ImportSession>> {
        self.with_conn("list_sessions", |conn| {
            let mut stmt =
                conn.prepare("SELECT data FROM import_sessions ORDER BY created_at ASC, id ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|data| serde_json::from_str(data).map_err(EngineError::from))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let data = serde_json::to_string(job)?;
        let id = job.id.clone();
        let status = job.status.as_str();
        let created_at = job.created_at.to_rfc3339();
        self.with_conn("save_job", move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, status, created_at, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
                params![id, status, created_at, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let id = id.to_string();
        self.with_conn("load_job", move |conn| {
            let data: Option<String> = conn
                .query_row("SELECT data FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            match data {
                Some(data) => Ok(Some(serde_json::from_str(&data)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.with_conn("list_jobs", |conn| {
            let mut stmt = conn.prepare("SELECT data FROM jobs ORDER BY created_at ASC, id ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|data| serde_json::from_str(data).map_err(EngineError::from))
                .collect()
        })
        .await
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn("delete_job", move |conn| {
            let deleted = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mapping = mapping.clone();
        self.with_conn("insert_mapping", move |conn| {
            let tx = conn.transaction()?;
            active_mapping_conflict(&tx, &mapping)?;
            tx.execute(
                &format!(
                    "INSERT INTO mappings ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    MAPPING_COLUMNS
                ),
                params![
                    mapping.id,
                    mapping.toll_record_id,
                    mapping.entity_ref,
                    mapping.entity_type,
                    mapping.match_type.as_str(),
                    mapping.confidence,
                    mapping.status.as_str(),
                    mapping.created_at.to_rfc3339(),
                    mapping.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| clash(e, "mapping", &mapping.id))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mapping = mapping.clone();
        self.with_conn("update_mapping", move |conn| {
            let tx = conn.transaction()?;
            active_mapping_conflict(&tx, &mapping)?;
            let updated = tx.execute(
                "UPDATE mappings SET status = ?2, confidence = ?3, match_type = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    mapping.id,
                    mapping.status.as_str(),
                    mapping.confidence,
                    mapping.match_type.as_str(),
                    mapping.updated_at.to_rfc3339(),
                ],
            )?;
            if updated == 0 {
                return Err(EngineError::not_found("mapping", &mapping.id));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_mapping(&self, id: &str) -> Result<Option<Mapping>> {
        let id = id.to_string();
        self.with_conn("get_mapping", move |conn| {
            let mapping = conn
                .query_row(
                    &format!("SELECT {} FROM mappings WHERE id = ?1", MAPPING_COLUMNS),
                    params![id],
                    mapping_from_row,
                )
                .optional()?;
            Ok(mapping)
        })
        .await
    }

    async fn mappings_for_record(&self, toll_record_id: &str) -> Result<Vec<Mapping>> {
        let toll_record_id = toll_record_id.to_string();
        self.with_conn("mappings_for_record", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mappings WHERE toll_record_id = ?1 ORDER BY seq ASC",
                MAPPING_COLUMNS
            ))?;
            let mappings = stmt
                .query_map(params![toll_record_id], mapping_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }

    async fn active_mapping(&self, toll_record_id: &str) -> Result<Option<Mapping>> {
        let toll_record_id = toll_record_id.to_string();
        self.with_conn("active_mapping", move |conn| {
            let mapping = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM mappings WHERE toll_record_id = ?1 AND status = 'active'",
                        MAPPING_COLUMNS
                    ),
                    params![toll_record_id],
                    mapping_from_row,
                )
                .optional()?;
            Ok(mapping)
        })
        .await
    }

    async fn mappings_by_status(&self, status: MappingStatus) -> Result<Vec<Mapping>> {
        self.with_conn("mappings_by_status", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM mappings WHERE status = ?1 ORDER BY seq ASC",
                MAPPING_COLUMNS
            ))?;
            let mappings = stmt
                .query_map(params![status.as_str()], mapping_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }
}

// ============================================================================
// TESTS
// ============================================================================
