// 🗃️ Persistence Ports - what the engine needs from storage
//
// Two implementations ship with the crate:
//   MemoryStore  (this file)  - tests and ephemeral runs
//   SqliteStore  (db.rs)      - embedded, durable
//
// Record writes go through a unit of work (`begin` → stage → `commit`/`rollback`)
// so the importer can persist whole chunks atomically.

use crate::db::{Event, TollRecord};
use crate::error::{EngineError, Result};
use crate::jobs::Job;
use crate::reconciliation::{Mapping, MappingStatus};
use crate::session::ImportSession;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

// ============================================================================
// PORTS
// ============================================================================

#[async_trait]
pub trait TollRecordStore: Send + Sync {
    /// Open a unit of work. Nothing is visible until `commit`.
    async fn begin(&self) -> Result<Box<dyn RecordBatch>>;

    /// Insert `records` in a single transaction.
    async fn insert_batch(&self, records: Vec<TollRecord>) -> Result<usize> {
        let mut batch = self.begin().await?;
        for record in records {
            batch.insert(record);
        }
        batch.commit().await
    }

    async fn find_by_identity_hash(&self, hash: &str) -> Result<Option<TollRecord>>;

    /// Stored records whose identity hash is in `hashes`, skipping any record id
    /// in `exclude_ids`.
    async fn find_duplicates(
        &self,
        hashes: &[String],
        exclude_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<TollRecord>>;

    async fn get_record(&self, id: &str) -> Result<Option<TollRecord>>;

    /// Records with `from <= usage_date <= to`, oldest first.
    async fn find_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<TollRecord>>;

    async fn count_records(&self) -> Result<usize>;

    async fn append_event(&self, event: Event) -> Result<()>;

    async fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>>;

    async fn ping(&self) -> Result<()>;
}

/// Staged writes against a [`TollRecordStore`].
#[async_trait]
pub trait RecordBatch: Send {
    fn insert(&mut self, record: TollRecord);

    /// Replace a stored record by id. The identity hash must not change.
    fn update(&mut self, record: TollRecord);

    fn record_event(&mut self, event: Event);

    /// Number of staged record writes (events excluded).
    fn staged(&self) -> usize;

    /// Apply every staged write atomically; returns the number of record writes.
    async fn commit(self: Box<Self>) -> Result<usize>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, session: &ImportSession) -> Result<()>;
    async fn load_session(&self, id: &str) -> Result<Option<ImportSession>>;
    async fn list_sessions(&self) -> Result<Vec<ImportSession>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_job(&self, id: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    async fn delete_job(&self, id: &str) -> Result<bool>;
}

/// Mapping persistence. Implementations enforce "one active mapping per toll
/// record" on both insert and update.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()>;
    async fn update_mapping(&self, mapping: &Mapping) -> Result<()>;
    async fn get_mapping(&self, id: &str) -> Result<Option<Mapping>>;
    async fn mappings_for_record(&self, toll_record_id: &str) -> Result<Vec<Mapping>>;
    async fn active_mapping(&self, toll_record_id: &str) -> Result<Option<Mapping>>;
    async fn mappings_by_status(&self, status: MappingStatus) -> Result<Vec<Mapping>>;
}

/// A single staged write, shared by both store implementations.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    Insert(TollRecord),
    Update(TollRecord),
    Event(Event),
}

pub(crate) fn poisoned<T>(_: T) -> EngineError {
    EngineError::fatal("store lock poisoned")
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct RecordTable {
    by_id: HashMap<String, TollRecord>,
    by_identity: HashMap<String, String>,
    order: Vec<String>,
}

impl RecordTable {
    /// Validate every staged write first, then apply them all.
    fn apply(&mut self, writes: &[StagedWrite]) -> Result<usize> {
        let mut pending_identities: HashMap<&str, &str> = HashMap::new();
        let mut pending_ids: HashSet<&str> = HashSet::new();

        for write in writes {
            match write {
                StagedWrite::Insert(record) => {
                    if let Some(existing) = self
                        .by_identity
                        .get(&record.identity_hash)
                        .map(String::as_str)
                        .or_else(|| pending_identities.get(record.identity_hash.as_str()).copied())
                    {
                        return Err(EngineError::conflict(
                            "toll_record",
                            existing,
                            format!("identity hash {} already stored", record.identity_hash),
                        ));
                    }
                    pending_identities.insert(&record.identity_hash, &record.id);
                    pending_ids.insert(&record.id);
                }
                StagedWrite::Update(record) => {
                    let known = self.by_id.get(&record.id);
                    match known {
                        Some(stored) if stored.identity_hash != record.identity_hash => {
                            return Err(EngineError::fatal(format!(
                                "update of {} would change its identity hash",
                                record.id
                            )));
                        }
                        Some(_) => {}
                        None if pending_ids.contains(record.id.as_str()) => {}
                        None => return Err(EngineError::not_found("toll_record", &record.id)),
                    }
                }
                StagedWrite::Event(_) => {}
            }
        }

        let mut written = 0;
        for write in writes {
            match write {
                StagedWrite::Insert(record) => {
                    self.by_identity
                        .insert(record.identity_hash.clone(), record.id.clone());
                    self.order.push(record.id.clone());
                    self.by_id.insert(record.id.clone(), record.clone());
                    written += 1;
                }
                StagedWrite::Update(record) => {
                    self.by_id.insert(record.id.clone(), record.clone());
                    written += 1;
                }
                StagedWrite::Event(_) => {}
            }
        }
        Ok(written)
    }
}

#[derive(Default)]
struct MappingTable {
    by_id: HashMap<String, Mapping>,
    order: Vec<String>,
}

impl MappingTable {
    fn conflicting_active(&self, mapping: &Mapping) -> Option<&Mapping> {
        if mapping.status != MappingStatus::Active {
            return None;
        }
        self.by_id.values().find(|m| {
            m.id != mapping.id
                && m.toll_record_id == mapping.toll_record_id
                && m.status == MappingStatus::Active
        })
    }
}

/// In-process implementation of every persistence port.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<RecordTable>>,
    events: Arc<RwLock<Vec<Event>>>,
    sessions: Arc<RwLock<HashMap<String, ImportSession>>>,
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    mappings: Arc<RwLock<MappingTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply_batch(&self, writes: Vec<StagedWrite>) -> Result<usize> {
        let mut records = self.records.write().map_err(poisoned)?;
        let written = records.apply(&writes)?;
        drop(records);

        let mut events = self.events.write().map_err(poisoned)?;
        for write in writes {
            if let StagedWrite::Event(event) = write {
                events.push(event);
            }
        }
        Ok(written)
    }
}

pub struct MemoryBatch {
    store: MemoryStore,
    writes: Vec<StagedWrite>,
}

#[async_trait]
impl RecordBatch for MemoryBatch {
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
        let MemoryBatch { store, writes } = *self;
        store.apply_batch(writes)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TollRecordStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn RecordBatch>> {
        Ok(Box::new(MemoryBatch {
            store: self.clone(),
            writes: Vec::new(),
        }))
    }

    async fn find_by_identity_hash(&self, hash: &str) -> Result<Option<TollRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .by_identity
            .get(hash)
            .and_then(|id| records.by_id.get(id))
            .cloned())
    }

    async fn find_duplicates(
        &self,
        hashes: &[String],
        exclude_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<TollRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut seen = HashSet::new();
        Ok(hashes
            .iter()
            .filter(|hash| seen.insert(hash.as_str()))
            .filter_map(|hash| records.by_identity.get(hash))
            .filter(|id| exclude_ids.map_or(true, |excluded| !excluded.contains(*id)))
            .filter_map(|id| records.by_id.get(id))
            .cloned()
            .collect())
    }

    async fn get_record(&self, id: &str) -> Result<Option<TollRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.by_id.get(id).cloned())
    }

    async fn find_in_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<TollRecord>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut found: Vec<TollRecord> = records
            .order
            .iter()
            .filter_map(|id| records.by_id.get(id))
            .filter(|r| r.usage_date >= from && r.usage_date <= to)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (a.usage_date, &a.usage_time).cmp(&(b.usage_date, &b.usage_time))
        });
        Ok(found)
    }

    async fn count_records(&self) -> Result<usize> {
        Ok(self.records.read().map_err(poisoned)?.by_id.len())
    }

    async fn append_event(&self, event: Event) -> Result<()> {
        self.events.write().map_err(poisoned)?.push(event);
        Ok(())
    }

    async fn events_for(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let events = self.events.read().map_err(poisoned)?;
        Ok(events
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        drop(self.records.read().map_err(poisoned)?);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, session: &ImportSession) -> Result<()> {
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, id: &str) -> Result<Option<ImportSession>> {
        Ok(self.sessions.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<ImportSession>> {
        let mut sessions: Vec<ImportSession> =
            self.sessions.read().map_err(poisoned)?.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .write()
            .map_err(poisoned)?
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().map_err(poisoned)?.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.write().map_err(poisoned)?.remove(id).is_some())
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn insert_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mut table = self.mappings.write().map_err(poisoned)?;
        if table.by_id.contains_key(&mapping.id) {
            return Err(EngineError::conflict("mapping", &mapping.id, "mapping id already exists"));
        }
        if let Some(active) = table.conflicting_active(mapping) {
            return Err(EngineError::conflict(
                "mapping",
                &active.id,
                format!("toll record {} already has an active mapping", mapping.toll_record_id),
            ));
        }
        table.order.push(mapping.id.clone());
        table.by_id.insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn update_mapping(&self, mapping: &Mapping) -> Result<()> {
        let mut table = self.mappings.write().map_err(poisoned)?;
        if !table.by_id.contains_key(&mapping.id) {
            return Err(EngineError::not_found("mapping", &mapping.id));
        }
        if let Some(active) = table.conflicting_active(mapping) {
            return Err(EngineError::conflict(
                "mapping",
                &active.id,
                format!("toll record {} already has an active mapping", mapping.toll_record_id),
            ));
        }
        table.by_id.insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn get_mapping(&self, id: &str) -> Result<Option<Mapping>> {
        Ok(self.mappings.read().map_err(poisoned)?.by_id.get(id).cloned())
    }

    async fn mappings_for_record(&self, toll_record_id: &str) -> Result<Vec<Mapping>> {
        let table = self.mappings.read().map_err(poisoned)?;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .filter(|m| m.toll_record_id == toll_record_id)
            .cloned()
            .collect())
    }

    async fn active_mapping(&self, toll_record_id: &str) -> Result<Option<Mapping>> {
        let table = self.mappings.read().map_err(poisoned)?;
        Ok(table
            .by_id
            .values()
            .find(|m| m.toll_record_id == toll_record_id && m.status == MappingStatus::Active)
            .cloned())
    }

    async fn mappings_by_status(&self, status: MappingStatus) -> Result<Vec<Mapping>> {
        let table = self.mappings.read().map_err(poisoned)?;
        Ok(table
            .order
            .iter()
            .filter_map(|id| table.by_id.get(id))
            .filter(|m| m.status == status)
            .cloned()
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
