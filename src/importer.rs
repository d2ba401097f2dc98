// 📥 Batch Importer - parse result → validate → hash → dedup → persist → session
//
// Rows are classified in source order and written in transactional chunks.
// A chunk's row outcomes are staged and only reach the session counters after
// the chunk commits; a rolled-back chunk contributes its error rows only.

use crate::clock::{Clock, IdGenerator};
use crate::config::{ImportConfig, UpdatePolicy};
use crate::db::{Event, TollRecord};
use crate::error::{with_deadline, EngineError, Result};
use crate::hashing::{compare_fields, identity_hash};
use crate::parser::{ParseOutcome, RowError, TollParser};
use crate::session::{
    ImportIssue, ImportSession, ImportStatus, IssueKind, SessionCounters, SessionHandle,
    SessionSource, SessionTracker,
};
use crate::store::{RecordBatch, TollRecordStore};
use crate::validation::RecordValidator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACTOR: &str = "batch_importer";

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// Candidate rows for one session: parsed records plus the rows the parser
/// could not read.
#[derive(Debug, Clone, Default)]
pub struct ImportBatch {
    pub records: Vec<TollRecord>,
    pub parse_errors: Vec<RowError>,
}

impl ImportBatch {
    pub fn from_records(records: Vec<TollRecord>) -> Self {
        ImportBatch {
            records,
            parse_errors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.parse_errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<ParseOutcome> for ImportBatch {
    fn from(outcome: ParseOutcome) -> Self {
        ImportBatch {
            records: outcome.records,
            parse_errors: outcome.errors,
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Cooperative controls handed in by the caller (usually a job).
#[derive(Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub on_progress: Option<ProgressFn>,
}

impl RunControl {
    pub fn new(cancel: CancellationToken) -> Self {
        RunControl {
            cancel,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    fn report(&self, percent: u8) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(percent.min(100));
        }
    }
}

/// A known record that arrived with different content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub toll_record_id: String,
    pub identity_hash: String,
    pub line_number: Option<usize>,
    pub changed_fields: Vec<String>,
    /// true when the correction was written (`auto_apply`)
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub session_id: String,
    pub status: ImportStatus,
    pub counters: SessionCounters,
    pub created: usize,
    pub updated: usize,
    pub review_items: Vec<ReviewItem>,
    /// First N issues of the session's error log
    pub error_sample: Vec<ImportIssue>,
    pub fatal: Option<EngineError>,
}

impl ImportResult {
    pub fn is_success(&self) -> bool {
        self.status == ImportStatus::Completed
    }

    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "{} [{}]: {} created, {} updated, {} duplicate, {} error ({} of {} rows)",
            self.session_id,
            self.status,
            self.created,
            self.updated,
            c.duplicate,
            c.error,
            c.processed,
            c.total
        )
    }
}

// ============================================================================
// STAGED ROWS
// ============================================================================

#[derive(Clone)]
enum Candidate {
    Row(TollRecord),
    Unparsed(RowError),
}

impl Candidate {
    fn line(&self) -> usize {
        match self {
            Candidate::Row(record) => record.line_number,
            Candidate::Unparsed(err) => err.line_number,
        }
    }
}

enum RowOutcome {
    Created,
    Updated(ReviewItem),
    Duplicate,
    Error {
        kind: IssueKind,
        message: String,
        raw: Option<String>,
    },
}

struct StagedRow {
    line: Option<usize>,
    outcome: RowOutcome,
    warnings: Vec<String>,
}

impl StagedRow {
    fn error(line: Option<usize>, kind: IssueKind, message: String, raw: Option<String>) -> Self {
        StagedRow {
            line,
            outcome: RowOutcome::Error { kind, message, raw },
            warnings: Vec::new(),
        }
    }

    fn is_error(&self) -> bool {
        matches!(self.outcome, RowOutcome::Error { .. })
    }
}

/// Why a run stopped before the last row.
enum Stop {
    Cancelled,
    /// Session went terminal underneath us (external cancel)
    External,
    Failed(EngineError),
}

/// How one attempt at writing a chunk ended.
enum Settled {
    Committed,
    /// Another session committed one of the chunk's identities first
    Raced(EngineError),
    Stopped(Stop),
}

fn lost_identity_race(err: &EngineError) -> bool {
    matches!(err, EngineError::Conflict { entity, .. } if entity == "toll_record")
}

struct RunState<'a> {
    options: &'a ImportConfig,
    validator: RecordValidator,
    account_id: String,
    /// identity hash → latest known version (stored or staged earlier in this run)
    known: HashMap<String, TollRecord>,
    errors_seen: usize,
    created: usize,
    updated: usize,
    review_items: Vec<ReviewItem>,
}

impl RunState<'_> {
    fn error_limit_reached(&self) -> bool {
        self.options.max_errors > 0 && self.errors_seen >= self.options.max_errors
    }
}

fn raw_of(record: &TollRecord) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        record.usage_date,
        record.usage_time,
        record.entry_ic,
        record.exit_ic,
        record.vehicle_number,
        record.card_number,
        record.toll_amount,
        record.discount_amount,
        record.usage_type
    )
}

// ============================================================================
// BATCH IMPORTER
// ============================================================================

pub struct BatchImporter {
    records: Arc<dyn TollRecordStore>,
    sessions: Arc<SessionTracker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: ImportConfig,
    storage_timeout: Duration,
}

impl BatchImporter {
    pub fn new(
        records: Arc<dyn TollRecordStore>,
        sessions: Arc<SessionTracker>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: ImportConfig,
        storage_timeout: Duration,
    ) -> Self {
        BatchImporter {
            records,
            sessions,
            clock,
            ids,
            config,
            storage_timeout,
        }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Open a session once the record store answers a ping.
    pub async fn start_session(&self, source: SessionSource) -> Result<ImportSession> {
        with_deadline("ping", self.storage_timeout, self.records.ping()).await?;
        self.sessions.create(source).await
    }

    /// Create a session and run `batch` through it with the default options.
    pub async fn import(
        &self,
        source: SessionSource,
        batch: ImportBatch,
        control: RunControl,
    ) -> Result<ImportResult> {
        let session = self.start_session(source).await?;
        let options = self.config.clone();
        self.run(&session.id, batch, &options, control).await
    }

    /// Parse `bytes` and import the result. An unreadable file still produces a
    /// session, which ends `failed` with the parse error in its log.
    pub async fn import_bytes(
        &self,
        source: SessionSource,
        bytes: &[u8],
        parser: &dyn TollParser,
        control: RunControl,
    ) -> Result<ImportResult> {
        let file_name = source
            .file_name
            .clone()
            .unwrap_or_else(|| "upload".to_string());
        let session = self.start_session(source).await?;

        match parser.parse(bytes, &file_name) {
            Ok(outcome) => {
                debug!(
                    session_id = %session.id,
                    parser = parser.name(),
                    records = outcome.records.len(),
                    errors = outcome.errors.len(),
                    "Parsed upload"
                );
                let options = self.config.clone();
                self.run(&session.id, outcome.into(), &options, control).await
            }
            Err(err) => {
                warn!(session_id = %session.id, file = %file_name, "Upload could not be parsed: {}", err);
                let handle = self.sessions.handle(&session.id).await?;
                {
                    let mut live = handle.write().await;
                    live.transition(ImportStatus::Processing, self.clock.now())?;
                    live.add_error(None, IssueKind::Parse, &err.to_string(), None)?;
                    live.transition(ImportStatus::Failed, self.clock.now())?;
                    self.sessions.persist(&live).await?;
                }
                self.sessions.release(&session.id).await;
                let session = self.sessions.get(&session.id).await?;
                Ok(self.result_of(&session, 0, 0, Vec::new(), Some(err)))
            }
        }
    }

    /// Drive a pending session through `batch`.
    ///
    /// Returns `Err` only when the session cannot be started (unknown, not
    /// pending, store unreachable). Everything after that is reported in the
    /// result, including fatal failures.
    pub async fn run(
        &self,
        session_id: &str,
        batch: ImportBatch,
        options: &ImportConfig,
        control: RunControl,
    ) -> Result<ImportResult> {
        let handle = self.sessions.handle(session_id).await?;
        let account_id = {
            let mut session = handle.write().await;
            session.transition(ImportStatus::Processing, self.clock.now())?;
            session.set_total(batch.len())?;
            self.sessions.persist(&session).await?;
            session.source.account_id.clone()
        };
        info!(session_id, total = batch.len(), "Import started");

        let mut state = RunState {
            options,
            validator: RecordValidator::new(self.clock.now().date_naive()),
            account_id,
            known: HashMap::new(),
            errors_seen: 0,
            created: 0,
            updated: 0,
            review_items: Vec::new(),
        };

        let stop = self.process(&handle, batch, &mut state, &control).await;

        let (final_status, fatal) = match stop {
            None => (ImportStatus::Completed, None),
            Some(Stop::Cancelled) => (ImportStatus::Cancelled, None),
            Some(Stop::External) => (ImportStatus::Cancelled, None),
            Some(Stop::Failed(err)) => (ImportStatus::Failed, Some(err)),
        };
        let (session, fatal) = self.finish(&handle, final_status, fatal).await;
        self.sessions.release(session_id).await;

        if session.status == ImportStatus::Completed {
            control.report(100);
        }
        let result = self.result_of(
            &session,
            state.created,
            state.updated,
            state.review_items,
            fatal,
        );
        info!(session_id, status = %result.status, "{}", result.summary());
        Ok(result)
    }

    async fn process(
        &self,
        handle: &SessionHandle,
        batch: ImportBatch,
        state: &mut RunState<'_>,
        control: &RunControl,
    ) -> Option<Stop> {
        let merge_by_line = !batch.parse_errors.is_empty();
        let mut candidates: Vec<Candidate> = batch
            .records
            .into_iter()
            .map(Candidate::Row)
            .chain(batch.parse_errors.into_iter().map(Candidate::Unparsed))
            .collect();
        if merge_by_line {
            candidates.sort_by_key(Candidate::line);
        }

        let total = candidates.len();
        let chunk_size = state.options.chunk_size.max(1);
        let mut rows = candidates.into_iter();
        let mut done = 0usize;

        loop {
            let chunk: Vec<Candidate> = rows.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                return None;
            }
            if control.cancel.is_cancelled() {
                return Some(Stop::Cancelled);
            }
            done += chunk.len();

            let mut may_retry = true;
            loop {
                match self.write_chunk(handle, &chunk, state, control, may_retry).await {
                    Settled::Committed => break,
                    Settled::Stopped(stop) => return Some(stop),
                    Settled::Raced(err) if may_retry => {
                        warn!("Another session stored part of this chunk first, retrying: {}", err);
                        may_retry = false;
                    }
                    Settled::Raced(err) => return Some(Stop::Failed(err)),
                }
            }
            control.report(((done * 100) / total.max(1)).min(99) as u8);
        }
    }

    /// Classify one chunk against the store and commit it.
    ///
    /// When the commit loses an identity race the chunk's bookkeeping is undone
    /// so a second attempt sees the rows the other session stored.
    async fn write_chunk(
        &self,
        handle: &SessionHandle,
        chunk: &[Candidate],
        state: &mut RunState<'_>,
        control: &RunControl,
        may_retry: bool,
    ) -> Settled {
        if let Err(err) = self.prefetch(chunk, state).await {
            return Settled::Stopped(Stop::Failed(err));
        }

        let mut writes = match with_deadline("begin", self.storage_timeout, self.records.begin()).await {
            Ok(writes) => writes,
            Err(err) => return Settled::Stopped(Stop::Failed(err)),
        };

        let now = self.clock.now();
        let mut staged = Vec::with_capacity(chunk.len());
        let mut interrupted = None;
        for candidate in chunk.iter().cloned() {
            if control.cancel.is_cancelled() {
                interrupted = Some(Stop::Cancelled);
                break;
            }
            let row = self.classify(candidate, state, &mut *writes, now);
            if row.is_error() {
                state.errors_seen += 1;
            }
            staged.push(row);
            if state.error_limit_reached() {
                interrupted = Some(Stop::Failed(EngineError::fatal(format!(
                    "max_errors ({}) reached",
                    state.options.max_errors
                ))));
                break;
            }
        }

        if let Some(stop) = interrupted {
            if let Err(err) = writes.rollback().await {
                warn!("Rollback failed: {}", err);
            }
            let mut session = handle.write().await;
            if let Err(err) = self.apply_rows(&mut session, &staged, true).await {
                return Settled::Stopped(self.stop_for(err));
            }
            return Settled::Stopped(stop);
        }

        match self.settle(handle, writes, &staged, state, may_retry).await {
            Settled::Raced(err) => {
                state.errors_seen -= staged.iter().filter(|row| row.is_error()).count();
                for candidate in chunk {
                    if let Candidate::Row(record) = candidate {
                        state.known.remove(&identity_hash(record));
                    }
                }
                Settled::Raced(err)
            }
            settled => settled,
        }
    }

    /// Load stored records sharing an identity with anything in `chunk`.
    async fn prefetch(&self, chunk: &[Candidate], state: &mut RunState<'_>) -> Result<()> {
        let hashes: Vec<String> = chunk
            .iter()
            .filter_map(|c| match c {
                Candidate::Row(record) => Some(identity_hash(record)),
                Candidate::Unparsed(_) => None,
            })
            .filter(|hash| !state.known.contains_key(hash))
            .collect();
        if hashes.is_empty() {
            return Ok(());
        }

        let stored = with_deadline(
            "find_duplicates",
            self.storage_timeout,
            self.records.find_duplicates(&hashes, None),
        )
        .await?;
        for record in stored {
            state.known.insert(record.identity_hash.clone(), record);
        }
        Ok(())
    }

    fn classify(
        &self,
        candidate: Candidate,
        state: &mut RunState<'_>,
        writes: &mut dyn RecordBatch,
        now: DateTime<Utc>,
    ) -> StagedRow {
        let mut record = match candidate {
            Candidate::Row(record) => record,
            Candidate::Unparsed(err) => {
                return StagedRow::error(
                    Some(err.line_number),
                    IssueKind::Parse,
                    err.message,
                    Some(err.raw_line),
                )
            }
        };
        let line = (record.line_number > 0).then_some(record.line_number);

        let report = state.validator.validate(&record);
        if !report.is_acceptable(state.options.strict_mode) {
            return StagedRow::error(
                line,
                IssueKind::Validation,
                report.describe(state.options.strict_mode),
                Some(raw_of(&record)),
            );
        }
        let warnings: Vec<String> = report
            .warnings()
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect();

        if record.account_id.is_empty() {
            record.account_id = state.account_id.clone();
        }
        record.refresh_hashes();

        let outcome = match state.known.get(&record.identity_hash).cloned() {
            Some(existing) if existing.content_hash == record.content_hash => {
                if state.options.skip_duplicates {
                    RowOutcome::Duplicate
                } else {
                    RowOutcome::Error {
                        kind: IssueKind::Duplicate,
                        message: format!("duplicate of toll record {}", existing.id),
                        raw: Some(raw_of(&record)),
                    }
                }
            }
            Some(existing) => {
                let changed: Vec<String> = compare_fields(&existing, &record)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let applied = state.options.update_policy == UpdatePolicy::AutoApply;
                let payload = json!({
                    "changed_fields": changed,
                    "line_number": line,
                    "incoming_content_hash": record.content_hash,
                });

                if applied {
                    let mut corrected = existing.clone();
                    corrected.apply_correction(&record, now);
                    writes.update(corrected.clone());
                    writes.record_event(
                        Event::new("toll_record_corrected", "toll_record", &existing.id, payload, ACTOR)
                            .at(now),
                    );
                    state.known.insert(corrected.identity_hash.clone(), corrected);
                } else {
                    writes.record_event(
                        Event::new("toll_record_flagged", "toll_record", &existing.id, payload, ACTOR)
                            .at(now),
                    );
                }

                RowOutcome::Updated(ReviewItem {
                    toll_record_id: existing.id.clone(),
                    identity_hash: existing.identity_hash.clone(),
                    line_number: line,
                    changed_fields: changed,
                    applied,
                })
            }
            None => {
                record.init_identity(&self.ids.next_id(), now);
                writes.insert(record.clone());
                state.known.insert(record.identity_hash.clone(), record);
                RowOutcome::Created
            }
        };

        StagedRow {
            line,
            outcome,
            warnings,
        }
    }

    /// Commit a chunk and apply its staged rows, all under the session lock.
    async fn settle(
        &self,
        handle: &SessionHandle,
        writes: Box<dyn RecordBatch>,
        staged: &[StagedRow],
        state: &mut RunState<'_>,
        may_retry: bool,
    ) -> Settled {
        let mut session = handle.write().await;
        if session.is_terminal() {
            if let Err(err) = writes.rollback().await {
                warn!("Rollback failed: {}", err);
            }
            return Settled::Stopped(Stop::External);
        }

        let staged_writes = writes.staged();
        if let Err(err) = with_deadline("commit_chunk", self.storage_timeout, writes.commit()).await {
            if may_retry && lost_identity_race(&err) {
                return Settled::Raced(err);
            }
            error!(session_id = %session.id, "Chunk commit failed: {}", err);
            if let Err(apply_err) = self.apply_rows(&mut session, staged, true).await {
                return Settled::Stopped(self.stop_for(apply_err));
            }
            return Settled::Stopped(Stop::Failed(err));
        }
        debug!(session_id = %session.id, rows = staged.len(), writes = staged_writes, "Chunk committed");

        for row in staged {
            match &row.outcome {
                RowOutcome::Created => state.created += 1,
                RowOutcome::Updated(item) => {
                    state.updated += 1;
                    state.review_items.push(item.clone());
                }
                RowOutcome::Duplicate | RowOutcome::Error { .. } => {}
            }
        }

        match self.apply_rows(&mut session, staged, false).await {
            Ok(()) => Settled::Committed,
            Err(err) => Settled::Stopped(self.stop_for(err)),
        }
    }

    /// Fold staged rows into the session (source order) and persist it.
    async fn apply_rows(
        &self,
        session: &mut ImportSession,
        staged: &[StagedRow],
        errors_only: bool,
    ) -> Result<()> {
        for row in staged {
            match &row.outcome {
                RowOutcome::Error { kind, message, raw } => {
                    session.record_error()?;
                    session.add_error(row.line, *kind, message, raw.as_deref())?;
                    warn!(session_id = %session.id, row = ?row.line, kind = ?kind, "Row rejected: {}", message);
                }
                _ if errors_only => continue,
                RowOutcome::Duplicate => session.record_duplicate()?,
                RowOutcome::Created | RowOutcome::Updated(_) => session.record_success()?,
            }
            for warning in &row.warnings {
                session.add_warning(row.line, warning)?;
            }
        }
        debug!(
            session_id = %session.id,
            processed = session.counters.processed,
            "Session counters updated"
        );
        self.sessions.persist(session).await
    }

    fn stop_for(&self, err: EngineError) -> Stop {
        match err {
            EngineError::Terminal { .. } => Stop::External,
            other => Stop::Failed(other),
        }
    }

    /// Move the session to its final status. A session that already went
    /// terminal (external cancel) keeps the status it has.
    async fn finish(
        &self,
        handle: &SessionHandle,
        status: ImportStatus,
        fatal: Option<EngineError>,
    ) -> (ImportSession, Option<EngineError>) {
        let mut session = handle.write().await;
        if session.is_terminal() {
            return (session.clone(), fatal);
        }

        if let Some(err) = &fatal {
            error!(session_id = %session.id, "Import failed: {}", err);
            let kind = if err.is_transient() {
                IssueKind::Storage
            } else {
                IssueKind::Fatal
            };
            if let Err(log_err) = session.add_error(None, kind, &err.to_string(), None) {
                warn!(session_id = %session.id, "Could not log failure: {}", log_err);
            }
        }

        let mut fatal = fatal;
        if let Err(err) = session.transition(status, self.clock.now()) {
            warn!(session_id = %session.id, "Final transition rejected: {}", err);
        }
        if let Err(err) = self.sessions.persist(&session).await {
            error!(session_id = %session.id, "Could not persist final session state: {}", err);
            fatal.get_or_insert(err);
        }
        (session.clone(), fatal)
    }

    fn result_of(
        &self,
        session: &ImportSession,
        created: usize,
        updated: usize,
        review_items: Vec<ReviewItem>,
        fatal: Option<EngineError>,
    ) -> ImportResult {
        ImportResult {
            session_id: session.id.clone(),
            status: session.status,
            counters: session.counters,
            created,
            updated,
            review_items,
            error_sample: session
                .errors
                .iter()
                .take(self.config.error_sample_size)
                .cloned()
                .collect(),
            fatal,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
