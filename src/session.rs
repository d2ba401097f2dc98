// 📋 Import Session Tracker - state machine for one bulk ingestion run
//
//   pending ──► processing ──► completed
//      │            ├────────► failed
//      └────────────┴────────► cancelled
//
// Invariant checked before every counter commit:
//   processed == success + error + duplicate  &&  processed <= total

use crate::clock::{Clock, IdGenerator};
use crate::error::{with_deadline, EngineError, Result};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Completed | ImportStatus::Failed | ImportStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ImportStatus::Pending),
            "processing" => Ok(ImportStatus::Processing),
            "completed" => Ok(ImportStatus::Completed),
            "failed" => Ok(ImportStatus::Failed),
            "cancelled" => Ok(ImportStatus::Cancelled),
            other => Err(EngineError::validation(
                "import_status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

// ============================================================================
// SOURCE METADATA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FileUpload,
    Scraper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSource {
    pub account_id: String,
    pub file_name: Option<String>,
    pub kind: SourceKind,
}

impl SessionSource {
    pub fn file(account_id: &str, file_name: &str) -> Self {
        SessionSource {
            account_id: account_id.to_string(),
            file_name: Some(file_name.to_string()),
            kind: SourceKind::FileUpload,
        }
    }

    pub fn scraper(account_id: &str) -> Self {
        SessionSource {
            account_id: account_id.to_string(),
            file_name: None,
            kind: SourceKind::Scraper,
        }
    }
}

// ============================================================================
// COUNTERS & ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub error: usize,
    pub duplicate: usize,
}

impl SessionCounters {
    pub fn check(&self) -> Result<()> {
        if self.processed != self.success + self.error + self.duplicate {
            return Err(EngineError::fatal(format!(
                "processed ({}) != success ({}) + error ({}) + duplicate ({})",
                self.processed, self.success, self.error, self.duplicate
            )));
        }
        if self.processed > self.total {
            return Err(EngineError::fatal(format!(
                "processed ({}) exceeds total ({})",
                self.processed, self.total
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Parse,
    Validation,
    Warning,
    Duplicate,
    Storage,
    Fatal,
}

/// One entry of a session's error or warning log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportIssue {
    /// Source line; `None` for session-level failures
    pub row: Option<usize>,
    pub kind: IssueKind,
    pub message: String,
    pub raw: Option<String>,
}

// ============================================================================
// IMPORT SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: String,
    pub source: SessionSource,
    pub status: ImportStatus,
    pub counters: SessionCounters,
    pub errors: Vec<ImportIssue>,
    pub warnings: Vec<ImportIssue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportSession {
    pub fn new(id: String, source: SessionSource, now: DateTime<Utc>) -> Self {
        ImportSession {
            id,
            source,
            status: ImportStatus::Pending,
            counters: SessionCounters::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(EngineError::Terminal {
                entity: "import_session".to_string(),
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }

    /// Move to `next`, stamping `started_at` / `completed_at` as appropriate.
    pub fn transition(&mut self, next: ImportStatus, now: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable()?;
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "import_session".to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        if next == ImportStatus::Processing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    fn mutate_counters<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut SessionCounters),
    {
        self.ensure_mutable()?;
        let mut next = self.counters;
        change(&mut next);
        next.check()?;
        self.counters = next;
        Ok(())
    }

    pub fn set_total(&mut self, total: usize) -> Result<()> {
        self.mutate_counters(|c| c.total = total)
    }

    pub fn record_success(&mut self) -> Result<()> {
        self.mutate_counters(|c| {
            c.processed += 1;
            c.success += 1;
        })
    }

    pub fn record_duplicate(&mut self) -> Result<()> {
        self.mutate_counters(|c| {
            c.processed += 1;
            c.duplicate += 1;
        })
    }

    pub fn record_error(&mut self) -> Result<()> {
        self.mutate_counters(|c| {
            c.processed += 1;
            c.error += 1;
        })
    }

    /// Append to the error log. Unbounded; callers cap growth with `max_errors`.
    pub fn add_error(
        &mut self,
        row: Option<usize>,
        kind: IssueKind,
        message: &str,
        raw: Option<&str>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        self.errors.push(ImportIssue {
            row,
            kind,
            message: message.to_string(),
            raw: raw.map(str::to_string),
        });
        Ok(())
    }

    pub fn add_warning(&mut self, row: Option<usize>, message: &str) -> Result<()> {
        self.ensure_mutable()?;
        self.warnings.push(ImportIssue {
            row,
            kind: IssueKind::Warning,
            message: message.to_string(),
            raw: None,
        });
        Ok(())
    }

    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "Session {} [{}]: {}/{} processed, {} ok, {} duplicate, {} error",
            self.id, self.status, c.processed, c.total, c.success, c.duplicate, c.error
        )
    }
}

// ============================================================================
// SESSION TRACKER
// ============================================================================

pub type SessionHandle = Arc<RwLock<ImportSession>>;

/// Live registry of sessions backed by a [`SessionStore`].
///
/// Each session gets its own lock; snapshots are written to the store while
/// that lock is held so a stale snapshot can never overwrite a newer one.
pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    live: RwLock<HashMap<String, SessionHandle>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    storage_timeout: Duration,
}

impl SessionTracker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        storage_timeout: Duration,
    ) -> Self {
        SessionTracker {
            store,
            live: RwLock::new(HashMap::new()),
            clock,
            ids,
            storage_timeout,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn create(&self, source: SessionSource) -> Result<ImportSession> {
        let session = ImportSession::new(self.ids.next_id(), source, self.clock.now());
        self.persist(&session).await?;

        self.live
            .write()
            .await
            .insert(session.id.clone(), Arc::new(RwLock::new(session.clone())));

        info!(session_id = %session.id, account_id = %session.source.account_id, "Import session created");
        Ok(session)
    }

    /// Shared handle to a session, loading it from the store on first use.
    pub async fn handle(&self, id: &str) -> Result<SessionHandle> {
        if let Some(handle) = self.live.read().await.get(id) {
            return Ok(Arc::clone(handle));
        }

        let loaded = with_deadline(
            "load_session",
            self.storage_timeout,
            self.store.load_session(id),
        )
        .await?
        .ok_or_else(|| EngineError::not_found("import_session", id))?;

        let mut live = self.live.write().await;
        let handle = live
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(loaded)));
        Ok(Arc::clone(handle))
    }

    /// Point-in-time copy of a session.
    pub async fn get(&self, id: &str) -> Result<ImportSession> {
        let handle = self.handle(id).await?;
        let session = handle.read().await;
        Ok(session.clone())
    }

    pub async fn list(&self) -> Result<Vec<ImportSession>> {
        with_deadline("list_sessions", self.storage_timeout, self.store.list_sessions()).await
    }

    /// Cancel a session that has not reached a terminal state. A running import
    /// notices on its next counter mutation.
    pub async fn cancel(&self, id: &str) -> Result<ImportSession> {
        let handle = self.handle(id).await?;
        let cancelled = {
            let mut session = handle.write().await;
            session.transition(ImportStatus::Cancelled, self.clock.now())?;
            self.persist(&session).await?;
            session.clone()
        };
        self.release(id).await;

        warn!(session_id = %id, "Import session cancelled");
        Ok(cancelled)
    }

    /// Write a snapshot. Callers hold the session's write lock.
    pub async fn persist(&self, session: &ImportSession) -> Result<()> {
        with_deadline(
            "save_session",
            self.storage_timeout,
            self.store.save_session(session),
        )
        .await
    }

    /// Drop the live handle of a finished session; the store keeps the snapshot.
    pub async fn release(&self, id: &str) {
        let mut live = self.live.write().await;
        let finished = match live.get(id) {
            Some(handle) => handle.read().await.is_terminal(),
            None => false,
        };
        if finished {
            live.remove(id);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
    }

    fn create_test_session() -> ImportSession {
        ImportSession::new(
            "sess-1".to_string(),
            SessionSource::file("acct-1", "march.csv"),
            now(),
        )
    }

    fn tracker() -> SessionTracker {
        SessionTracker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(now())),
            Arc::new(SequentialIds::new("sess")),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_allowed_transitions() {
        use ImportStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        use ImportStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            let mut session = create_test_session();
            session.transition(Processing, now()).unwrap();
            session.transition(terminal, now()).unwrap();

            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert_matches!(
                    session.transition(next, now()),
                    Err(EngineError::Terminal { .. })
                );
            }
            assert_matches!(session.record_success(), Err(EngineError::Terminal { .. }));
            assert_matches!(
                session.add_error(Some(1), IssueKind::Validation, "late", None),
                Err(EngineError::Terminal { .. })
            );
        }
    }

    #[test]
    fn test_invalid_transition_error() {
        let mut session = create_test_session();
        let err = session.transition(ImportStatus::Completed, now()).unwrap_err();

        assert_eq!(
            err,
            EngineError::InvalidTransition {
                entity: "import_session".into(),
                from: "pending".into(),
                to: "completed".into(),
            }
        );
        assert_eq!(session.status, ImportStatus::Pending);
    }

    #[test]
    fn test_timestamps_stamped() {
        let mut session = create_test_session();
        session.transition(ImportStatus::Processing, now()).unwrap();
        assert_eq!(session.started_at, Some(now()));
        assert!(session.completed_at.is_none());

        session.transition(ImportStatus::Completed, now()).unwrap();
        assert_eq!(session.completed_at, Some(now()));
    }

    #[test]
    fn test_counters_keep_invariant() {
        let mut session = create_test_session();
        session.transition(ImportStatus::Processing, now()).unwrap();
        session.set_total(3).unwrap();

        session.record_success().unwrap();
        session.record_error().unwrap();
        session.record_duplicate().unwrap();

        let c = session.counters;
        assert_eq!(c.processed, 3);
        assert_eq!(c.processed, c.success + c.error + c.duplicate);
        assert!(c.check().is_ok());
    }

    #[test]
    fn test_counter_overflow_rejected_without_commit() {
        let mut session = create_test_session();
        session.transition(ImportStatus::Processing, now()).unwrap();
        session.set_total(1).unwrap();
        session.record_success().unwrap();

        let before = session.counters;
        assert_matches!(session.record_success(), Err(EngineError::Fatal { .. }));
        assert_eq!(session.counters, before);

        // total can never drop below what was already processed
        assert_matches!(session.set_total(0), Err(EngineError::Fatal { .. }));
    }

    #[test]
    fn test_error_log_is_ordered() {
        let mut session = create_test_session();
        session
            .add_error(Some(2), IssueKind::Validation, "missing vehicle", Some("raw,2"))
            .unwrap();
        session
            .add_error(Some(5), IssueKind::Parse, "bad date", None)
            .unwrap();

        assert_eq!(session.errors.len(), 2);
        assert_eq!(session.errors[0].row, Some(2));
        assert_eq!(session.errors[0].raw.as_deref(), Some("raw,2"));
        assert_eq!(session.errors[1].row, Some(5));
    }

    #[tokio::test]
    async fn test_tracker_create_get_cancel() {
        let tracker = tracker();
        let session = tracker
            .create(SessionSource::scraper("acct-9"))
            .await
            .unwrap();
        assert_eq!(session.id, "sess-1");
        assert_eq!(session.status, ImportStatus::Pending);

        let cancelled = tracker.cancel(&session.id).await.unwrap();
        assert_eq!(cancelled.status, ImportStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // the store has the terminal snapshot too
        let listed = tracker.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ImportStatus::Cancelled);

        assert_matches!(
            tracker.cancel(&session.id).await,
            Err(EngineError::Terminal { .. })
        );
    }

    #[tokio::test]
    async fn test_cancel_drops_live_handle() {
        let tracker = tracker();
        let kept = tracker.create(SessionSource::file("acct-1", "a.csv")).await.unwrap();
        let dropped = tracker.create(SessionSource::file("acct-1", "b.csv")).await.unwrap();
        assert_eq!(tracker.live.read().await.len(), 2);

        tracker.cancel(&dropped.id).await.unwrap();
        let live = tracker.live.read().await;
        assert_eq!(live.len(), 1);
        assert!(live.contains_key(&kept.id));
    }

    #[tokio::test]
    async fn test_tracker_release_then_reload() {
        let tracker = tracker();
        let session = tracker
            .create(SessionSource::file("acct-1", "a.csv"))
            .await
            .unwrap();
        tracker.cancel(&session.id).await.unwrap();
        tracker.release(&session.id).await;

        let reloaded = tracker.get(&session.id).await.unwrap();
        assert_eq!(reloaded.status, ImportStatus::Cancelled);

        assert_matches!(
            tracker.get("missing").await,
            Err(EngineError::NotFound { .. })
        );
    }
}
