// ⚖️ Reconciliation Engine - match toll records against the trip ledger
//
// Scoring:
//   exact (same date, same vehicle, same amount when the ledger has one) = 1.0
//   otherwise (w_date·date + w_vehicle·vehicle + w_amount·amount) / Σw
//
// Exclusivity: a toll record has at most one `active` mapping. Activation runs
// under a lock keyed by toll-record id, and the store rejects a second active
// mapping on its own as well.

use crate::clock::{Clock, IdGenerator};
use crate::config::{MatchConfig, TimeoutConfig, MAX_DATE_WINDOW_DAYS};
use crate::db::{Event, TollRecord};
use crate::error::{with_deadline, EngineError, Result};
use crate::hashing::normalize_text;
use crate::importer::RunControl;
use crate::ledger::{LedgerQuery, TripEntry, TripLedger};
use crate::store::{MappingStore, TollRecordStore};
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const ACTOR: &str = "reconciliation_engine";

// ============================================================================
// MAPPING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Auto,
    Manual,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Auto => "auto",
            MatchType::Manual => "manual",
        }
    }
}

impl FromStr for MatchType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(MatchType::Auto),
            "manual" => Ok(MatchType::Manual),
            other => Err(EngineError::validation("match_type", format!("unknown match type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Pending,
    Active,
    Rejected,
    Inactive,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Active => "active",
            MappingStatus::Rejected => "rejected",
            MappingStatus::Inactive => "inactive",
        }
    }

    /// pending→active|rejected, active→inactive, inactive→active, rejected→pending
    pub fn can_transition_to(&self, next: MappingStatus) -> bool {
        use MappingStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Rejected) | (Active, Inactive) | (Inactive, Active) | (Rejected, Pending)
        )
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(MappingStatus::Pending),
            "active" => Ok(MappingStatus::Active),
            "rejected" => Ok(MappingStatus::Rejected),
            "inactive" => Ok(MappingStatus::Inactive),
            other => Err(EngineError::validation("status", format!("unknown mapping status {:?}", other))),
        }
    }
}

/// Scored association between a toll record and a ledger entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: String,
    pub toll_record_id: String,
    pub entity_ref: String,
    pub entity_type: String,
    pub match_type: MatchType,
    /// In [0, 1]
    pub confidence: f64,
    pub status: MappingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a manual mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMapping {
    pub toll_record_id: String,
    pub entity_ref: String,
    pub entity_type: String,
    pub confidence: f64,
    /// `pending` or `active`
    pub status: MappingStatus,
}

// ============================================================================
// SCORING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub entry: TripEntry,
    pub score: f64,
    pub exact: bool,
    pub date_score: f64,
    pub vehicle_score: f64,
    pub amount_score: f64,
}

/// Score one ledger entry against a toll record.
pub fn score_candidate(record: &TollRecord, entry: &TripEntry, config: &MatchConfig) -> ScoredCandidate {
    let day_gap = (record.usage_date - entry.trip_date).num_days().abs();
    let same_vehicle = normalize_text(&record.vehicle_number) == normalize_text(&entry.vehicle_number);
    let amount_agrees = entry
        .expected_amount
        .map_or(true, |expected| expected == record.net_amount());

    let date_score = (1.0 - day_gap as f64 / (config.date_window_days + 1) as f64).max(0.0);
    let vehicle_score = if same_vehicle { 1.0 } else { 0.0 };
    let amount_score = match entry.expected_amount {
        // unknown amount neither helps nor hurts
        None => 0.5,
        Some(expected) => {
            let actual = record.net_amount();
            let scale = expected.abs().max(actual.abs()).max(1) as f64;
            (1.0 - (expected - actual).abs() as f64 / scale).max(0.0)
        }
    };

    let exact = day_gap == 0 && same_vehicle && amount_agrees;
    let score = if exact {
        1.0
    } else {
        let total = config.weight_date + config.weight_vehicle + config.weight_amount;
        let weighted = config.weight_date * date_score
            + config.weight_vehicle * vehicle_score
            + config.weight_amount * amount_score;
        if total > 0.0 {
            (weighted / total).clamp(0.0, 1.0)
        } else {
            0.0
        }
    };

    ScoredCandidate {
        entry: entry.clone(),
        score,
        exact,
        date_score,
        vehicle_score,
        amount_score,
    }
}

/// Highest score first; ties broken by ledger id so runs are repeatable.
fn rank(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Activated,
    Pending,
    /// The record/entity pair was already mapped; nothing new written
    Existing,
    Unmatched,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMatch {
    pub toll_record_id: String,
    pub decision: MatchDecision,
    pub mapping: Option<Mapping>,
    /// Every candidate at or above the threshold, best first
    pub candidates: Vec<ScoredCandidate>,
    pub error: Option<EngineError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoMatchReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub threshold: f64,
    pub examined: usize,
    /// Records that already had an active mapping
    pub skipped: usize,
    pub activated: usize,
    pub pending: usize,
    pub existing: usize,
    pub unmatched: usize,
    pub conflicts: usize,
    pub cancelled: bool,
    pub outcomes: Vec<RecordMatch>,
}

impl AutoMatchReport {
    fn new(from: NaiveDate, to: NaiveDate, threshold: f64) -> Self {
        AutoMatchReport {
            from,
            to,
            threshold,
            examined: 0,
            skipped: 0,
            activated: 0,
            pending: 0,
            existing: 0,
            unmatched: 0,
            conflicts: 0,
            cancelled: false,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, outcome: RecordMatch) {
        match outcome.decision {
            MatchDecision::Activated => self.activated += 1,
            MatchDecision::Pending => self.pending += 1,
            MatchDecision::Existing => self.existing += 1,
            MatchDecision::Unmatched => self.unmatched += 1,
            MatchDecision::Conflict => self.conflicts += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn summary(&self) -> String {
        format!(
            "{}..{}: {} examined, {} activated, {} pending, {} existing, {} unmatched, {} conflicts, {} skipped",
            self.from,
            self.to,
            self.examined,
            self.activated,
            self.pending,
            self.existing,
            self.unmatched,
            self.conflicts,
            self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOutcome {
    AllSucceeded,
    PartiallyFailed,
    AllFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem<T> {
    pub index: usize,
    pub result: std::result::Result<T, EngineError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkResult<T> {
    pub outcome: BulkOutcome,
    pub items: Vec<BulkItem<T>>,
}

impl<T> BulkResult<T> {
    fn from_items(items: Vec<BulkItem<T>>) -> Self {
        let failed = items.iter().filter(|i| i.result.is_err()).count();
        let outcome = if failed == 0 {
            BulkOutcome::AllSucceeded
        } else if failed == items.len() {
            BulkOutcome::AllFailed
        } else {
            BulkOutcome::PartiallyFailed
        };
        BulkResult { outcome, items }
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

// ============================================================================
// PER-RECORD LOCKS
// ============================================================================

/// One async mutex per toll-record id, created on demand.
#[derive(Default)]
struct RecordLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    async fn acquire(&self, toll_record_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // drop locks nobody is holding or waiting on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(toll_record_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    records: Arc<dyn TollRecordStore>,
    mappings: Arc<dyn MappingStore>,
    ledger: Arc<dyn TripLedger>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: MatchConfig,
    timeouts: TimeoutConfig,
    locks: RecordLocks,
}

impl ReconciliationEngine {
    pub fn new(
        records: Arc<dyn TollRecordStore>,
        mappings: Arc<dyn MappingStore>,
        ledger: Arc<dyn TripLedger>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: MatchConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        ReconciliationEngine {
            records,
            mappings,
            ledger,
            clock,
            ids,
            config,
            timeouts,
            locks: RecordLocks::default(),
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn is_high_confidence(&self, score: f64) -> bool {
        score >= self.config.auto_activate_threshold
    }

    // ========================================================================
    // AUTO MATCH
    // ========================================================================

    /// Match every record in `[from, to]` that has no active mapping.
    ///
    /// `threshold` overrides `confidence_threshold` for this run. Ledger and
    /// store failures abort the run; per-record conflicts are reported.
    pub async fn auto_match(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        threshold: Option<f64>,
        control: &RunControl,
    ) -> Result<AutoMatchReport> {
        if from > to {
            return Err(EngineError::validation("date_range", format!("{} is after {}", from, to)));
        }
        let threshold = threshold.unwrap_or(self.config.confidence_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::validation("confidence_threshold", "must be within [0, 1]"));
        }

        let records = with_deadline(
            "find_in_range",
            self.timeouts.storage,
            self.records.find_in_range(from, to),
        )
        .await?;
        info!(%from, %to, threshold, records = records.len(), "Auto-match started");

        let mut report = AutoMatchReport::new(from, to, threshold);
        let total = records.len();
        for (idx, record) in records.iter().enumerate() {
            if control.cancel.is_cancelled() {
                report.cancelled = true;
                warn!(examined = report.examined, "Auto-match cancelled");
                break;
            }
            report.examined += 1;

            let active = with_deadline(
                "active_mapping",
                self.timeouts.storage,
                self.mappings.active_mapping(&record.id),
            )
            .await?;
            if active.is_some() {
                report.skipped += 1;
            } else {
                let outcome = self.match_record(record, threshold).await?;
                report.push(outcome);
            }

            if let Some(on_progress) = &control.on_progress {
                on_progress((((idx + 1) * 100) / total.max(1)) as u8);
            }
        }

        info!("Auto-match finished: {}", report.summary());
        Ok(report)
    }

    async fn match_record(&self, record: &TollRecord, threshold: f64) -> Result<RecordMatch> {
        let window = Days::new(self.config.date_window_days.clamp(0, MAX_DATE_WINDOW_DAYS) as u64);
        let out_of_range = || {
            EngineError::validation(
                "date_window_days",
                format!("window around {} leaves the calendar", record.usage_date),
            )
        };
        let query = LedgerQuery {
            from: record.usage_date.checked_sub_days(window).ok_or_else(out_of_range)?,
            to: record.usage_date.checked_add_days(window).ok_or_else(out_of_range)?,
            vehicle_number: self
                .config
                .filter_by_vehicle
                .then(|| record.vehicle_number.clone()),
        };
        let entries = with_deadline(
            "ledger_find_candidates",
            self.timeouts.ledger,
            self.ledger.find_candidates(&query),
        )
        .await?;

        let mut candidates: Vec<ScoredCandidate> = entries
            .iter()
            .map(|entry| score_candidate(record, entry, &self.config))
            .filter(|c| c.score >= threshold)
            .collect();
        rank(&mut candidates);

        let Some(top) = candidates.first().cloned() else {
            debug!(toll_record_id = %record.id, "No candidate above threshold");
            return Ok(RecordMatch {
                toll_record_id: record.id.clone(),
                decision: MatchDecision::Unmatched,
                mapping: None,
                candidates,
                error: None,
            });
        };

        let _guard = self.locks.acquire(&record.id).await;

        let known = with_deadline(
            "mappings_for_record",
            self.timeouts.storage,
            self.mappings.mappings_for_record(&record.id),
        )
        .await?;
        if let Some(pair) = known
            .iter()
            .find(|m| m.entity_ref == top.entry.id && m.entity_type == top.entry.entity_type)
        {
            return Ok(RecordMatch {
                toll_record_id: record.id.clone(),
                decision: MatchDecision::Existing,
                mapping: Some(pair.clone()),
                candidates,
                error: None,
            });
        }

        let has_active = known.iter().any(|m| m.status == MappingStatus::Active);
        let status = if self.is_high_confidence(top.score) && !has_active {
            MappingStatus::Active
        } else {
            MappingStatus::Pending
        };

        let now = self.clock.now();
        let mut mapping = Mapping {
            id: self.ids.next_id(),
            toll_record_id: record.id.clone(),
            entity_ref: top.entry.id.clone(),
            entity_type: top.entry.entity_type.clone(),
            match_type: MatchType::Auto,
            confidence: top.score,
            status,
            created_at: now,
            updated_at: now,
        };

        let mut conflict = None;
        match self.insert(&mapping).await {
            Ok(()) => {}
            Err(err @ EngineError::Conflict { .. }) if status == MappingStatus::Active => {
                // another writer activated a mapping for this record first
                warn!(toll_record_id = %record.id, "Activation lost a race, storing as pending: {}", err);
                mapping.status = MappingStatus::Pending;
                self.insert(&mapping).await?;
                conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
        self.audit("mapping_created", &mapping, json!({
            "status": mapping.status.as_str(),
            "confidence": mapping.confidence,
            "match_type": mapping.match_type.as_str(),
            "candidates": candidates.len(),
        }))
        .await;

        let decision = match mapping.status {
            MappingStatus::Active => MatchDecision::Activated,
            _ if conflict.is_some() => MatchDecision::Conflict,
            _ => MatchDecision::Pending,
        };
        debug!(toll_record_id = %record.id, mapping_id = %mapping.id, decision = ?decision, score = top.score, "Mapping stored");

        Ok(RecordMatch {
            toll_record_id: record.id.clone(),
            decision,
            mapping: Some(mapping),
            candidates,
            error: conflict,
        })
    }

    // ========================================================================
    // MANUAL LIFECYCLE
    // ========================================================================

    pub async fn create_mapping(&self, new: NewMapping) -> Result<Mapping> {
        if !(0.0..=1.0).contains(&new.confidence) {
            return Err(EngineError::validation("confidence", "must be within [0, 1]"));
        }
        if !matches!(new.status, MappingStatus::Pending | MappingStatus::Active) {
            return Err(EngineError::validation(
                "status",
                format!("a new mapping cannot start as {}", new.status),
            ));
        }
        if new.entity_ref.trim().is_empty() {
            return Err(EngineError::validation("entity_ref", "entity reference is required"));
        }
        with_deadline(
            "get_record",
            self.timeouts.storage,
            self.records.get_record(&new.toll_record_id),
        )
        .await?
        .ok_or_else(|| EngineError::not_found("toll_record", &new.toll_record_id))?;

        let _guard = self.locks.acquire(&new.toll_record_id).await;
        if new.status == MappingStatus::Active {
            self.ensure_no_active(&new.toll_record_id, None).await?;
        }

        let now = self.clock.now();
        let mapping = Mapping {
            id: self.ids.next_id(),
            toll_record_id: new.toll_record_id,
            entity_ref: new.entity_ref,
            entity_type: new.entity_type,
            match_type: MatchType::Manual,
            confidence: new.confidence,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        self.insert(&mapping).await?;
        self.audit("mapping_created", &mapping, json!({
            "status": mapping.status.as_str(),
            "confidence": mapping.confidence,
            "match_type": mapping.match_type.as_str(),
        }))
        .await;

        info!(mapping_id = %mapping.id, toll_record_id = %mapping.toll_record_id, status = %mapping.status, "Mapping created");
        Ok(mapping)
    }

    /// Move a mapping along its lifecycle. Activating fails with a conflict
    /// naming the mapping that is already active.
    pub async fn update_status(&self, mapping_id: &str, next: MappingStatus) -> Result<Mapping> {
        let current = self.load(mapping_id).await?;
        let _guard = self.locks.acquire(&current.toll_record_id).await;

        // re-read under the lock
        let mut mapping = self.load(mapping_id).await?;
        if !mapping.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "mapping".to_string(),
                from: mapping.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == MappingStatus::Active {
            self.ensure_no_active(&mapping.toll_record_id, Some(&mapping.id)).await?;
        }

        let previous = mapping.status;
        mapping.status = next;
        mapping.updated_at = self.clock.now();
        with_deadline(
            "update_mapping",
            self.timeouts.storage,
            self.mappings.update_mapping(&mapping),
        )
        .await?;
        self.audit("mapping_status_changed", &mapping, json!({
            "from": previous.as_str(),
            "to": next.as_str(),
        }))
        .await;

        info!(mapping_id, from = %previous, to = %next, "Mapping status changed");
        Ok(mapping)
    }

    pub async fn activate(&self, mapping_id: &str) -> Result<Mapping> {
        self.update_status(mapping_id, MappingStatus::Active).await
    }

    pub async fn deactivate(&self, mapping_id: &str) -> Result<Mapping> {
        self.update_status(mapping_id, MappingStatus::Inactive).await
    }

    pub async fn reject(&self, mapping_id: &str) -> Result<Mapping> {
        self.update_status(mapping_id, MappingStatus::Rejected).await
    }

    pub async fn reopen(&self, mapping_id: &str) -> Result<Mapping> {
        self.update_status(mapping_id, MappingStatus::Pending).await
    }

    pub async fn mappings_for_record(&self, toll_record_id: &str) -> Result<Vec<Mapping>> {
        with_deadline(
            "mappings_for_record",
            self.timeouts.storage,
            self.mappings.mappings_for_record(toll_record_id),
        )
        .await
    }

    pub async fn mappings_by_status(&self, status: MappingStatus) -> Result<Vec<Mapping>> {
        with_deadline(
            "mappings_by_status",
            self.timeouts.storage,
            self.mappings.mappings_by_status(status),
        )
        .await
    }

    // ========================================================================
    // BULK
    // ========================================================================

    /// Create each mapping independently; one failure does not stop the rest.
    pub async fn bulk_create(&self, items: Vec<NewMapping>) -> BulkResult<Mapping> {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            results.push(BulkItem {
                index,
                result: self.create_mapping(item).await,
            });
        }
        let bulk = BulkResult::from_items(results);
        info!(outcome = ?bulk.outcome, succeeded = bulk.succeeded(), failed = bulk.failed(), "Bulk create finished");
        bulk
    }

    pub async fn bulk_update_status(&self, changes: Vec<(String, MappingStatus)>) -> BulkResult<Mapping> {
        let mut results = Vec::with_capacity(changes.len());
        for (index, (mapping_id, next)) in changes.into_iter().enumerate() {
            results.push(BulkItem {
                index,
                result: self.update_status(&mapping_id, next).await,
            });
        }
        let bulk = BulkResult::from_items(results);
        info!(outcome = ?bulk.outcome, succeeded = bulk.succeeded(), failed = bulk.failed(), "Bulk status update finished");
        bulk
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn load(&self, mapping_id: &str) -> Result<Mapping> {
        with_deadline(
            "get_mapping",
            self.timeouts.storage,
            self.mappings.get_mapping(mapping_id),
        )
        .await?
        .ok_or_else(|| EngineError::not_found("mapping", mapping_id))
    }

    async fn insert(&self, mapping: &Mapping) -> Result<()> {
        with_deadline(
            "insert_mapping",
            self.timeouts.storage,
            self.mappings.insert_mapping(mapping),
        )
        .await
    }

    async fn ensure_no_active(&self, toll_record_id: &str, except: Option<&str>) -> Result<()> {
        let active = with_deadline(
            "active_mapping",
            self.timeouts.storage,
            self.mappings.active_mapping(toll_record_id),
        )
        .await?;
        match active {
            Some(active) if Some(active.id.as_str()) != except => Err(EngineError::conflict(
                "mapping",
                active.id,
                format!("toll record {} already has an active mapping; deactivate it first", toll_record_id),
            )),
            _ => Ok(()),
        }
    }

    async fn audit(&self, event_type: &str, mapping: &Mapping, data: serde_json::Value) {
        let event = Event::new(event_type, "mapping", &mapping.id, data, ACTOR).at(self.clock.now());
        let result = with_deadline(
            "append_event",
            self.timeouts.storage,
            self.records.append_event(event),
        )
        .await;
        if let Err(err) = result {
            warn!(mapping_id = %mapping.id, "Audit event not written: {}", err);
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
    use crate::ledger::InMemoryLedger;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    const VEHICLE: &str = "品川 300 あ 12-34";

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn create_test_record(id: &str, d: u32, vehicle: &str, amount: i64) -> TollRecord {
        let mut record = TollRecord::new(day(d), "08:15", "Tokyo IC", "Atsugi IC", vehicle)
            .with_card("1234")
            .with_amounts(amount, 0);
        record.init_identity(id, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        record
    }

    fn trip(id: &str, d: u32, vehicle: &str, amount: Option<i64>) -> TripEntry {
        TripEntry {
            id: id.to_string(),
            entity_type: "trip".to_string(),
            trip_date: day(d),
            vehicle_number: vehicle.to_string(),
            expected_amount: amount,
            route: None,
        }
    }

    async fn create_engine(records: Vec<TollRecord>, trips: Vec<TripEntry>) -> (ReconciliationEngine, MemoryStore) {
        let store = MemoryStore::new();
        store.insert_batch(records).await.unwrap();
        let engine = ReconciliationEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(InMemoryLedger::new(trips)),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap())),
            Arc::new(SequentialIds::new("map")),
            MatchConfig::default(),
            TimeoutConfig::default(),
        );
        (engine, store)
    }

    fn manual(record: &str, entity: &str, status: MappingStatus) -> NewMapping {
        NewMapping {
            toll_record_id: record.to_string(),
            entity_ref: entity.to_string(),
            entity_type: "trip".to_string(),
            confidence: 0.9,
            status,
        }
    }

    #[test]
    fn test_exact_match_scores_one() {
        let record = create_test_record("r1", 14, VEHICLE, 1_320);
        let scored = score_candidate(&record, &trip("t1", 14, VEHICLE, Some(1_320)), &MatchConfig::default());

        assert!(scored.exact);
        assert_eq!(scored.score, 1.0);
    }

    #[test]
    fn test_weighted_score() {
        let record = create_test_record("r1", 14, VEHICLE, 1_320);
        // one day off, same vehicle, amount unknown: 0.4*0.5 + 0.4*1 + 0.2*0.5
        let scored = score_candidate(&record, &trip("t1", 15, VEHICLE, None), &MatchConfig::default());

        assert!(!scored.exact);
        assert!((scored.score - 0.7).abs() < 1e-9);

        let other_vehicle = score_candidate(&record, &trip("t2", 14, "横浜 500 さ 56-78", Some(1_320)), &MatchConfig::default());
        assert!((other_vehicle.score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_status_lifecycle() {
        use MappingStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Active.can_transition_to(Inactive));
        assert!(Inactive.can_transition_to(Active));
        assert!(Rejected.can_transition_to(Pending));

        assert!(!Active.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Active));
        assert!(!Inactive.can_transition_to(Pending));
    }

    #[tokio::test]
    async fn test_auto_match_activates_exact_match() {
        let (engine, store) = create_engine(
            vec![create_test_record("r1", 14, VEHICLE, 1_320)],
            vec![trip("t1", 14, VEHICLE, None), trip("t2", 20, VEHICLE, None)],
        )
        .await;

        let report = engine
            .auto_match(day(1), day(31), Some(0.8), &RunControl::default())
            .await
            .unwrap();

        assert_eq!(report.activated, 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.decision, MatchDecision::Activated);
        assert_eq!(outcome.candidates.len(), 1);
        let mapping = outcome.mapping.as_ref().unwrap();
        assert_eq!(mapping.status, MappingStatus::Active);
        assert_eq!(mapping.confidence, 1.0);
        assert_eq!(mapping.entity_ref, "t1");

        let events = store.events_for("mapping", &mapping.id).await.unwrap();
        assert_eq!(events[0].event_type, "mapping_created");
    }

    #[tokio::test]
    async fn test_auto_match_below_auto_activate_is_pending() {
        let (engine, _store) = create_engine(
            vec![create_test_record("r1", 14, VEHICLE, 1_320)],
            vec![trip("t1", 15, VEHICLE, None)],
        )
        .await;

        let report = engine
            .auto_match(day(1), day(31), Some(0.6), &RunControl::default())
            .await
            .unwrap();

        assert_eq!(report.pending, 1);
        assert_eq!(report.outcomes[0].mapping.as_ref().unwrap().status, MappingStatus::Pending);
    }

    #[tokio::test]
    async fn test_auto_match_discards_below_threshold() {
        let (engine, _store) = create_engine(
            vec![create_test_record("r1", 14, VEHICLE, 1_320)],
            vec![trip("t1", 15, VEHICLE, None)],
        )
        .await;

        let report = engine
            .auto_match(day(1), day(31), None, &RunControl::default())
            .await
            .unwrap();

        assert_eq!(report.unmatched, 1);
        assert!(report.outcomes[0].candidates.is_empty());
        assert!(engine.mappings_for_record("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_match_rerun_does_not_duplicate() {
        let (engine, _store) = create_engine(
            vec![create_test_record("r1", 14, VEHICLE, 1_320)],
            vec![trip("t1", 15, VEHICLE, None)],
        )
        .await;

        engine.auto_match(day(1), day(31), Some(0.6), &RunControl::default()).await.unwrap();
        let second = engine.auto_match(day(1), day(31), Some(0.6), &RunControl::default()).await.unwrap();

        assert_eq!(second.existing, 1);
        assert_eq!(engine.mappings_for_record("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_match_skips_records_with_active_mapping() {
        let (engine, _store) = create_engine(
            vec![create_test_record("r1", 14, VEHICLE, 1_320)],
            vec![trip("t1", 14, VEHICLE, None)],
        )
        .await;
        engine.create_mapping(manual("r1", "manual-1", MappingStatus::Active)).await.unwrap();

        let report = engine.auto_match(day(1), day(31), None, &RunControl::default()).await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_activation_conflict_requires_deactivate() {
        let (engine, _store) = create_engine(vec![create_test_record("r1", 14, VEHICLE, 1_320)], vec![]).await;
        let first = engine.create_mapping(manual("r1", "t1", MappingStatus::Active)).await.unwrap();
        let second = engine.create_mapping(manual("r1", "t2", MappingStatus::Pending)).await.unwrap();

        let err = engine.activate(&second.id).await.unwrap_err();
        assert_matches!(err, EngineError::Conflict { ref conflicting_id, .. } if *conflicting_id == first.id);

        let err = engine
            .create_mapping(manual("r1", "t3", MappingStatus::Active))
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::Conflict { .. });

        engine.deactivate(&first.id).await.unwrap();
        let promoted = engine.activate(&second.id).await.unwrap();
        assert_eq!(promoted.status, MappingStatus::Active);

        let active: Vec<_> = engine
            .mappings_for_record("r1")
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.status == MappingStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_and_validation() {
        let (engine, _store) = create_engine(vec![create_test_record("r1", 14, VEHICLE, 1_320)], vec![]).await;
        let mapping = engine.create_mapping(manual("r1", "t1", MappingStatus::Pending)).await.unwrap();

        engine.reject(&mapping.id).await.unwrap();
        assert_matches!(
            engine.activate(&mapping.id).await,
            Err(EngineError::InvalidTransition { .. })
        );
        let reopened = engine.reopen(&mapping.id).await.unwrap();
        assert_eq!(reopened.status, MappingStatus::Pending);

        assert_matches!(
            engine.create_mapping(manual("missing", "t1", MappingStatus::Pending)).await,
            Err(EngineError::NotFound { .. })
        );
        assert_matches!(
            engine.create_mapping(manual("r1", "t9", MappingStatus::Inactive)).await,
            Err(EngineError::Validation { .. })
        );
        assert_matches!(
            engine.activate("nope").await,
            Err(EngineError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_bulk_create_partial_failure() {
        let (engine, _store) = create_engine(vec![create_test_record("r1", 14, VEHICLE, 1_320)], vec![]).await;

        let bulk = engine
            .bulk_create(vec![
                manual("r1", "t1", MappingStatus::Active),
                manual("r1", "t2", MappingStatus::Active),
                manual("r1", "t3", MappingStatus::Pending),
            ])
            .await;

        assert_eq!(bulk.outcome, BulkOutcome::PartiallyFailed);
        assert_eq!(bulk.succeeded(), 2);
        assert_eq!(bulk.items[1].index, 1);
        assert_matches!(bulk.items[1].result, Err(EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_bulk_update_all_failed() {
        let (engine, _store) = create_engine(vec![], vec![]).await;

        let bulk = engine
            .bulk_update_status(vec![
                ("x".to_string(), MappingStatus::Active),
                ("y".to_string(), MappingStatus::Rejected),
            ])
            .await;

        assert_eq!(bulk.outcome, BulkOutcome::AllFailed);
        assert_eq!(bulk.failed(), 2);
    }
}
