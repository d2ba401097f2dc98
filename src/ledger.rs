// 📒 Trip Ledger - read-only source of reconciliation candidates
//
// The real ledger (dispatch system, expense tool) lives elsewhere; the engine
// only asks it for trips inside a date window.

use crate::error::{EngineError, Result};
use crate::hashing::normalize_text;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEntry {
    pub id: String,
    /// What kind of entity this is on the ledger side ("trip", "delivery", ...)
    pub entity_type: String,
    pub trip_date: NaiveDate,
    pub vehicle_number: String,
    /// Toll the trip is expected to incur, when the ledger knows it
    #[serde(default)]
    pub expected_amount: Option<i64>,
    #[serde(default)]
    pub route: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub vehicle_number: Option<String>,
}

#[async_trait]
pub trait TripLedger: Send + Sync {
    async fn find_candidates(&self, query: &LedgerQuery) -> Result<Vec<TripEntry>>;
}

// ============================================================================
// IN-MEMORY LEDGER
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    entries: Vec<TripEntry>,
}

impl InMemoryLedger {
    pub fn new(entries: Vec<TripEntry>) -> Self {
        InMemoryLedger { entries }
    }

    /// Load a ledger export: `id,entity_type,trip_date,vehicle_number,expected_amount,route`.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| EngineError::validation("ledger", e.to_string()))?;

        let mut entries = Vec::new();
        for (idx, row) in rdr.deserialize::<TripEntry>().enumerate() {
            let entry = row.map_err(|e| {
                EngineError::validation("ledger", format!("line {}: {}", idx + 2, e))
            })?;
            entries.push(entry);
        }
        Ok(InMemoryLedger { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TripLedger for InMemoryLedger {
    async fn find_candidates(&self, query: &LedgerQuery) -> Result<Vec<TripEntry>> {
        let vehicle = query.vehicle_number.as_deref().map(normalize_text);
        Ok(self
            .entries
            .iter()
            .filter(|e| e.trip_date >= query.from && e.trip_date <= query.to)
            .filter(|e| {
                vehicle
                    .as_ref()
                    .map_or(true, |v| normalize_text(&e.vehicle_number) == *v)
            })
            .cloned()
            .collect())
    }
}
