// Toll Reconciliation Engine - Core Library
// Exposes the import / reconciliation engine for the CLI and tests

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod hashing;          // Identity + content hashes
pub mod importer;         // Batch Importer
pub mod jobs;             // Job Orchestrator
pub mod ledger;           // Trip ledger port
pub mod parser;
pub mod reconciliation;   // Mapping engine
pub mod session;          // Import Session Tracker
pub mod store;            // Persistence ports + in-memory store
pub mod validation;

// Re-export commonly used types
pub use clock::{Clock, IdGenerator, ManualClock, SequentialIds, SystemClock, UuidGenerator};
pub use config::{EngineConfig, ImportConfig, JobConfig, MatchConfig, TimeoutConfig, UpdatePolicy};
pub use db::{setup_database, Event, SqliteStore, TollRecord};
pub use error::{EngineError, ErrorKind, Result};
pub use hashing::{compare_fields, content_hash, identity_hash};
pub use importer::{BatchImporter, ImportBatch, ImportResult, ReviewItem, RunControl};
pub use jobs::{auto_match_job, import_job, Job, JobContext, JobFn, JobOrchestrator, JobStatus, JobType};
pub use ledger::{InMemoryLedger, LedgerQuery, TripEntry, TripLedger};
pub use parser::{EtcCsvParser, ParseOutcome, RowError, TollParser};
pub use reconciliation::{
    AutoMatchReport, BulkOutcome, BulkResult, Mapping, MappingStatus, MatchDecision, MatchType,
    NewMapping, ReconciliationEngine, ScoredCandidate,
};
pub use session::{ImportSession, ImportStatus, SessionSource, SessionTracker};
pub use store::{JobStore, MappingStore, MemoryStore, RecordBatch, SessionStore, TollRecordStore};
pub use validation::{RecordValidator, ValidationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
