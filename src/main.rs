use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use toll_reconcile::{
    auto_match_job, import_job, BatchImporter, Clock, EngineConfig, EtcCsvParser, IdGenerator,
    ImportBatch, InMemoryLedger, Job, JobOrchestrator, JobStatus, JobType, MappingStatus,
    ReconciliationEngine, RunControl, SessionSource, SessionTracker, SqliteStore, SystemClock, TollParser,
    UpdatePolicy, UuidGenerator,
};

/// Toll Reconcile - import ETC statements and match them against a trip ledger
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "TOLL_DB", default_value = "toll.db")]
    db: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a statement CSV as one session
    Import {
        file: PathBuf,
        #[arg(long)]
        account: String,
        /// Reject rows with validation warnings
        #[arg(long)]
        strict: bool,
        /// flag_for_review | auto_apply
        #[arg(long)]
        policy: Option<UpdatePolicy>,
        #[arg(long)]
        max_errors: Option<usize>,
        /// Count duplicates as errors instead of skipping them
        #[arg(long)]
        reject_duplicates: bool,
    },
    /// Auto-match records in a date range against a ledger export
    Match {
        #[arg(long)]
        ledger: PathBuf,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// List import sessions
    Sessions,
    /// List mappings of one toll record
    Mappings { record: String },
    /// Move a mapping to a new status (active, inactive, rejected, pending)
    SetStatus { mapping: String, status: MappingStatus },
    /// List persisted jobs, purging terminal ones older than the retention window
    Jobs,
}

struct App {
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: EngineConfig,
}

impl App {
    fn open(db: &Path, config: EngineConfig) -> Result<Self> {
        let store = SqliteStore::open(db)
            .with_context(|| format!("Failed to open database {}", db.display()))?;
        Ok(App {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            config,
        })
    }

    fn importer(&self) -> BatchImporter {
        let sessions = Arc::new(SessionTracker::new(
            self.store.clone(),
            self.clock.clone(),
            self.ids.clone(),
            self.config.timeouts.storage,
        ));
        BatchImporter::new(
            self.store.clone(),
            sessions,
            self.clock.clone(),
            self.ids.clone(),
            self.config.import.clone(),
            self.config.timeouts.storage,
        )
    }

    fn reconciler(&self, ledger: InMemoryLedger) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.store.clone(),
            self.store.clone(),
            Arc::new(ledger),
            self.clock.clone(),
            self.ids.clone(),
            self.config.matching.clone(),
            self.config.timeouts.clone(),
        )
    }

    fn orchestrator(&self) -> Arc<JobOrchestrator> {
        JobOrchestrator::start(
            self.store.clone(),
            self.clock.clone(),
            self.ids.clone(),
            self.config.jobs.clone(),
            self.config.timeouts.storage,
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env().context("Invalid TOLL_* configuration")?;

    match cli.command {
        Command::Import {
            file,
            account,
            strict,
            policy,
            max_errors,
            reject_duplicates,
        } => {
            let mut config = config;
            config.import.strict_mode |= strict;
            config.import.skip_duplicates &= !reject_duplicates;
            if let Some(policy) = policy {
                config.import.update_policy = policy;
            }
            if let Some(max_errors) = max_errors {
                config.import.max_errors = max_errors;
            }
            let app = App::open(&cli.db, config)?;
            run_import(&app, &file, &account, cli.json).await
        }
        Command::Match {
            ledger,
            from,
            to,
            threshold,
        } => {
            let app = App::open(&cli.db, config)?;
            run_match(&app, &ledger, from, to, threshold, cli.json).await
        }
        Command::Sessions => {
            let app = App::open(&cli.db, config)?;
            let sessions = app.importer().sessions().list().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                println!("📋 {} import sessions", sessions.len());
                for session in &sessions {
                    println!("  {}", session.summary());
                }
            }
            Ok(())
        }
        Command::Mappings { record } => {
            let app = App::open(&cli.db, config)?;
            let mappings = app.reconciler(InMemoryLedger::default()).mappings_for_record(&record).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else {
                println!("🔗 {} mappings for {}", mappings.len(), record);
                for m in &mappings {
                    println!(
                        "  {} → {} {} [{}] {:.2} ({})",
                        m.id,
                        m.entity_type,
                        m.entity_ref,
                        m.status,
                        m.confidence,
                        m.match_type.as_str()
                    );
                }
            }
            Ok(())
        }
        Command::SetStatus { mapping, status } => {
            let app = App::open(&cli.db, config)?;
            let updated = app
                .reconciler(InMemoryLedger::default())
                .update_status(&mapping, status)
                .await
                .with_context(|| format!("Failed to move mapping {} to {}", mapping, status))?;
            println!("✓ Mapping {} is now {}", updated.id, updated.status);
            Ok(())
        }
        Command::Jobs => {
            let app = App::open(&cli.db, config)?;
            let orchestrator = app.orchestrator();
            let purged = orchestrator.cleanup_old_jobs(app.config.jobs.retention).await?;
            let jobs = orchestrator.list_jobs().await?;
            orchestrator.shutdown().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                println!("⚙️  {} jobs ({} purged)", jobs.len(), purged);
                for job in &jobs {
                    println!("  {} {} [{}] {}%", job.id, job.job_type, job.status, job.progress);
                }
            }
            Ok(())
        }
    }
}

async fn run_import(app: &App, file: &Path, account: &str, json: bool) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let importer = Arc::new(app.importer());
    let parser = EtcCsvParser::new();
    let outcome = match parser.parse(&bytes, &file_name) {
        Ok(outcome) => outcome,
        Err(_) => {
            // records a failed session for the unreadable upload
            let result = importer
                .import_bytes(SessionSource::file(account, &file_name), &bytes, &parser, RunControl::default())
                .await?;
            anyhow::bail!("Statement could not be parsed: {}", result.summary());
        }
    };
    println!(
        "📂 Parsed {} rows from {} ({} unreadable)",
        outcome.total_rows(),
        file_name,
        outcome.errors.len()
    );

    let session = importer
        .start_session(SessionSource::file(account, &file_name))
        .await?;
    let batch = ImportBatch::from(outcome);

    let orchestrator = app.orchestrator();
    let job = orchestrator
        .spawn_job(JobType::Import, import_job(importer, session.id.clone(), batch))
        .await?;
    let job = finish(&orchestrator, &job, app.config.jobs.job_timeout).await?;
    report_job(&job, json)
}

async fn run_match(
    app: &App,
    ledger: &Path,
    from: NaiveDate,
    to: NaiveDate,
    threshold: Option<f64>,
    json: bool,
) -> Result<()> {
    let ledger = InMemoryLedger::from_csv(ledger)
        .with_context(|| format!("Failed to load ledger {}", ledger.display()))?;
    println!("📒 Loaded {} ledger entries", ledger.len());

    let engine = Arc::new(app.reconciler(ledger));
    let orchestrator = app.orchestrator();
    let job = orchestrator
        .spawn_job(JobType::AutoMatch, auto_match_job(engine, from, to, threshold))
        .await?;
    let job = finish(&orchestrator, &job, app.config.jobs.job_timeout).await?;
    report_job(&job, json)
}

/// Wait for a job, cancelling it on Ctrl-C, then stop the pool.
async fn finish(orchestrator: &JobOrchestrator, job: &Job, timeout: Duration) -> Result<Job> {
    let done = tokio::select! {
        done = orchestrator.wait_for(&job.id, timeout + Duration::from_secs(5)) => done?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("⚠️  Interrupted, cancelling job {}", job.id);
            orchestrator.cancel_job(&job.id).await?;
            orchestrator.wait_for(&job.id, timeout).await?
        }
    };
    orchestrator.shutdown().await;
    Ok(done)
}

fn report_job(job: &Job, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    match job.status {
        JobStatus::Completed => println!("✅ Job {} completed", job.id),
        JobStatus::Canceled => println!("⚠️  Job {} canceled", job.id),
        status => println!("❌ Job {} {}", job.id, status),
    }
    if let Some(result) = &job.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    if let Some(err) = &job.error {
        anyhow::bail!("Job {} failed: {}", job.id, err);
    }
    Ok(())
}
