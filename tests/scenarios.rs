// End-to-end scenarios: importer + sessions + reconciliation + jobs over real stores

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use toll_reconcile::{
    BatchImporter, Clock, ImportBatch, ImportConfig, ImportStatus, InMemoryLedger, JobConfig,
    JobContext, JobOrchestrator, JobStatus, JobType, ManualClock, MappingStatus, MappingStore,
    MatchConfig, MemoryStore, ReconciliationEngine, RunControl, SequentialIds, SessionSource,
    SessionStore, SessionTracker, SqliteStore, TimeoutConfig, TollRecord, TollRecordStore,
    TripEntry,
};

const VEHICLE: &str = "品川 300 あ 12-34";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn row(line: usize, vehicle: &str, time: &str, amount: i64) -> TollRecord {
    TollRecord::new(day(14), time, "Tokyo IC", "Atsugi IC", vehicle)
        .with_card("1234")
        .with_amounts(amount, 0)
        .with_usage_type("ETC")
        .with_provenance("", "march.csv", line)
}

fn importer_over<S>(store: Arc<S>, clock: Arc<dyn Clock>) -> BatchImporter
where
    S: TollRecordStore + SessionStore + 'static,
{
    let sessions = Arc::new(SessionTracker::new(
        store.clone(),
        clock.clone(),
        Arc::new(SequentialIds::new("sess")),
        Duration::from_secs(2),
    ));
    BatchImporter::new(
        store,
        sessions,
        clock,
        Arc::new(SequentialIds::new("rec")),
        ImportConfig::default(),
        Duration::from_secs(2),
    )
}

fn engine_over<S>(store: Arc<S>, trips: Vec<TripEntry>, prefix: &str) -> ReconciliationEngine
where
    S: TollRecordStore + MappingStore + 'static,
{
    ReconciliationEngine::new(
        store.clone(),
        store,
        Arc::new(InMemoryLedger::new(trips)),
        Arc::new(ManualClock::new(now())),
        Arc::new(SequentialIds::new(prefix)),
        MatchConfig::default(),
        TimeoutConfig::default(),
    )
}

fn trip(id: &str, d: u32, vehicle: &str) -> TripEntry {
    TripEntry {
        id: id.to_string(),
        entity_type: "trip".to_string(),
        trip_date: day(d),
        vehicle_number: vehicle.to_string(),
        expected_amount: None,
        route: None,
    }
}

fn source() -> SessionSource {
    SessionSource::file("acct-1", "march.csv")
}

#[tokio::test]
async fn scenario_a_bad_row_does_not_abort_session() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let importer = importer_over(store.clone(), Arc::new(ManualClock::new(now())));

    let batch = ImportBatch::from_records(vec![
        row(2, VEHICLE, "08:00", 1_320),
        row(3, "", "09:00", 1_320),
        row(4, VEHICLE, "10:00", 1_320),
    ]);
    let result = importer.import(source(), batch, RunControl::default()).await.unwrap();

    assert_eq!(result.status, ImportStatus::Completed);
    assert_eq!(result.counters.success, 2);
    assert_eq!(result.counters.error, 1);
    assert_eq!(result.counters.processed, 3);

    let session = store.load_session(&result.session_id).await.unwrap().unwrap();
    assert_eq!(session.status, ImportStatus::Completed);
    assert_eq!(session.errors.len(), 1);
    assert_eq!(session.errors[0].row, Some(3));
    assert_eq!(store.count_records().await.unwrap(), 2);
}

#[tokio::test]
async fn scenario_b_same_record_twice() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let importer = importer_over(store.clone(), Arc::new(ManualClock::new(now())));

    let first = importer
        .import(
            source(),
            ImportBatch::from_records(vec![row(2, VEHICLE, "08:00", 1_320)]),
            RunControl::default(),
        )
        .await
        .unwrap();
    assert_eq!(first.created, 1);

    let second = importer
        .import(
            source(),
            ImportBatch::from_records(vec![row(2, VEHICLE, "08:00", 1_320)]),
            RunControl::default(),
        )
        .await
        .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.counters.duplicate, 1);
    assert_eq!(store.count_records().await.unwrap(), 1);
}

#[tokio::test]
async fn reimporting_unchanged_batch_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let importer = importer_over(store.clone(), Arc::new(ManualClock::new(now())));
    let rows = || {
        ImportBatch::from_records(vec![
            row(2, VEHICLE, "08:00", 1_320),
            row(3, VEHICLE, "12:30", 990),
            row(4, "横浜 500 さ 56-78", "08:00", 1_320),
        ])
    };

    let first = importer.import(source(), rows(), RunControl::default()).await.unwrap();
    assert_eq!(first.created, 3);

    let again = importer.import(source(), rows(), RunControl::default()).await.unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.counters.duplicate, 3);
    assert_eq!(again.counters.processed, again.counters.total);
    assert_eq!(store.count_records().await.unwrap(), 3);
}

#[tokio::test]
async fn scenario_c_exact_match_is_activated() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let importer = importer_over(store.clone(), Arc::new(ManualClock::new(now())));
    importer
        .import(
            source(),
            ImportBatch::from_records(vec![row(2, VEHICLE, "08:00", 1_320)]),
            RunControl::default(),
        )
        .await
        .unwrap();

    let engine = engine_over(store.clone(), vec![trip("trip-77", 14, VEHICLE)], "map");
    let report = engine
        .auto_match(day(1), day(31), Some(0.8), &RunControl::default())
        .await
        .unwrap();

    assert_eq!(report.activated, 1);
    let mapping = report.outcomes[0].mapping.clone().unwrap();
    assert_eq!(mapping.status, MappingStatus::Active);
    assert_eq!(mapping.confidence, 1.0);
    assert_eq!(mapping.entity_ref, "trip-77");

    let active = store.active_mapping(&mapping.toll_record_id).await.unwrap().unwrap();
    assert_eq!(active.id, mapping.id);
    let events = store.events_for("mapping", &mapping.id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_auto_match_activates_once_per_record() {
    let store = Arc::new(MemoryStore::new());
    let mut records = Vec::new();
    let mut trips = Vec::new();
    for n in 0..12u32 {
        let mut record = row(n as usize + 2, VEHICLE, &format!("{:02}:00", n + 6), 1_000);
        record.init_identity(&format!("r{}", n), now());
        records.push(record);
        trips.push(trip(&format!("t{}", n), 14, VEHICLE));
    }
    store.insert_batch(records).await.unwrap();

    // two engines, two lock maps: only the store stands between them
    let left = Arc::new(engine_over(store.clone(), trips.clone(), "left"));
    let right = Arc::new(engine_over(store.clone(), trips, "right"));
    let shared = Arc::clone(&left);

    let control = RunControl::default();
    let (a, b, c) = tokio::join!(
        left.auto_match(day(1), day(31), None, &control),
        right.auto_match(day(1), day(31), None, &control),
        shared.auto_match(day(1), day(31), None, &control),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    for n in 0..12 {
        let mappings = store.mappings_for_record(&format!("r{}", n)).await.unwrap();
        let active = mappings.iter().filter(|m| m.status == MappingStatus::Active).count();
        assert_eq!(active, 1, "record r{} has {} active mappings", n, active);
    }
}

#[tokio::test]
async fn scenario_d_cancel_running_job() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = JobOrchestrator::start(
        store.clone(),
        Arc::new(ManualClock::new(now())),
        Arc::new(SequentialIds::new("job")),
        JobConfig::default(),
        Duration::from_secs(2),
    );

    let job = orchestrator
        .spawn_job(
            JobType::Import,
            Box::new(|ctx: JobContext| {
                Box::pin(async move {
                    while !ctx.is_cancelled() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(json!({ "stopped": true }))
                }) as toll_reconcile::jobs::JobFuture
            }),
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if orchestrator.get_job(&job.id).await.unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.cancel_job(&job.id).await.unwrap();

    // one polling interval of the job is 10ms
    let done = orchestrator.wait_for(&job.id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(done.status, JobStatus::Canceled);
    assert!(done.completed_at.is_some());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn import_runs_as_job() {
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now()));
    let importer = Arc::new(importer_over(store.clone(), clock.clone()));
    let session = importer.start_session(source()).await.unwrap();

    let orchestrator = JobOrchestrator::start(
        store.clone(),
        clock,
        Arc::new(SequentialIds::new("job")),
        JobConfig::default(),
        Duration::from_secs(2),
    );
    let batch = ImportBatch::from_records(vec![
        row(2, VEHICLE, "08:00", 1_320),
        row(3, VEHICLE, "09:00", 1_320),
    ]);
    let job = orchestrator
        .spawn_job(
            JobType::Import,
            toll_reconcile::import_job(importer.clone(), session.id.clone(), batch),
        )
        .await
        .unwrap();

    let done = orchestrator.wait_for(&job.id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert_eq!(done.result.unwrap()["counters"]["success"], json!(2));

    let session = importer.sessions().get(&session.id).await.unwrap();
    assert_eq!(session.status, ImportStatus::Completed);

    orchestrator.shutdown().await;
}
