//! Recovery scenario integration tests.
//!
//! Jobs survive a restart: bookkeeping is persisted after every firing and
//! `Scheduler::start` picks every unfinished job back up.

use crate::common::{FLEET, seed_probes, start_scheduler, wait_for_times_run};
use chrono::TimeDelta;
use probe_scheduler::testing::{MockClock, base_time, job_data};
use probe_scheduler::{
    InMemoryStorage, Job, JobStore, ProbeId, SqliteStorage, TaskState, TaskStore,
};
use std::sync::Arc;
use std::time::Duration;

/// Test: A job interrupted by a restart catches up its missed firings in
/// order and finishes, with nothing skipped or repeated.
#[tokio::test]
async fn test_resume_after_restart_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("recovery.db");
    let first_start = base_time() - TimeDelta::hours(3);

    // First process: registers the job and fires once.
    let job_id = {
        let storage = Arc::new(SqliteStorage::new(&db_path).await.unwrap());
        let clock = Arc::new(MockClock::frozen(first_start));
        seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;
        let harness = start_scheduler(Arc::clone(&storage), clock).await;

        let job_id = harness.handle.add_job(job_data("now/1h/4")).await.unwrap();
        wait_for_times_run(&harness.handle, job_id, 1, Duration::from_secs(10)).await;

        harness.handle.shutdown().await.unwrap();
        harness.task.await.unwrap();
        storage.close().await;
        job_id
    };

    // Second process, three hours later.
    let storage = Arc::new(SqliteStorage::new(&db_path).await.unwrap());
    let stored = storage.get_job(&job_id).await.unwrap();
    assert_eq!(stored.bookkeeping.times_run, 1);
    assert_eq!(
        stored.bookkeeping.next_run_at,
        first_start + TimeDelta::hours(1)
    );
    assert_eq!(stored.schedule.start_time(), first_start);

    let clock = Arc::new(MockClock::frozen(base_time()));
    let harness = start_scheduler(Arc::clone(&storage), clock).await;
    let job = wait_for_times_run(&harness.handle, job_id, 4, Duration::from_secs(10)).await;
    assert!(job.bookkeeping.is_done);

    let tasks = storage
        .list_tasks_for_probe(&ProbeId::new(FLEET[0].0))
        .await
        .unwrap();
    let times: Vec<_> = tasks.iter().map(|t| t.creation_time).collect();
    assert_eq!(
        times,
        vec![first_start, base_time(), base_time(), base_time()]
    );
    assert!(tasks.iter().all(|t| t.state == TaskState::Ready));

    harness.handle.shutdown().await.unwrap();
    harness.task.await.unwrap();

    assert!(storage.get_job(&job_id).await.unwrap().bookkeeping.is_done);
    assert!(storage.list_active_jobs().await.unwrap().is_empty());
    storage.close().await;
}

/// Test: Finished jobs are not picked up again.
#[tokio::test(start_paused = true)]
async fn test_done_jobs_are_not_resumed() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;

    let mut finished = Job::from_data(job_data("now/1h/2"), clock.as_ref()).unwrap();
    finished.bookkeeping.times_run = 2;
    finished.bookkeeping.is_done = true;
    storage.insert_job(&finished).await.unwrap();

    let harness = start_scheduler(Arc::clone(&storage), clock).await;
    tokio::time::sleep(Duration::from_secs(3 * 3600)).await;

    assert!(
        storage
            .list_tasks_for_probe(&ProbeId::new(FLEET[0].0))
            .await
            .unwrap()
            .is_empty()
    );
    let listed = harness.handle.job_status(finished.id).await.unwrap();
    assert_eq!(listed.bookkeeping.times_run, 2);
    assert!(listed.bookkeeping.is_done);

    harness.handle.shutdown().await.unwrap();
}

/// Test: Jobs restored from storage keep their target and template.
#[tokio::test]
async fn test_job_definition_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::new(dir.path().join("jobs.db")).await.unwrap();
    let clock = MockClock::frozen(base_time());

    let mut data = job_data("R3/2024-01-15T13:00:00+01:00/PT30M");
    data.delay = 45;
    data.comment = "hourly blocking check".to_string();
    data.target = probe_scheduler::Target::everyone()
        .with_countries(["ir", "TR"])
        .with_platforms(["Android"]);
    let job = Job::from_data(data, &clock).unwrap();
    storage.insert_job(&job).await.unwrap();

    let loaded = storage.get_job(&job.id).await.unwrap();
    assert_eq!(loaded, job);
    assert_eq!(loaded.target.countries, vec!["IR", "TR"]);
    assert_eq!(
        loaded.bookkeeping.next_run_at,
        base_time() + TimeDelta::seconds(45)
    );
    storage.close().await;
}
