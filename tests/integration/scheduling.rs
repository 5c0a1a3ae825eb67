//! Recurring job scenarios.
//!
//! Driven by paused tokio time: the mock clock follows the runtime's
//! virtual clock, so hours of schedule pass instantly and deterministically.

use crate::common::{FLEET, seed_probes, start_scheduler, wait_for_times_run};
use chrono::TimeDelta;
use probe_scheduler::testing::{FlakyStorage, MockClock, base_time, job_data};
use probe_scheduler::{
    Event, InMemoryStorage, JobData, ProbeId, Target, TaskState, TaskStore,
};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

async fn tasks_for(storage: &impl TaskStore, probe: &str) -> Vec<probe_scheduler::Task> {
    storage
        .list_tasks_for_probe(&ProbeId::new(probe))
        .await
        .unwrap()
}

/// Test: `now/1h/3` with an empty target fires three times an hour apart,
/// one task per probe each time, then stops.
#[tokio::test(start_paused = true)]
async fn test_hourly_job_fires_three_times_then_stops() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), FLEET, clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let job_id = harness.handle.add_job(job_data("now/1h/3")).await.unwrap();
    let job = wait_for_times_run(&harness.handle, job_id, 3, 4 * HOUR).await;
    assert!(job.bookkeeping.is_done);

    for (probe, _, _) in FLEET {
        let tasks = tasks_for(storage.as_ref(), probe).await;
        let times: Vec<_> = tasks.iter().map(|t| t.creation_time).collect();
        assert_eq!(
            times,
            vec![
                base_time(),
                base_time() + TimeDelta::hours(1),
                base_time() + TimeDelta::hours(2),
            ]
        );
        assert!(tasks.iter().all(|t| t.state == TaskState::Ready));
        assert!(tasks.iter().all(|t| t.test_name == "web_connectivity"));
    }

    // Nothing at hour four.
    tokio::time::sleep(3 * HOUR).await;
    assert_eq!(tasks_for(storage.as_ref(), "probe-it-ios").await.len(), 3);

    let events = harness.events.events_for(job_id).await;
    let fired: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::JobFired {
                firing,
                matched,
                created,
                ..
            } => Some((*firing, *matched, *created)),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec![(1, 3, 3), (2, 3, 3), (3, 3, 3)]);
    assert!(matches!(
        events.last(),
        Some(Event::JobDone { times_run: 3, .. })
    ));

    harness.handle.shutdown().await.unwrap();
}

/// Test: Only probes matching the target receive tasks.
#[tokio::test(start_paused = true)]
async fn test_target_selects_matching_probes() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), FLEET, clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let mut data = job_data("now");
    data.target = Target::everyone()
        .with_countries(["it"])
        .with_platforms(["Android"]);
    let job_id = harness.handle.add_job(data).await.unwrap();
    wait_for_times_run(&harness.handle, job_id, 1, HOUR).await;

    assert_eq!(tasks_for(storage.as_ref(), "probe-it-android").await.len(), 1);
    assert!(tasks_for(storage.as_ref(), "probe-it-ios").await.is_empty());
    assert!(tasks_for(storage.as_ref(), "probe-de-android").await.is_empty());

    // The stored target is normalized.
    let job = harness.handle.job_status(job_id).await.unwrap();
    assert_eq!(job.target.countries, vec!["IT"]);
    assert_eq!(job.target.platforms, vec!["android"]);

    harness.handle.shutdown().await.unwrap();
}

/// Test: The delay shifts every firing, not just the first.
#[tokio::test(start_paused = true)]
async fn test_delay_offsets_every_firing() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let data = JobData {
        delay: 600,
        ..job_data("now/1h/2")
    };
    let job_id = harness.handle.add_job(data).await.unwrap();

    let pending = harness.handle.job_status(job_id).await.unwrap();
    assert_eq!(pending.bookkeeping.times_run, 0);
    assert_eq!(
        pending.bookkeeping.next_run_at,
        base_time() + TimeDelta::minutes(10)
    );

    wait_for_times_run(&harness.handle, job_id, 2, 3 * HOUR).await;
    let times: Vec<_> = tasks_for(storage.as_ref(), "probe-it-android")
        .await
        .iter()
        .map(|t| t.creation_time)
        .collect();
    assert_eq!(
        times,
        vec![
            base_time() + TimeDelta::minutes(10),
            base_time() + TimeDelta::minutes(70),
        ]
    );

    harness.handle.shutdown().await.unwrap();
}

/// Test: An unbounded job keeps going and its bookkeeping tracks the grid.
#[tokio::test(start_paused = true)]
async fn test_unbounded_job_bookkeeping() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let job_id = harness.handle.add_job(job_data("now/30m")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2 * 3600 + 5 * 60)).await;

    let job = harness.handle.job_status(job_id).await.unwrap();
    assert_eq!(job.bookkeeping.times_run, 5);
    assert!(!job.bookkeeping.is_done);
    assert_eq!(
        job.bookkeeping.next_run_at,
        base_time() + TimeDelta::minutes(150)
    );

    harness.handle.shutdown().await.unwrap();
}

/// Test: A failed firing is reported but not counted; it is retried on the
/// next grid point and the job still delivers every firing it owes.
#[tokio::test(start_paused = true)]
async fn test_failed_firing_does_not_disable_job() {
    let storage = Arc::new(FlakyStorage::new(InMemoryStorage::new()));
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..2], clock.as_ref()).await;
    storage.set_registry_down(true);
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let job_id = harness.handle.add_job(job_data("now/1h/3")).await.unwrap();
    tokio::time::sleep(HOUR / 2).await;

    let job = harness.handle.job_status(job_id).await.unwrap();
    assert_eq!(job.bookkeeping.times_run, 0);
    assert!(!job.bookkeeping.is_done);
    assert_eq!(job.bookkeeping.next_run_at, base_time() + TimeDelta::hours(1));
    storage.set_registry_down(false);

    let job = wait_for_times_run(&harness.handle, job_id, 3, 4 * HOUR).await;
    assert!(job.bookkeeping.is_done);
    let tasks = tasks_for(storage.as_ref(), "probe-it-android").await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].creation_time, base_time() + TimeDelta::hours(1));

    let events = harness.events.events_for(job_id).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::FiringFailed { firing: 1, .. }))
    );
    let fired = events
        .iter()
        .filter(|e| matches!(e, Event::JobFired { .. }))
        .count();
    assert_eq!(fired, 3);

    harness.handle.shutdown().await.unwrap();
}

/// Test: A job submitted with no probes registered still fires on time.
#[tokio::test(start_paused = true)]
async fn test_empty_fleet_still_counts_firings() {
    let storage = Arc::new(InMemoryStorage::new());
    let harness = start_scheduler(storage, Arc::new(MockClock::new(base_time()))).await;

    let job_id = harness.handle.add_job(job_data("now/1h/2")).await.unwrap();
    let job = wait_for_times_run(&harness.handle, job_id, 2, 2 * HOUR).await;
    assert!(job.bookkeeping.is_done);

    let events = harness.events.events_for(job_id).await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::JobFired {
            matched: 0,
            created: 0,
            ..
        }
    )));

    harness.handle.shutdown().await.unwrap();
}

/// Test: Several jobs run independently of each other.
#[tokio::test(start_paused = true)]
async fn test_jobs_run_independently() {
    let storage = Arc::new(InMemoryStorage::new());
    let clock = Arc::new(MockClock::new(base_time()));
    seed_probes(storage.as_ref(), &FLEET[..1], clock.as_ref()).await;
    let harness = start_scheduler(Arc::clone(&storage), clock).await;

    let fast = harness.handle.add_job(job_data("now/10m/6")).await.unwrap();
    let slow = harness.handle.add_job(job_data("now/1h/2")).await.unwrap();

    wait_for_times_run(&harness.handle, fast, 6, 2 * HOUR).await;
    let slow_job = harness.handle.job_status(slow).await.unwrap();
    assert_eq!(slow_job.bookkeeping.times_run, 1);

    let jobs = harness.handle.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 2);

    harness.handle.shutdown().await.unwrap();
}
