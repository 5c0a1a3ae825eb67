//! Task lifecycle scenarios against both storage backends.

use chrono::TimeDelta;
use probe_scheduler::testing::{MockClock, base_time};
use probe_scheduler::{
    EventBus, InMemoryStorage, LifecycleError, ProbeId, SqliteStorage, Task, TaskLifecycle,
    TaskState, TaskStore,
};
use serde_json::json;
use std::sync::Arc;

fn lifecycle<S: TaskStore>(storage: Arc<S>, clock: Arc<MockClock>) -> TaskLifecycle<S> {
    TaskLifecycle::new(storage, clock, Arc::new(EventBus::new()))
}

async fn insert_ready<S: TaskStore>(storage: &S, probe: &str) -> Task {
    let task = Task::new(
        ProbeId::new(probe),
        "web_connectivity",
        json!({"urls": ["https://example.org"]}),
        base_time(),
    );
    storage.insert_task(&task).await.unwrap();
    task
}

async fn accept_accept_done_reject<S: TaskStore>(storage: Arc<S>) {
    let clock = Arc::new(MockClock::frozen(base_time()));
    let lifecycle = lifecycle(Arc::clone(&storage), clock.clone());
    let task = insert_ready(storage.as_ref(), "probe-1").await;
    let me = ProbeId::new("probe-1");

    clock.advance(TimeDelta::seconds(5));
    lifecycle.accept(&task.id, &me).await.unwrap();

    let err = lifecycle.accept(&task.id, &me).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InconsistentState { .. }));

    clock.advance(TimeDelta::seconds(5));
    lifecycle.done(&task.id, &me).await.unwrap();

    let err = lifecycle.reject(&task.id, &me).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InconsistentState { .. }));

    let stored = storage.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Done);
    assert_eq!(stored.accept_time, Some(base_time() + TimeDelta::seconds(5)));
    assert_eq!(stored.done_time, Some(base_time() + TimeDelta::seconds(10)));
    assert_eq!(stored.last_updated, base_time() + TimeDelta::seconds(10));
    assert_eq!(stored.creation_time, base_time());
}

async fn mixed_races<S: TaskStore + 'static>(storage: Arc<S>, contenders: usize) {
    let clock = Arc::new(MockClock::frozen(base_time()));
    let lifecycle = lifecycle(Arc::clone(&storage), clock);
    let task = insert_ready(storage.as_ref(), "probe-1").await;

    let mut handles = Vec::new();
    for i in 0..contenders {
        let lifecycle = lifecycle.clone();
        let id = task.id;
        handles.push(tokio::spawn(async move {
            let me = ProbeId::new("probe-1");
            // half try to accept, half try to reject
            if i % 2 == 0 {
                lifecycle.accept(&id, &me).await
            } else {
                lifecycle.reject(&id, &me).await
            }
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => winners += 1,
            Err(LifecycleError::InconsistentState { .. }) => losers += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    // accept and reject race from ready; a reject may still follow a
    // winning accept, so the task always ends rejected
    let stored = storage.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Rejected);
    assert!(winners == 1 || winners == 2, "winners: {winners}");
    assert_eq!(winners + losers, contenders);
}

async fn concurrent_accepts<S: TaskStore + 'static>(storage: Arc<S>, contenders: usize) {
    let clock = Arc::new(MockClock::frozen(base_time()));
    let lifecycle = lifecycle(Arc::clone(&storage), clock);
    let task = insert_ready(storage.as_ref(), "probe-1").await;

    let mut handles = Vec::new();
    for _ in 0..contenders {
        let lifecycle = lifecycle.clone();
        let id = task.id;
        handles.push(tokio::spawn(async move {
            lifecycle.accept(&id, &ProbeId::new("probe-1")).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => winners += 1,
            Err(LifecycleError::InconsistentState { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(winners, 1);
}

async fn wrong_owner_and_missing<S: TaskStore>(storage: Arc<S>) {
    let clock = Arc::new(MockClock::frozen(base_time()));
    let lifecycle = lifecycle(Arc::clone(&storage), clock);
    let task = insert_ready(storage.as_ref(), "probe-1").await;
    let intruder = ProbeId::new("probe-2");

    assert!(matches!(
        lifecycle.get_task(&task.id, &intruder).await,
        Err(LifecycleError::AccessDenied(_))
    ));
    assert!(matches!(
        lifecycle.accept(&task.id, &intruder).await,
        Err(LifecycleError::AccessDenied(_))
    ));
    assert!(matches!(
        lifecycle.accept(&probe_scheduler::TaskId::new(), &intruder).await,
        Err(LifecycleError::TaskNotFound(_))
    ));
    assert_eq!(
        storage.get_task(&task.id).await.unwrap().unwrap().state,
        TaskState::Ready
    );
}

async fn since_filter<S: TaskStore>(storage: Arc<S>) {
    let clock = Arc::new(MockClock::frozen(base_time()));
    let lifecycle = lifecycle(Arc::clone(&storage), clock);
    let me = ProbeId::new("probe-1");

    let old = Task::new(me.clone(), "ndt", json!({}), base_time() - TimeDelta::hours(2));
    storage.insert_task(&old).await.unwrap();
    let at_boundary = Task::new(me.clone(), "ndt", json!({}), base_time() - TimeDelta::hours(1));
    storage.insert_task(&at_boundary).await.unwrap();
    let fresh = insert_ready(storage.as_ref(), "probe-1").await;
    let accepted = insert_ready(storage.as_ref(), "probe-1").await;
    lifecycle.accept(&accepted.id, &me).await.unwrap();

    let since = base_time() - TimeDelta::hours(1);
    let tasks = lifecycle.get_tasks_for_user(&me, since).await.unwrap();
    let mut ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
    ids.sort_by_key(|id| id.to_string());
    let mut expected = vec![at_boundary.id, fresh.id];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(ids, expected);
    assert!(
        tasks
            .iter()
            .all(|t| t.state == TaskState::Ready && t.creation_time >= since)
    );
}

async fn sqlite_storage() -> (Arc<SqliteStorage>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::new(dir.path().join("lifecycle.db"))
        .await
        .unwrap();
    (Arc::new(storage), dir)
}

/// Test: ready → accept → accept (inconsistent) → done → reject (inconsistent).
#[tokio::test]
async fn test_lifecycle_walk_in_memory() {
    accept_accept_done_reject(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn test_lifecycle_walk_sqlite() {
    let (storage, _dir) = sqlite_storage().await;
    accept_accept_done_reject(storage).await;
}

/// Test: N concurrent accepts on one task produce exactly one winner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_in_memory() {
    concurrent_accepts(Arc::new(InMemoryStorage::new()), 64).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_sqlite() {
    let (storage, _dir) = sqlite_storage().await;
    concurrent_accepts(storage, 16).await;
}

/// Test: Mixed accept/reject races never leave a task in an impossible state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_races_in_memory() {
    mixed_races(Arc::new(InMemoryStorage::new()), 32).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_races_sqlite() {
    let (storage, _dir) = sqlite_storage().await;
    mixed_races(storage, 16).await;
}

/// Test: Another probe can neither read nor move the task.
#[tokio::test]
async fn test_wrong_owner_in_memory() {
    wrong_owner_and_missing(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn test_wrong_owner_sqlite() {
    let (storage, _dir) = sqlite_storage().await;
    wrong_owner_and_missing(storage).await;
}

/// Test: The probe listing only returns ready tasks at or after `since`.
#[tokio::test]
async fn test_since_filter_in_memory() {
    since_filter(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test]
async fn test_since_filter_sqlite() {
    let (storage, _dir) = sqlite_storage().await;
    since_filter(storage).await;
}
