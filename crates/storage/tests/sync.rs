#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use tl_core::model::TaskStatus;
use tl_storage::{
    ActorContext, ConflictStrategy, CreateTaskRequest, EventEnvelope, ReplicaTransport,
    SqliteStore, StoreError, SyncFrame, SyncMode, SyncPolicy, TransportError,
};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("taskledger_{name}_{}_{nonce}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// In-memory replica: pushes accumulate, pulls page past a numeric cursor.
#[derive(Clone, Default)]
struct FakeReplica {
    pushed: Arc<Mutex<Vec<EventEnvelope>>>,
    serve: Arc<Mutex<Vec<EventEnvelope>>>,
    down: Arc<Mutex<bool>>,
}

impl ReplicaTransport for FakeReplica {
    fn push_events(&mut self, events: &[EventEnvelope]) -> Result<(), TransportError> {
        if *self.down.lock().expect("lock") {
            return Err(TransportError::Unavailable("replica down".to_string()));
        }
        self.pushed.lock().expect("lock").extend_from_slice(events);
        Ok(())
    }

    fn pull_events(&mut self, cursor: Option<&str>) -> Result<SyncFrame, TransportError> {
        if *self.down.lock().expect("lock") {
            return Err(TransportError::Timeout);
        }
        let serve = self.serve.lock().expect("lock");
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let events: Vec<EventEnvelope> = serve.get(start..).unwrap_or_default().to_vec();
        if events.is_empty() {
            Ok(SyncFrame::default())
        } else {
            Ok(SyncFrame {
                events,
                next_cursor: Some(serve.len().to_string()),
            })
        }
    }
}

fn seeded_store(name: &str, titles: &[&str]) -> SqliteStore {
    let mut store = SqliteStore::open(temp_dir(name)).expect("open store");
    store
        .create_project("default", ActorContext::default())
        .expect("create project");
    for title in titles {
        let mut request = CreateTaskRequest::new(*title, "default");
        request.initial_status = Some(TaskStatus::Ready);
        store.create_task(request).expect("create task");
    }
    store
}

#[test]
fn merge_replicates_one_store_into_another() {
    let mut origin = seeded_store("merge_origin", &["alpha", "beta"]);
    let replica = FakeReplica::default();

    let mut policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Merge,
        Box::new(replica.clone()),
    );
    let report = policy.sync(&mut origin).expect("sync origin");
    assert!(report.attempted && report.success, "report: {report:?}");
    assert_eq!(report.pushed, 3, "project event plus two task events");
    assert_eq!(origin.unsynced_event_count().expect("unsynced"), 0);

    // Mirror: what origin pushed is what the follower pulls.
    let follower_side = FakeReplica {
        serve: replica.pushed.clone(),
        ..FakeReplica::default()
    };
    let mut follower = SqliteStore::open(temp_dir("merge_follower")).expect("open follower");
    let mut follower_policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Merge,
        Box::new(follower_side),
    );
    let report = follower_policy.sync(&mut follower).expect("sync follower");
    assert_eq!(report.pulled, 3);

    let tasks = follower.list_tasks(None, None).expect("tasks");
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Ready));
    assert_eq!(follower.list_projects().expect("projects").len(), 1);

    // Replayed pulls are no-ops.
    let report = follower_policy.sync(&mut follower).expect("second sync");
    assert!(report.success);
    assert_eq!(report.pulled, 0);
}

#[test]
fn discard_local_moves_the_watermark_without_pushing() {
    let mut store = seeded_store("discard_local", &["only-here"]);
    let replica = FakeReplica::default();
    let mut policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::DiscardLocal,
        Box::new(replica.clone()),
    );

    let report = policy.sync(&mut store).expect("sync");
    assert!(report.success);
    assert_eq!(report.pushed, 0);
    assert!(replica.pushed.lock().expect("lock").is_empty());
    assert_eq!(store.unsynced_event_count().expect("unsynced"), 0);
    // The local log itself is untouched.
    assert_eq!(store.max_event_seq().expect("seq"), 2);
}

#[test]
fn fail_strategy_refuses_while_local_events_are_unpushed() {
    let mut store = seeded_store("fail_strategy", &["local-work"]);
    let mut policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Fail,
        Box::new(FakeReplica::default()),
    );

    let report = policy.sync(&mut store).expect("sync returns a report");
    assert!(report.attempted);
    assert!(!report.success);
    assert!(
        report.error.as_deref().is_some_and(|e| e.contains("2")),
        "error names the unpushed count: {report:?}"
    );
}

#[test]
fn transport_failures_degrade_to_a_failed_report() {
    let mut store = seeded_store("transport_down", &["queued-offline"]);
    let replica = FakeReplica::default();
    *replica.down.lock().expect("lock") = true;

    let mut policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Merge,
        Box::new(replica.clone()),
    );
    let report = policy.sync(&mut store).expect("never a hard error");
    assert!(report.attempted && !report.success);
    assert!(report.error.is_some());

    // The store keeps working offline and syncs once the replica is back.
    store
        .create_task({
            let mut r = CreateTaskRequest::new("more-offline-work", "default");
            r.initial_status = Some(TaskStatus::Ready);
            r
        })
        .expect("writes still work");
    *replica.down.lock().expect("lock") = false;
    let report = policy.sync(&mut store).expect("sync after recovery");
    assert!(report.success);
    assert_eq!(report.pushed, 3);
}

#[test]
fn strict_reads_fail_when_the_replica_is_unreachable() {
    let mut store = seeded_store("strict_read", &[]);
    let replica = FakeReplica::default();
    *replica.down.lock().expect("lock") = true;

    let mut policy = SyncPolicy::new(
        SyncMode::Strict,
        ConflictStrategy::Merge,
        Box::new(replica),
    );
    let err = policy
        .before_read(&mut store)
        .expect_err("strict mode surfaces the failure");
    assert!(matches!(err, StoreError::SyncFailed(_)), "got {err}");
}

#[test]
fn the_rate_cap_skips_excess_attempts() {
    let mut store = seeded_store("rate_cap", &[]);
    let mut policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Merge,
        Box::new(FakeReplica::default()),
    )
    .with_rate_limit(2);

    assert!(policy.sync(&mut store).expect("first").attempted);
    assert!(policy.sync(&mut store).expect("second").attempted);
    let third = policy.sync(&mut store).expect("third");
    assert!(!third.attempted, "capped: {third:?}");
    assert!(
        third.error.as_deref().is_some_and(|e| e.contains("rate cap")),
        "a capped skip is distinguishable from a no-op: {third:?}"
    );
}

#[test]
fn opportunistic_reads_sync_stale_data_despite_the_write_interval() {
    let mut origin = seeded_store("opportunistic_origin", &["remote-work"]);
    let replica = FakeReplica::default();
    let mut origin_policy = SyncPolicy::new(
        SyncMode::Manual,
        ConflictStrategy::Merge,
        Box::new(replica.clone()),
    );
    assert!(origin_policy.sync(&mut origin).expect("push origin").success);

    let mut follower =
        SqliteStore::open(temp_dir("opportunistic_follower")).expect("open follower");
    let follower_side = FakeReplica {
        serve: replica.pushed.clone(),
        ..FakeReplica::default()
    };
    // The inter-sync interval paces writes only; a never-synced read is
    // stale and must sync even with an hour-long interval.
    let mut policy = SyncPolicy::new(
        SyncMode::Opportunistic {
            staleness_ms: 1,
            min_interval_ms: 3_600_000,
            failure_cooldown_ms: 0,
        },
        ConflictStrategy::Merge,
        Box::new(follower_side),
    );
    policy.before_read(&mut follower).expect("before_read");

    let tasks = follower.list_tasks(None, None).expect("tasks");
    assert_eq!(tasks.len(), 1, "stale read pulled the remote events");
    assert_eq!(tasks[0].title, "remote-work");
}
