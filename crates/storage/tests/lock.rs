#![forbid(unsafe_code)]

use std::time::Duration;

use tl_storage::{DatabaseLock, StoreError};

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

#[test]
fn acquire_release_reacquire() {
    let dir = temp_dir("lock_basic");
    let lock = DatabaseLock::new(&dir, "rebuild");
    let guard = lock.acquire(Duration::from_millis(100)).expect("first acquire");
    guard.release().expect("release");
    let guard = lock.acquire(Duration::from_millis(100)).expect("reacquire");
    drop(guard);
    lock.acquire(Duration::from_millis(100))
        .expect("drop also releases");
}

#[test]
fn a_held_lock_surfaces_the_holder() {
    let dir = temp_dir("lock_held");
    let lock = DatabaseLock::new(&dir, "prune");
    let _guard = lock.acquire(Duration::from_millis(100)).expect("acquire");

    let contender = DatabaseLock::new(&dir, "rebuild");
    let err = contender
        .acquire(Duration::from_millis(150))
        .expect_err("second acquire must time out");
    match err {
        StoreError::LockHeld { pid, command, age_ms } => {
            assert_eq!(pid, Some(std::process::id()));
            assert_eq!(command.as_deref(), Some("prune"));
            assert!(age_ms.is_some());
        }
        other => panic!("expected LockHeld, got {other}"),
    }
}

#[cfg(unix)]
#[test]
fn a_dead_holders_lock_is_cleared() {
    let dir = temp_dir("lock_stale");

    // A real pid that is certainly dead once the child has been reaped.
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn child");
    let dead_pid = child.id();
    child.wait().expect("reap child");

    let record = serde_json::json!({
        "pid": dead_pid,
        "hostname": hostname(),
        "started_at_ms": 0,
        "command": "crashed",
        "version": 1,
    });
    std::fs::write(dir.join("taskledger.lock"), record.to_string()).expect("plant stale lock");

    let lock = DatabaseLock::new(&dir, "recover");
    lock.acquire(Duration::from_millis(200))
        .expect("stale lock is cleared and retaken");
}

#[test]
fn holder_reports_the_current_record() {
    let dir = temp_dir("lock_holder");
    let lock = DatabaseLock::new(&dir, "maintenance");
    assert!(lock.holder().is_none());

    let _guard = lock.acquire(Duration::from_millis(100)).expect("acquire");
    let record = lock.holder().expect("a record exists while held");
    assert_eq!(record.pid, std::process::id());
    assert_eq!(record.command, "maintenance");
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
