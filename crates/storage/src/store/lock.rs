#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::error::StoreError;
use super::now_ms;

pub const LOCK_FILE_NAME: &str = "taskledger.lock";

const LOCK_RECORD_VERSION: i64 = 1;
const BACKOFF_START_MS: u64 = 25;
const BACKOFF_CAP_MS: u64 = 500;

/// What a blocked caller learns about the holder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub hostname: String,
    pub started_at_ms: i64,
    pub command: String,
    pub version: i64,
}

/// Advisory exclusive lock for multi-step maintenance (rebuilds, pruning,
/// migrations). Single commands do not take it; their transactions are the
/// unit of isolation.
#[derive(Clone, Debug)]
pub struct DatabaseLock {
    path: PathBuf,
    command: String,
}

impl DatabaseLock {
    pub fn new(storage_dir: impl AsRef<Path>, command: impl Into<String>) -> Self {
        Self {
            path: storage_dir.as_ref().join(LOCK_FILE_NAME),
            command: command.into(),
        }
    }

    /// Blocks up to `timeout` with capped exponential backoff. A lock file
    /// whose recorded pid is dead on this host is cleared and retaken; a
    /// live holder surfaces as `LockHeld` with its identity.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut backoff_ms = BACKOFF_START_MS;
        loop {
            match self.try_take() {
                Ok(guard) => return Ok(guard),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = self.read_holder();
                    if let Some(record) = &holder
                        && record.hostname == local_hostname()
                        && !process_alive(record.pid)
                    {
                        // Holder died without releasing; clear and retry now.
                        let _ = std::fs::remove_file(&self.path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockHeld {
                            pid: holder.as_ref().map(|r| r.pid),
                            command: holder.as_ref().map(|r| r.command.clone()),
                            age_ms: holder.as_ref().map(|r| now_ms() - r.started_at_ms),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn try_take(&self) -> Result<LockGuard, std::io::Error> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let record = LockRecord {
            pid: std::process::id(),
            hostname: local_hostname(),
            started_at_ms: now_ms(),
            command: self.command.clone(),
            version: LOCK_RECORD_VERSION,
        };
        let body = serde_json::to_string(&record).map_err(std::io::Error::other)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        Ok(LockGuard {
            path: self.path.clone(),
            released: false,
        })
    }

    fn read_holder(&self) -> Option<LockRecord> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Current holder, if any. Informational only; the answer can be stale
    /// by the time the caller looks at it.
    pub fn holder(&self) -> Option<LockRecord> {
        self.read_holder()
    }
}

#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return true;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Alive but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; treat the holder as alive and wait it out.
    true
}

#[cfg(unix)]
fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(unix))]
fn local_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
