//! Cross-process workspace lock with stale-lock recovery.
//!
//! The lock is a JSON file created exclusively under the validation runs root.
//! A lock is stale only when its holder is gone *and* it is older than the TTL;
//! there is no heartbeat or lease renewal.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::codes::Code;
use crate::error::GateError;
use crate::io::layout::lock_path;

pub const WORKSPACE_LOCK_SCHEMA_VERSION: &str = "workspace_lock_v1";
pub const DEFAULT_LOCK_TTL_SECS: u64 = 900;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub schema_version: String,
    pub pid: u32,
    pub created_at_epoch: i64,
    pub run_id: String,
    pub attempt_id: String,
}

/// Proof that this process created the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLockHandle {
    pub workspace_root: PathBuf,
    pub lock_path: PathBuf,
    pub run_id: String,
    pub attempt_id: String,
}

/// Holder's view of an existing lock, read leniently.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExistingLock {
    pid: u32,
    created_at_epoch: i64,
    run_id: String,
    attempt_id: String,
}

/// Acquire the workspace lock, reclaiming it once if the current holder is stale.
///
/// A live holder (or a recent one) yields `CONCURRENT_RUN_DETECTED`.
#[instrument(skip_all, fields(run_id, attempt_id, ttl_secs))]
pub fn acquire_workspace_lock(
    workspace_root: &Path,
    run_id: &str,
    attempt_id: &str,
    ttl_secs: u64,
) -> Result<WorkspaceLockHandle> {
    let lock_path = lock_path(workspace_root);
    let parent = lock_path
        .parent()
        .with_context(|| format!("lock path missing parent {}", lock_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let now = epoch_now();
    let record = LockRecord {
        schema_version: WORKSPACE_LOCK_SCHEMA_VERSION.to_string(),
        pid: std::process::id(),
        created_at_epoch: now,
        run_id: run_id.to_string(),
        attempt_id: attempt_id.to_string(),
    };

    for _ in 0..2 {
        if create_exclusive(&lock_path, &record)? {
            debug!(lock_path = %lock_path.display(), "workspace lock acquired");
            return Ok(WorkspaceLockHandle {
                workspace_root: workspace_root.to_path_buf(),
                lock_path,
                run_id: run_id.to_string(),
                attempt_id: attempt_id.to_string(),
            });
        }

        let existing = load_existing(&lock_path, now, ttl_secs);
        let age_secs = now.saturating_sub(existing.created_at_epoch);
        let holder_alive = existing.pid != 0 && is_pid_alive(existing.pid);
        let stale = !holder_alive && age_secs > ttl_as_epoch_secs(ttl_secs);
        if stale {
            info!(
                holder_pid = existing.pid,
                holder_run_id = %existing.run_id,
                age_secs,
                "reclaiming stale workspace lock"
            );
            match fs::remove_file(&lock_path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("remove stale lock {}", lock_path.display()));
                }
            }
            continue;
        }

        warn!(
            holder_pid = existing.pid,
            holder_run_id = %existing.run_id,
            "workspace lock held by another run"
        );
        return Err(GateError::new(
            Code::ConcurrentRunDetected,
            format!(
                "Workspace lock held by pid={} run_id={} attempt_id={}",
                existing.pid, existing.run_id, existing.attempt_id
            ),
        )
        .into());
    }

    Err(GateError::new(
        Code::ConcurrentRunDetected,
        "Unable to acquire workspace lock",
    )
    .into())
}

/// Delete the lock only if it still names this handle's run.
///
/// Returns `false` (and leaves the file alone) when the lock is gone or owned
/// by another run.
#[instrument(skip_all, fields(run_id = %handle.run_id))]
pub fn release_workspace_lock(handle: &WorkspaceLockHandle) -> Result<bool> {
    let raw = match fs::read_to_string(&handle.lock_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read lock {}", handle.lock_path.display()));
        }
    };
    let owner = serde_json::from_str::<Value>(&raw)
        .ok()
        .and_then(|value| value.get("run_id").and_then(Value::as_str).map(str::to_string));
    if owner.as_deref() != Some(handle.run_id.as_str()) {
        warn!(owner = ?owner, "refusing to release lock owned by another run");
        return Ok(false);
    }
    match fs::remove_file(&handle.lock_path) {
        Ok(()) => {
            debug!("workspace lock released");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", handle.lock_path.display())),
    }
}

/// Releases the lock when dropped, covering every exit path of its owner.
#[derive(Debug)]
pub struct WorkspaceLockGuard {
    handle: Option<WorkspaceLockHandle>,
}

impl WorkspaceLockGuard {
    pub fn new(handle: WorkspaceLockHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Release now and report whether the file was removed.
    pub fn release(mut self) -> Result<bool> {
        match self.handle.take() {
            Some(handle) => release_workspace_lock(&handle),
            None => Ok(false),
        }
    }
}

impl Drop for WorkspaceLockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(err) = release_workspace_lock(&handle)
        {
            warn!(err = %err, "failed to release workspace lock");
        }
    }
}

/// Write the record to a temp file, then hard-link it into place.
///
/// The link fails if the lock exists, and a reader never sees a partial file.
fn create_exclusive(lock_path: &Path, record: &LockRecord) -> Result<bool> {
    let parent = lock_path
        .parent()
        .with_context(|| format!("lock path missing parent {}", lock_path.display()))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp lock in {}", parent.display()))?;
    let mut buf = serde_json::to_string(record).context("serialize lock record")?;
    buf.push('\n');
    temp.write_all(buf.as_bytes()).context("write temp lock")?;
    temp.as_file().sync_all().context("sync temp lock")?;

    match fs::hard_link(temp.path(), lock_path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create lock {}", lock_path.display())),
    }
}

/// Read an existing lock. Unreadable locks look ownerless and older than the TTL.
fn load_existing(lock_path: &Path, now: i64, ttl_secs: u64) -> ExistingLock {
    let value = fs::read_to_string(lock_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .filter(Value::is_object)
        .unwrap_or(Value::Null);

    let pid = value
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .unwrap_or(0);
    let created_at_epoch = value
        .get("created_at_epoch")
        .and_then(Value::as_i64)
        .filter(|epoch| *epoch > 0)
        .unwrap_or_else(|| now.saturating_sub(ttl_as_epoch_secs(ttl_secs).saturating_add(1)));
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };
    ExistingLock {
        pid,
        created_at_epoch,
        run_id: text("run_id"),
        attempt_id: text("attempt_id"),
    }
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// TTLs beyond the epoch range mean "never stale".
fn ttl_as_epoch_secs(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs).unwrap_or(i64::MAX)
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_pid_alive(pid: u32) -> bool {
    pid != 0
}
