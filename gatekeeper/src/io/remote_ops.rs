//! Non-blocking remote housekeeping queue (e.g. deleting a pushed branch).
//!
//! Nothing here fails the caller. Command errors become queue state, and
//! persistence errors are logged and surfaced on the result.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::job_spec::validate_path_component;
use crate::core::remote_op::{
    CommandOutcome, OP_TYPE_DELETE_REMOTE_BRANCH, RemoteOp, RemoteOpStatus, apply_outcome,
    op_id_for, timestamp, upsert,
};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::layout::RunPaths;
use crate::io::process::{ProcessRequest, TIMEOUT_EXIT_CODE, run_with_timeout};

pub const REMOTE_OPS_REPORT_SCHEMA_VERSION: &str = "remote_ops_report_v1";
pub const RETENTION_DAYS_DEFAULT: u32 = 30;
pub const MANUAL_ID: &str = "manual";

const REMOTE_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Runs the external side of a remote op.
pub trait RemoteCommand {
    fn delete_branch(&self, workdir: &Path, branch: &str) -> CommandOutcome;
}

/// `git push <remote> --delete <branch>` with a timeout.
#[derive(Debug, Clone)]
pub struct GitRemote {
    remote: String,
    timeout: Duration,
}

impl GitRemote {
    pub fn new(remote: impl Into<String>, timeout: Duration) -> Self {
        Self {
            remote: remote.into(),
            timeout,
        }
    }
}

impl RemoteCommand for GitRemote {
    fn delete_branch(&self, workdir: &Path, branch: &str) -> CommandOutcome {
        let args = vec![
            "push".to_string(),
            self.remote.clone(),
            "--delete".to_string(),
            branch.to_string(),
        ];
        let output = run_with_timeout(&ProcessRequest {
            program: "git",
            args: &args,
            workdir,
            env: &[],
            timeout: self.timeout,
            output_limit_bytes: REMOTE_OUTPUT_LIMIT_BYTES,
        });
        match output {
            Ok(output) if output.timed_out => CommandOutcome {
                exit_code: TIMEOUT_EXIT_CODE,
                error_text: format!(
                    "git push {} --delete timed out after {}s",
                    self.remote,
                    self.timeout.as_secs()
                ),
            },
            Ok(output) => CommandOutcome {
                exit_code: output.exit_code(),
                error_text: output.error_text(),
            },
            Err(err) => CommandOutcome {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                error_text: format!("{err:#}"),
            },
        }
    }
}

pub struct DeleteRemoteBranchRequest<'a> {
    pub workspace_root: &'a Path,
    pub branch: &'a str,
    pub run_id: &'a str,
    pub attempt_id: &'a str,
    pub now: DateTime<Utc>,
    pub command: &'a dyn RemoteCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteOpsResult {
    /// Always true: remote ops never block the caller.
    pub ok_non_blocking: bool,
    pub status: RemoteOpStatus,
    pub blocked_reason: Option<String>,
    pub needs_escalation: bool,
    pub report_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOpsReport {
    pub schema_version: String,
    pub run_id: String,
    pub attempt_id: String,
    pub generated_at: String,
    pub retention_days: u32,
    pub blocked_reason: Option<String>,
    pub needs_escalation: bool,
    pub attempted_op: RemoteOp,
    pub ops: Vec<RemoteOp>,
}

/// Try to delete a remote branch once and record the outcome in the queue.
#[instrument(skip_all, fields(branch = request.branch, run_id = request.run_id))]
pub fn try_delete_remote_branch(request: &DeleteRemoteBranchRequest<'_>) -> RemoteOpsResult {
    let paths = RunPaths::new(request.workspace_root, request.run_id).attempt(request.attempt_id);
    let op_id = op_id_for(OP_TYPE_DELETE_REMOTE_BRANCH, request.branch);
    // Ids that would leave the runs root still get the remote attempt, but
    // nothing is read or written for them.
    let ids_valid = validate_path_component("run_id", request.run_id)
        .and_then(|()| validate_path_component("attempt_id", request.attempt_id));

    let mut ops = if ids_valid.is_ok() {
        load_queue(&paths.remote_ops_queue_path)
    } else {
        Vec::new()
    };
    let prior = ops
        .iter()
        .find(|op| op.op_id == op_id)
        .cloned()
        .unwrap_or_else(|| {
            RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, request.branch, request.now)
        });

    let outcome = request
        .command
        .delete_branch(request.workspace_root, request.branch);
    let (updated, blocked_reason, needs_escalation) = apply_outcome(&prior, &outcome, request.now);
    info!(
        op_id = %updated.op_id,
        attempts = updated.attempts,
        status = ?updated.status,
        "remote op attempted"
    );
    upsert(&mut ops, updated.clone());

    let report = RemoteOpsReport {
        schema_version: REMOTE_OPS_REPORT_SCHEMA_VERSION.to_string(),
        run_id: request.run_id.to_string(),
        attempt_id: request.attempt_id.to_string(),
        generated_at: timestamp(request.now),
        retention_days: RETENTION_DAYS_DEFAULT,
        blocked_reason: blocked_reason.map(str::to_string),
        needs_escalation,
        attempted_op: updated.clone(),
        ops: ops.clone(),
    };
    let persistence_error = ids_valid
        .map_err(anyhow::Error::from)
        .and_then(|()| write_queue(&paths.remote_ops_queue_path, &ops))
        .and_then(|()| write_json_atomic(&paths.remote_ops_report_path, &report))
        .err()
        .map(|err| {
            warn!(err = %format!("{err:#}"), "failed to persist remote ops state");
            format!("{err:#}")
        });

    RemoteOpsResult {
        ok_non_blocking: true,
        status: updated.status,
        blocked_reason: blocked_reason.map(str::to_string),
        needs_escalation,
        report_path: paths.remote_ops_report_path,
        persistence_error,
    }
}

/// Load the queue sorted by `op_id`. Unreadable lines are skipped.
pub fn load_queue(queue_path: &Path) -> Vec<RemoteOp> {
    let raw = match fs::read_to_string(queue_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(err = %err, path = %queue_path.display(), "cannot read remote ops queue");
            return Vec::new();
        }
    };
    let mut ops = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<RemoteOp>(line) {
            Ok(op) => ops.push(op),
            Err(err) => warn!(err = %err, "skipping malformed remote ops queue line"),
        }
    }
    ops.sort_by(|a, b| a.op_id.cmp(&b.op_id));
    ops
}

fn write_queue(queue_path: &Path, ops: &[RemoteOp]) -> Result<()> {
    let mut buf = String::new();
    for op in ops {
        buf.push_str(&serde_json::to_string(op).context("serialize remote op")?);
        buf.push('\n');
    }
    write_atomic(queue_path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRemote;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).single().expect("valid time")
    }

    fn request<'a>(
        root: &'a Path,
        branch: &'a str,
        command: &'a dyn RemoteCommand,
    ) -> DeleteRemoteBranchRequest<'a> {
        DeleteRemoteBranchRequest {
            workspace_root: root,
            branch,
            run_id: MANUAL_ID,
            attempt_id: MANUAL_ID,
            now: fixed_now(),
            command,
        }
    }

    #[test]
    fn dns_failure_is_deferred_and_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = ScriptedRemote::failing(128, "ssh: Could not resolve hostname github.com", 1);

        let result = try_delete_remote_branch(&request(temp.path(), "feature/x", &remote));
        assert!(result.ok_non_blocking);
        assert_eq!(result.status, RemoteOpStatus::Deferred);
        assert_eq!(
            result.blocked_reason.as_deref(),
            Some("dns_or_name_resolution_failure")
        );
        assert!(!result.needs_escalation);
        assert_eq!(result.persistence_error, None);

        let raw = fs::read_to_string(&result.report_path).expect("report");
        let report: RemoteOpsReport = serde_json::from_str(&raw).expect("parse report");
        assert_eq!(report.schema_version, REMOTE_OPS_REPORT_SCHEMA_VERSION);
        assert_eq!(report.retention_days, 30);
        assert_eq!(
            report.attempted_op.next_attempt_at.as_deref(),
            Some("2026-02-10T12:05:00+00:00")
        );
        assert!(
            result
                .report_path
                .ends_with("artifacts/validation_runs/manual/manual/remote_ops_report.json")
        );
    }

    #[test]
    fn repeated_dns_failures_back_off_to_a_day() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = ScriptedRemote::failing(128, "Temporary failure in name resolution", 5);

        let mut last = None;
        for _ in 0..5 {
            last = Some(try_delete_remote_branch(&request(temp.path(), "b", &remote)));
        }
        let last = last.expect("result");
        assert_eq!(last.status, RemoteOpStatus::Deferred);

        let queue = load_queue(
            &RunPaths::new(temp.path(), MANUAL_ID)
                .attempt(MANUAL_ID)
                .remote_ops_queue_path,
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].attempts, 5);
        assert_eq!(
            queue[0].next_attempt_at.as_deref(),
            Some("2026-02-11T12:00:00+00:00")
        );
    }

    #[test]
    fn four_plain_failures_escalate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = ScriptedRemote::failing(1, "error: unable to delete 'b': remote ref does not exist", 4);

        let results: Vec<RemoteOpsResult> = (0..4)
            .map(|_| try_delete_remote_branch(&request(temp.path(), "b", &remote)))
            .collect();
        let statuses: Vec<RemoteOpStatus> = results.iter().map(|r| r.status).collect();
        let escalations: Vec<bool> = results.iter().map(|r| r.needs_escalation).collect();
        assert_eq!(
            statuses,
            vec![
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Terminal,
            ]
        );
        assert_eq!(escalations, vec![false, false, false, true]);
    }

    #[test]
    fn queue_is_upserted_and_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = ScriptedRemote::succeeding(3);

        for branch in ["zeta", "alpha", "zeta"] {
            try_delete_remote_branch(&request(temp.path(), branch, &remote));
        }
        let queue_path = RunPaths::new(temp.path(), MANUAL_ID)
            .attempt(MANUAL_ID)
            .remote_ops_queue_path;
        let queue = load_queue(&queue_path);
        assert_eq!(queue.len(), 2);
        assert!(queue[0].op_id < queue[1].op_id);
        assert!(queue.iter().all(|op| op.status == RemoteOpStatus::Done));

        let raw = fs::read_to_string(&queue_path).expect("queue");
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn persistence_failure_does_not_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A file where the attempt directory should be makes every write fail.
        let runs = temp.path().join("artifacts/validation_runs/manual");
        fs::create_dir_all(&runs).expect("mkdir");
        fs::write(runs.join("manual"), "not a directory").expect("write");
        let remote = ScriptedRemote::succeeding(1);

        let result = try_delete_remote_branch(&request(temp.path(), "b", &remote));
        assert!(result.ok_non_blocking);
        assert_eq!(result.status, RemoteOpStatus::Done);
        assert!(result.persistence_error.is_some());
    }

    #[test]
    fn escaping_ids_are_not_persisted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        fs::create_dir_all(&workspace).expect("mkdir");
        let remote = ScriptedRemote::succeeding(1);
        let req = DeleteRemoteBranchRequest {
            run_id: "../../escaped",
            ..request(&workspace, "feature/x", &remote)
        };

        let result = try_delete_remote_branch(&req);
        assert!(result.ok_non_blocking);
        assert_eq!(result.status, RemoteOpStatus::Done);
        let error = result.persistence_error.expect("persistence error");
        assert!(error.contains("single path component"), "{error}");
        assert!(!workspace.join("escaped").exists());
        assert!(!workspace.join("artifacts").exists());
    }
}
