//! On-disk layout under `artifacts/validation_runs/`.

use std::path::{Path, PathBuf};

use crate::core::report::Pointers;

pub const VALIDATION_RUNS_DIR: &str = "artifacts/validation_runs";
pub const LOCK_FILENAME: &str = ".validator_workspace.lock";
pub const RECOVERY_LOG_FILENAME: &str = "recovery_log.jsonl";
pub const EVIDENCE_DIRNAME: &str = "evidence";
pub const MANIFEST_FILENAME: &str = "evidence_manifest.json";
pub const JOB_SPEC_FILENAME: &str = "job_spec.json";
pub const VALIDATOR_REPORT_FILENAME: &str = "validator_report.json";
pub const ACCEPTANCE_TOKEN_FILENAME: &str = "acceptance_token.json";
pub const ACCEPTANCE_RECORD_FILENAME: &str = "acceptance_record.json";
pub const RECEIPT_FILENAME: &str = "receipt.json";
pub const REMOTE_OPS_QUEUE_FILENAME: &str = "remote_ops_queue.jsonl";
pub const REMOTE_OPS_REPORT_FILENAME: &str = "remote_ops_report.json";

pub fn validation_runs_root(workspace_root: &Path) -> PathBuf {
    workspace_root.join(VALIDATION_RUNS_DIR)
}

pub fn lock_path(workspace_root: &Path) -> PathBuf {
    validation_runs_root(workspace_root).join(LOCK_FILENAME)
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub recovery_log_path: PathBuf,
}

impl RunPaths {
    pub fn new(workspace_root: &Path, run_id: &str) -> Self {
        let root = validation_runs_root(workspace_root).join(run_id);
        Self {
            recovery_log_path: root.join(RECOVERY_LOG_FILENAME),
            root,
        }
    }

    pub fn attempt(&self, attempt_id: &str) -> AttemptPaths {
        AttemptPaths::from_dir(self.root.join(attempt_id))
    }
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub evidence_root: PathBuf,
    pub manifest_path: PathBuf,
    pub job_spec_path: PathBuf,
    pub report_path: PathBuf,
    pub token_path: PathBuf,
    pub record_path: PathBuf,
    pub receipt_path: PathBuf,
    pub remote_ops_queue_path: PathBuf,
    pub remote_ops_report_path: PathBuf,
}

impl AttemptPaths {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let evidence_root = dir.join(EVIDENCE_DIRNAME);
        Self {
            manifest_path: evidence_root.join(MANIFEST_FILENAME),
            evidence_root,
            job_spec_path: dir.join(JOB_SPEC_FILENAME),
            report_path: dir.join(VALIDATOR_REPORT_FILENAME),
            token_path: dir.join(ACCEPTANCE_TOKEN_FILENAME),
            record_path: dir.join(ACCEPTANCE_RECORD_FILENAME),
            receipt_path: dir.join(RECEIPT_FILENAME),
            remote_ops_queue_path: dir.join(REMOTE_OPS_QUEUE_FILENAME),
            remote_ops_report_path: dir.join(REMOTE_OPS_REPORT_FILENAME),
            dir,
        }
    }

    pub fn pointers(&self) -> Pointers {
        Pointers {
            attempt_dir: self.dir.display().to_string(),
            evidence_root: self.evidence_root.display().to_string(),
            manifest_path: self.manifest_path.display().to_string(),
            receipt_path: self.receipt_path.display().to_string(),
        }
    }
}
