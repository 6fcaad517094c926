//! Test-only helpers: git workspaces, evidence writers, scripted remotes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::job_spec::{EvidenceTier, JobSpec, RetryCaps};
use crate::core::remote_op::CommandOutcome;
use crate::io::remote_ops::RemoteCommand;

pub const IGNORE_RULES: &str = "artifacts/validation_runs/\n";

/// A committed git repository in a temp dir that ignores the validation runs
/// root and tracks a single `tracked.txt`.
pub struct TestRepo {
    _dir: TempDir,
    root: std::path::PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        // Canonical so paths match what the orchestrator resolves.
        let root = fs::canonicalize(dir.path()).context("canonicalize temp dir")?;
        let repo = Self { _dir: dir, root };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write(".gitignore", IGNORE_RULES)?;
        repo.write("tracked.txt", "base\n")?;
        repo.commit_all("chore: init")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Stage everything and commit.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "--allow-empty", "-m", message])
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Write the files a `light` tier requires, minus the manifest.
pub fn write_light_evidence(evidence_root: &Path) -> Result<()> {
    fs::create_dir_all(evidence_root)
        .with_context(|| format!("create directory {}", evidence_root.display()))?;
    for (name, contents) in [
        ("meta.json", "{}"),
        ("exitcode.txt", "0\n"),
        ("commands.jsonl", "{\"cmd\":\"agent\"}\n"),
    ] {
        let path = evidence_root.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

/// Job spec with default caps for the given run and tier.
pub fn sample_job_spec(run_id: &str, tier: EvidenceTier) -> JobSpec {
    JobSpec::new(
        run_id,
        "build_with_validation",
        tier,
        "gates-v1",
        RetryCaps::default(),
    )
    .expect("sample job spec is valid")
}

/// Remote that replays queued outcomes, then succeeds.
pub struct ScriptedRemote {
    outcomes: RefCell<VecDeque<CommandOutcome>>,
}

impl ScriptedRemote {
    pub fn new(outcomes: Vec<CommandOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
        }
    }

    /// `times` failures with the same exit code and message.
    pub fn failing(exit_code: i32, error_text: &str, times: usize) -> Self {
        Self::new(
            (0..times)
                .map(|_| CommandOutcome {
                    exit_code,
                    error_text: error_text.to_string(),
                })
                .collect(),
        )
    }

    pub fn succeeding(times: usize) -> Self {
        Self::new(
            (0..times)
                .map(|_| CommandOutcome {
                    exit_code: 0,
                    error_text: String::new(),
                })
                .collect(),
        )
    }
}

impl RemoteCommand for ScriptedRemote {
    fn delete_branch(&self, _workdir: &Path, _branch: &str) -> CommandOutcome {
        self.outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(CommandOutcome {
                exit_code: 0,
                error_text: String::new(),
            })
    }
}
