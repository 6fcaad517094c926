//! Agent abstraction for the untrusted step of an attempt.
//!
//! The [`AgentRunner`] trait decouples the orchestrator from whatever populates
//! the evidence directory. Tests pass closures; the CLI uses [`CommandAgent`],
//! which runs an external command and captures the tier's evidence itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::job_spec::{EvidenceTier, JobSpec};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::evidence::compute_manifest;
use crate::io::git::Git;
use crate::io::layout::EVIDENCE_DIRNAME;
use crate::io::process::{CommandOutput, ProcessRequest, run_with_timeout};

pub const ENV_ATTEMPT_DIR: &str = "GATEKEEPER_ATTEMPT_DIR";
pub const ENV_EVIDENCE_DIR: &str = "GATEKEEPER_EVIDENCE_DIR";
pub const ENV_RUN_ID: &str = "GATEKEEPER_RUN_ID";

/// Invoked exactly once per attempt. Expected to populate
/// `attempt_dir/evidence/` for the job's tier before returning.
pub trait AgentRunner {
    fn run(&self, attempt_dir: &Path, job_spec: &JobSpec) -> Result<()>;
}

impl<F> AgentRunner for F
where
    F: Fn(&Path, &JobSpec) -> Result<()>,
{
    fn run(&self, attempt_dir: &Path, job_spec: &JobSpec) -> Result<()> {
        self(attempt_dir, job_spec)
    }
}

/// Runs an external command in the workspace and records its evidence.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    pub workspace_root: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Serialize)]
struct AgentMeta<'a> {
    run_id: &'a str,
    mission_kind: &'a str,
    evidence_tier: EvidenceTier,
    gate_pipeline_version: &'a str,
    program: &'a str,
    args: &'a [String],
    timed_out: bool,
    stdout_truncated_bytes: usize,
    stderr_truncated_bytes: usize,
}

#[derive(Debug, Serialize)]
struct CommandLine<'a> {
    cmd: String,
    exit_code: i32,
    workdir: &'a str,
}

impl CommandAgent {
    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn write_evidence(
        &self,
        evidence_root: &Path,
        job_spec: &JobSpec,
        output: &CommandOutput,
    ) -> Result<()> {
        let tier = job_spec.evidence_tier();
        let meta = AgentMeta {
            run_id: job_spec.run_id(),
            mission_kind: job_spec.mission_kind(),
            evidence_tier: tier,
            gate_pipeline_version: job_spec.gate_pipeline_version(),
            program: &self.program,
            args: &self.args,
            timed_out: output.timed_out,
            stdout_truncated_bytes: output.stdout_truncated,
            stderr_truncated_bytes: output.stderr_truncated,
        };
        write_json_atomic(&evidence_root.join("meta.json"), &meta)?;
        write_atomic(
            &evidence_root.join("exitcode.txt"),
            format!("{}\n", output.exit_code()).as_bytes(),
        )?;
        let workdir = self.workspace_root.display().to_string();
        let mut line = serde_json::to_string(&CommandLine {
            cmd: self.command_line(),
            exit_code: output.exit_code(),
            workdir: &workdir,
        })
        .context("serialize command line")?;
        line.push('\n');
        write_atomic(&evidence_root.join("commands.jsonl"), line.as_bytes())?;

        if tier == EvidenceTier::Light {
            return Ok(());
        }
        let git = Git::new(&self.workspace_root);
        write_atomic(&evidence_root.join("stdout.txt"), &output.stdout)?;
        write_atomic(&evidence_root.join("stderr.txt"), &output.stderr)?;
        write_atomic(
            &evidence_root.join("git_head.txt"),
            format!("{}\n", git.head_sha()?).as_bytes(),
        )?;
        write_atomic(
            &evidence_root.join("git_status.txt"),
            git.status_porcelain_raw()?.as_bytes(),
        )?;

        if tier == EvidenceTier::Full {
            write_atomic(
                &evidence_root.join("git_diff_name_only.txt"),
                git.diff_name_only()?.as_bytes(),
            )?;
        }
        Ok(())
    }
}

impl AgentRunner for CommandAgent {
    #[instrument(skip_all, fields(program = %self.program, run_id = job_spec.run_id()))]
    fn run(&self, attempt_dir: &Path, job_spec: &JobSpec) -> Result<()> {
        let evidence_root = attempt_dir.join(EVIDENCE_DIRNAME);
        fs::create_dir_all(&evidence_root)
            .with_context(|| format!("create evidence dir {}", evidence_root.display()))?;

        let env = vec![
            (ENV_ATTEMPT_DIR.to_string(), attempt_dir.display().to_string()),
            (ENV_EVIDENCE_DIR.to_string(), evidence_root.display().to_string()),
            (ENV_RUN_ID.to_string(), job_spec.run_id().to_string()),
        ];
        info!(command = %self.command_line(), "running agent command");
        let output = run_with_timeout(&ProcessRequest {
            program: &self.program,
            args: &self.args,
            workdir: &self.workspace_root,
            env: &env,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })?;

        self.write_evidence(&evidence_root, job_spec, &output)?;
        compute_manifest(&evidence_root)?;

        // Evidence is captured either way; the exit status is reported to the
        // orchestrator as an agent error.
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent command timed out");
            return Err(anyhow!(
                "agent command timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "agent command exited with {}: {}",
                output.exit_code(),
                output.error_text()
            ));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::evidence::verify_manifest;
    use crate::test_support::{TestRepo, sample_job_spec};

    fn agent(repo: &TestRepo, script: &str) -> CommandAgent {
        CommandAgent {
            workspace_root: repo.path().to_path_buf(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(10),
            output_limit_bytes: 4096,
        }
    }

    #[test]
    fn closures_are_agent_runners() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sample_job_spec("run-1", EvidenceTier::Light);
        let runner = |dir: &Path, job: &JobSpec| -> Result<()> {
            fs::write(dir.join("seen.txt"), job.run_id())?;
            Ok(())
        };
        runner.run(temp.path(), &spec).expect("run");
        assert_eq!(
            fs::read_to_string(temp.path().join("seen.txt")).expect("read"),
            "run-1"
        );
    }

    #[test]
    fn light_tier_writes_minimal_evidence_and_manifest() {
        let repo = TestRepo::new().expect("repo");
        let attempt_dir = repo.path().join("artifacts/validation_runs/run-1/attempt-0001");
        let spec = sample_job_spec("run-1", EvidenceTier::Light);

        agent(&repo, "echo \"$GATEKEEPER_RUN_ID\" > \"$GATEKEEPER_EVIDENCE_DIR/agent.txt\"")
            .run(&attempt_dir, &spec)
            .expect("run");

        let evidence = attempt_dir.join(EVIDENCE_DIRNAME);
        assert_eq!(
            fs::read_to_string(evidence.join("exitcode.txt")).expect("exitcode"),
            "0\n"
        );
        assert_eq!(
            fs::read_to_string(evidence.join("agent.txt")).expect("agent"),
            "run-1\n"
        );
        assert!(!evidence.join("stdout.txt").exists());
        let manifest = verify_manifest(&evidence).expect("verify");
        assert_eq!(manifest.files.len(), 4);
    }

    #[test]
    fn full_tier_captures_git_state() {
        let repo = TestRepo::new().expect("repo");
        let attempt_dir = repo.path().join("artifacts/validation_runs/run-1/attempt-0001");
        let spec = sample_job_spec("run-1", EvidenceTier::Full);

        agent(&repo, "echo hello").run(&attempt_dir, &spec).expect("run");

        let evidence = attempt_dir.join(EVIDENCE_DIRNAME);
        assert_eq!(
            fs::read_to_string(evidence.join("stdout.txt")).expect("stdout"),
            "hello\n"
        );
        let head = fs::read_to_string(evidence.join("git_head.txt")).expect("head");
        assert_eq!(head.trim().len(), 40);
        assert!(evidence.join("git_status.txt").exists());
        assert!(evidence.join("git_diff_name_only.txt").exists());
        verify_manifest(&evidence).expect("verify");
    }

    #[test]
    fn failing_command_still_records_evidence() {
        let repo = TestRepo::new().expect("repo");
        let attempt_dir = repo.path().join("artifacts/validation_runs/run-1/attempt-0001");
        let spec = sample_job_spec("run-1", EvidenceTier::Light);

        let err = agent(&repo, "echo broken >&2; exit 7")
            .run(&attempt_dir, &spec)
            .unwrap_err();
        assert!(format!("{err:#}").contains("exited with 7: broken"));
        assert_eq!(
            fs::read_to_string(attempt_dir.join("evidence/exitcode.txt")).expect("exitcode"),
            "7\n"
        );
    }
}
