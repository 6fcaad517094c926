//! Validation gatekeeper CLI.
//!
//! Runs an agent command through the gated attempt loop, re-verifies tokens,
//! manages evidence manifests and queues remote branch cleanup. Every command
//! prints its result as JSON on stdout and exits with the validation code of
//! the failure (0 on success, 1 for errors without a code).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use gatekeeper::acceptor::accept;
use gatekeeper::core::job_spec::EvidenceTier;
use gatekeeper::error::gate_error;
use gatekeeper::exit_codes;
use gatekeeper::io::agent::CommandAgent;
use gatekeeper::io::config::{CONFIG_FILENAME, load_config};
use gatekeeper::io::evidence::{compute_manifest, verify_manifest};
use gatekeeper::io::remote_ops::{
    DeleteRemoteBranchRequest, GitRemote, MANUAL_ID, try_delete_remote_branch,
};
use gatekeeper::logging;
use gatekeeper::orchestrator::{RunRequest, ValidationOrchestrator};

#[derive(Parser)]
#[command(
    name = "gatekeeper",
    version,
    about = "Retry-governed validation gates for untrusted build attempts"
)]
struct Cli {
    /// Workspace root (a git worktree).
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Config file. Defaults to `<workspace>/gatekeeper.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an agent command through preflight, postflight and acceptance.
    Run {
        #[arg(long)]
        mission_kind: String,

        /// Evidence tier: light, standard or full.
        #[arg(long)]
        tier: EvidenceTier,

        /// Defaults to a timestamp-and-pid id.
        #[arg(long)]
        run_id: Option<String>,

        /// Fail postflight unless the agent writes `receipt.json`.
        #[arg(long)]
        receipt_required: bool,

        /// Agent command and its arguments (after `--`).
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Re-verify an acceptance token and write its acceptance record.
    Accept { token_path: PathBuf },
    /// Compute or verify an evidence manifest.
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
    /// Try to delete a remote branch; failures are queued, never fatal.
    DeleteRemoteBranch {
        branch: String,

        #[arg(long, default_value = MANUAL_ID)]
        run_id: String,

        #[arg(long, default_value = MANUAL_ID)]
        attempt_id: String,
    },
}

#[derive(Subcommand)]
enum ManifestAction {
    /// Hash every evidence file and write `evidence_manifest.json`.
    Compute { evidence_root: PathBuf },
    /// Check the evidence root against its manifest.
    Verify { evidence_root: PathBuf },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            gate_error(&err).map_or(exit_codes::INVALID, |gate_err| gate_err.code.exit_code())
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.workspace.join(CONFIG_FILENAME));
    match cli.command {
        Command::Run {
            mission_kind,
            tier,
            run_id,
            receipt_required,
            command,
        } => cmd_run(
            &cli.workspace,
            &config_path,
            RunRequest {
                run_id,
                mission_kind,
                evidence_tier: tier,
            },
            receipt_required,
            command,
        ),
        Command::Accept { token_path } => cmd_accept(&token_path),
        Command::Manifest { action } => cmd_manifest(action),
        Command::DeleteRemoteBranch {
            branch,
            run_id,
            attempt_id,
        } => cmd_delete_remote_branch(&cli.workspace, &config_path, &branch, &run_id, &attempt_id),
    }
}

fn cmd_run(
    workspace: &Path,
    config_path: &Path,
    request: RunRequest,
    receipt_required: bool,
    command: Vec<String>,
) -> Result<i32> {
    let mut config = load_config(config_path)?;
    config.receipt_required |= receipt_required;
    let agent_config = config.agent.clone();
    let orchestrator = ValidationOrchestrator::new(workspace, config)?;

    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("missing agent command"))?;
    let agent = CommandAgent {
        workspace_root: orchestrator.workspace_root().to_path_buf(),
        program: program.clone(),
        args: args.to_vec(),
        timeout: Duration::from_secs(agent_config.timeout_secs),
        output_limit_bytes: agent_config.output_limit_bytes,
    };
    let result = orchestrator.run(&request, &agent)?;
    print_json(&result)?;
    Ok(result.exit_code())
}

fn cmd_accept(token_path: &Path) -> Result<i32> {
    let accepted = accept(token_path, Utc::now())?;
    print_json(&accepted.record)?;
    Ok(exit_codes::OK)
}

fn cmd_manifest(action: ManifestAction) -> Result<i32> {
    let manifest = match action {
        ManifestAction::Compute { evidence_root } => compute_manifest(&evidence_root)?,
        ManifestAction::Verify { evidence_root } => verify_manifest(&evidence_root)?,
    };
    print_json(&manifest)?;
    Ok(exit_codes::OK)
}

fn cmd_delete_remote_branch(
    workspace: &Path,
    config_path: &Path,
    branch: &str,
    run_id: &str,
    attempt_id: &str,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let workspace_root = fs::canonicalize(workspace)
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;
    let remote = GitRemote::new(
        config.remote_ops.remote.as_str(),
        Duration::from_secs(config.remote_ops.timeout_secs),
    );
    let result = try_delete_remote_branch(&DeleteRemoteBranchRequest {
        workspace_root: &workspace_root,
        branch,
        run_id,
        attempt_id,
        now: Utc::now(),
        command: &remote,
    });
    print_json(&result)?;
    Ok(exit_codes::OK)
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
