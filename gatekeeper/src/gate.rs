//! Preflight and postflight gates for a single attempt.
//!
//! A failed gate always leaves a `validator_report.json` behind; a passed
//! postflight leaves an `acceptance_token.json`. Failures that carry no code
//! are reported as `VALIDATOR_CRASH` rather than returned as errors, so the
//! caller only sees `Err` when an artifact itself cannot be written.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::codes::{Code, Gate, NextAction};
use crate::core::job_spec::{AttemptContext, JobSpec};
use crate::core::remote_op::timestamp;
use crate::core::report::{
    ACCEPTANCE_TOKEN_SCHEMA_VERSION, AcceptanceToken, CheckResult, Provenance, ValidationReport,
};
use crate::error::{GateError, gate_error};
use crate::io::atomic::write_json_atomic;
use crate::io::cleanliness::{verify_output_roots_ignored, verify_repo_clean};
use crate::io::digest::sha256_file;
use crate::io::evidence::{enforce_evidence_tier, verify_manifest};
use crate::io::job_spec_store::load_job_spec;
use crate::io::layout::AttemptPaths;

/// Recorded in every token's provenance.
pub const MINTED_BY: &str = "gatekeeper::gate";

pub const CHECK_JOB_SPEC: &str = "job_spec";
pub const CHECK_JOB_SPEC_INTEGRITY: &str = "job_spec_integrity";
pub const CHECK_REPO_CLEAN_PRE: &str = "repo_clean_pre";
pub const CHECK_EVIDENCE_ROOT_IGNORE: &str = "evidence_root_ignore";
pub const CHECK_EVIDENCE: &str = "evidence";
pub const CHECK_REPO_CLEAN_POST: &str = "repo_clean_post";
pub const CHECK_RECEIPT_REQUIRED: &str = "receipt_required";
pub const CHECK_ACCEPTANCE_TOKEN: &str = "acceptance_token";

/// Result of running one gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// `token_path` is set only by postflight.
    Passed { token_path: Option<PathBuf> },
    Failed(GateFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    pub gate: Gate,
    pub check: String,
    pub code: Code,
    pub message: String,
    pub next_action: NextAction,
    pub report_path: PathBuf,
}

pub struct PreflightRequest<'a> {
    pub workspace_root: &'a Path,
    pub paths: &'a AttemptPaths,
    pub context: &'a AttemptContext,
}

pub struct PostflightRequest<'a> {
    pub workspace_root: &'a Path,
    pub paths: &'a AttemptPaths,
    pub context: &'a AttemptContext,
    pub receipt_required: bool,
    /// Digest of the job spec the orchestrator wrote, when known.
    pub expected_job_spec_sha256: Option<&'a str>,
    /// Stamped into the token as `created_at`.
    pub now: DateTime<Utc>,
}

/// A check that did not pass, before it is turned into a report.
struct FailedCheck {
    name: &'static str,
    error: anyhow::Error,
}

fn check<T>(name: &'static str, result: Result<T>) -> Result<T, FailedCheck> {
    result.map_err(|error| FailedCheck { name, error })
}

/// Job spec, clean worktree, ignored output roots. Nothing is retried here.
#[instrument(skip_all, fields(attempt_id = %request.context.attempt_id))]
pub fn run_preflight(request: &PreflightRequest<'_>) -> Result<GateOutcome> {
    match preflight_checks(request) {
        Ok(()) => {
            info!("preflight passed");
            Ok(GateOutcome::Passed { token_path: None })
        }
        Err(failed) => fail(Gate::Preflight, failed, request.paths, request.context),
    }
}

fn preflight_checks(request: &PreflightRequest<'_>) -> Result<(), FailedCheck> {
    let paths = request.paths;
    check(CHECK_JOB_SPEC, load_job_spec(&paths.job_spec_path))?;
    check(
        CHECK_REPO_CLEAN_PRE,
        verify_repo_clean(request.workspace_root, Code::DirtyRepoPre),
    )?;
    // Directory-only ignore rules only match paths that exist as directories.
    check(
        CHECK_EVIDENCE_ROOT_IGNORE,
        fs::create_dir_all(&paths.evidence_root)
            .with_context(|| format!("create evidence root {}", paths.evidence_root.display()))
            .and_then(|()| verify_output_roots_ignored(request.workspace_root, &paths.evidence_root)),
    )?;
    Ok(())
}

/// Evidence, cleanliness and receipt checks; mints the token on success.
#[instrument(skip_all, fields(attempt_id = %request.context.attempt_id))]
pub fn run_postflight(request: &PostflightRequest<'_>) -> Result<GateOutcome> {
    match postflight_checks(request) {
        Ok(token_path) => {
            info!(token = %token_path.display(), "postflight passed, token minted");
            Ok(GateOutcome::Passed {
                token_path: Some(token_path),
            })
        }
        Err(failed) => fail(Gate::Postflight, failed, request.paths, request.context),
    }
}

fn postflight_checks(request: &PostflightRequest<'_>) -> Result<PathBuf, FailedCheck> {
    let paths = request.paths;
    if let Some(expected) = request.expected_job_spec_sha256 {
        check(
            CHECK_JOB_SPEC_INTEGRITY,
            verify_job_spec_digest(&paths.job_spec_path, expected),
        )?;
    }
    let job_spec = check(CHECK_JOB_SPEC, load_job_spec(&paths.job_spec_path))?;
    check(
        CHECK_EVIDENCE,
        enforce_evidence_tier(&paths.evidence_root, job_spec.evidence_tier(), &[])
            .and_then(|()| verify_manifest(&paths.evidence_root).map(drop)),
    )?;
    check(
        CHECK_REPO_CLEAN_POST,
        verify_repo_clean(request.workspace_root, Code::DirtyRepoPost),
    )?;

    let receipt_exists = paths.receipt_path.is_file();
    if request.receipt_required && !receipt_exists {
        return Err(FailedCheck {
            name: CHECK_RECEIPT_REQUIRED,
            error: GateError::new(
                Code::EvidenceMissingRequiredFile,
                format!("receipt is required but missing: {}", paths.receipt_path.display()),
            )
            .with_next_action(NextAction::RegenerateReceipt)
            .into(),
        });
    }

    check(
        CHECK_ACCEPTANCE_TOKEN,
        mint_token(&job_spec, request, receipt_exists),
    )
}

fn verify_job_spec_digest(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path).map_err(|err| {
        GateError::new(
            Code::JobSpecTampered,
            format!("cannot hash {}: {err:#}", path.display()),
        )
    })?;
    if actual != expected {
        return Err(GateError::new(
            Code::JobSpecTampered,
            format!("job_spec.json changed during the attempt: expected {expected}, got {actual}"),
        )
        .into());
    }
    Ok(())
}

fn mint_token(
    job_spec: &JobSpec,
    request: &PostflightRequest<'_>,
    receipt_exists: bool,
) -> Result<PathBuf> {
    let paths = request.paths;
    let receipt_sha256 = if receipt_exists {
        Some(sha256_file(&paths.receipt_path)?)
    } else {
        None
    };
    let pointers = paths.pointers();
    let token = AcceptanceToken {
        schema_version: ACCEPTANCE_TOKEN_SCHEMA_VERSION.to_string(),
        passed: true,
        run_id: job_spec.run_id().to_string(),
        attempt_id: request.context.attempt_id.clone(),
        attempt_index: request.context.attempt_index,
        gate_pipeline_version: job_spec.gate_pipeline_version().to_string(),
        evidence_manifest_sha256: sha256_file(&paths.manifest_path)?,
        receipt_sha256,
        created_at: timestamp(request.now),
        provenance: Provenance {
            minted_by: MINTED_BY.to_string(),
            attempt_dir: pointers.attempt_dir,
            evidence_root: pointers.evidence_root,
            manifest_path: pointers.manifest_path,
            receipt_path: pointers.receipt_path,
        },
    };
    write_json_atomic(&paths.token_path, &token)?;
    Ok(paths.token_path.clone())
}

fn fail(
    gate: Gate,
    failed: FailedCheck,
    paths: &AttemptPaths,
    context: &AttemptContext,
) -> Result<GateOutcome> {
    let (code, message, next_action) = match gate_error(&failed.error) {
        Some(err) => (err.code, err.message.clone(), err.next_action()),
        None => {
            let code = Code::ValidatorCrash;
            (
                code,
                format!("{:#}", failed.error),
                code.spec().default_next_action,
            )
        }
    };
    warn!(gate = %gate, check = failed.name, code = %code, "gate failed");

    let report = ValidationReport::failure(
        gate,
        code,
        message.clone(),
        Some(next_action),
        vec![CheckResult::failed(failed.name, code, message.clone())],
        context.clone(),
        paths.pointers(),
    );
    write_json_atomic(&paths.report_path, &report)?;
    Ok(GateOutcome::Failed(GateFailure {
        gate,
        check: failed.name.to_string(),
        code,
        message,
        next_action,
        report_path: paths.report_path.clone(),
    }))
}
