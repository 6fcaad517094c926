//! Top-level driver: lock, attempt loop, retry policy, recovery log.
//!
//! ```text
//! acquire lock ── held elsewhere ──> attempt-0000 report, stop
//!      │
//!      └─> for attempt 1..=max_total:
//!            preflight ── fail ──> stop (every preflight failure is terminal)
//!            agent (exactly once, errors and panics recorded)
//!            postflight ── fail ──> evaluate_retry ── terminal ──> stop
//!                 │                       └── continue ──> next attempt
//!                 └─> acceptor ── reject ──> stop
//!                        └─> success
//! ```
//!
//! The lock guard is dropped on every path, including a panicking agent.

use std::any::Any;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::acceptor::accept;
use crate::core::attempts::{RetryState, evaluate_retry};
use crate::core::codes::{Classification, Code, Gate, NextAction};
use crate::core::job_spec::{AttemptContext, EvidenceTier, JobSpec, attempt_id_for};
use crate::core::remote_op::timestamp;
use crate::core::report::{CheckResult, ValidationReport};
use crate::error::{GateError, gate_error};
use crate::gate::{GateOutcome, PostflightRequest, PreflightRequest, run_postflight, run_preflight};
use crate::io::agent::AgentRunner;
use crate::io::atomic::write_json_atomic;
use crate::io::config::GatekeeperConfig;
use crate::io::job_spec_store::write_job_spec;
use crate::io::layout::RunPaths;
use crate::io::lock::{WorkspaceLockGuard, acquire_workspace_lock};
use crate::io::recovery_log::{
    PREFLIGHT_PASSED_CODE, PREFLIGHT_TERMINAL_POLICY, RecoveryEvent, SUCCESS_CODE,
    append_recovery_event,
};

/// Attempt id used for artifacts written before any attempt starts.
pub const BOOTSTRAP_ATTEMPT_ID: &str = "attempt-0000";
pub const CHECK_WORKSPACE_LOCK: &str = "workspace_lock";

/// What to validate. Caps, pipeline version and receipt policy come from config.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Generated from the clock and pid when absent.
    pub run_id: Option<String>,
    pub mission_kind: String,
    pub evidence_tier: EvidenceTier,
}

/// Machine-readable outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestrationResult {
    pub success: bool,
    pub run_id: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    /// The failure code; `None` on success.
    pub code: Option<Code>,
    pub message: String,
    pub terminal_reason: Option<String>,
    pub validator_report_path: Option<PathBuf>,
    pub acceptance_token_path: Option<PathBuf>,
    pub acceptance_record_path: Option<PathBuf>,
}

impl OrchestrationResult {
    /// `0` on success, otherwise the failure code's exit code.
    pub fn exit_code(&self) -> i32 {
        match (self.success, self.code) {
            (true, _) => 0,
            (false, Some(code)) => code.exit_code(),
            (false, None) => Code::ValidatorCrash.exit_code(),
        }
    }
}

/// Owns the workspace root and configuration for one process.
#[derive(Debug, Clone)]
pub struct ValidationOrchestrator {
    workspace_root: PathBuf,
    config: GatekeeperConfig,
}

/// Per-run state threaded through the attempt loop.
struct RunScope<'a> {
    job_spec: &'a JobSpec,
    run_paths: RunPaths,
    state: RetryState,
}

impl ValidationOrchestrator {
    pub fn new(workspace_root: &Path, config: GatekeeperConfig) -> Result<Self> {
        config.validate()?;
        let workspace_root = fs::canonicalize(workspace_root)
            .with_context(|| format!("resolve workspace {}", workspace_root.display()))?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// Run the attempt loop to a terminal outcome.
    ///
    /// `Err` is reserved for infrastructure failures (an artifact could not be
    /// written) and for a job spec that cannot be constructed at all.
    #[instrument(skip_all, fields(mission_kind = %request.mission_kind, tier = %request.evidence_tier))]
    pub fn run<A: AgentRunner + ?Sized>(
        &self,
        request: &RunRequest,
        agent: &A,
    ) -> Result<OrchestrationResult> {
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(default_run_id);
        let job_spec = JobSpec::new(
            run_id.as_str(),
            request.mission_kind.as_str(),
            request.evidence_tier,
            self.config.gate_pipeline_version.as_str(),
            self.config.retry.caps(),
        )?;
        let mut scope = RunScope {
            job_spec: &job_spec,
            run_paths: RunPaths::new(&self.workspace_root, &run_id),
            state: RetryState::default(),
        };
        fs::create_dir_all(&scope.run_paths.root)
            .with_context(|| format!("create run dir {}", scope.run_paths.root.display()))?;

        let guard = match acquire_workspace_lock(
            &self.workspace_root,
            &run_id,
            BOOTSTRAP_ATTEMPT_ID,
            self.config.lock_ttl_secs,
        ) {
            Ok(handle) => WorkspaceLockGuard::new(handle),
            Err(err) => match gate_error(&err) {
                Some(lock_err) => return self.lock_failure(&mut scope, lock_err),
                None => return Err(err),
            },
        };
        info!(run_id = %run_id, "workspace lock acquired");

        let result = self.attempt_loop(&mut scope, agent);
        match guard.release() {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run_id, "workspace lock was not ours at release"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to release workspace lock"),
        }
        result
    }

    fn lock_failure(
        &self,
        scope: &mut RunScope<'_>,
        lock_err: &GateError,
    ) -> Result<OrchestrationResult> {
        let paths = scope.run_paths.attempt(BOOTSTRAP_ATTEMPT_ID);
        fs::create_dir_all(&paths.evidence_root)
            .with_context(|| format!("create {}", paths.evidence_root.display()))?;
        write_job_spec(&paths.job_spec_path, scope.job_spec)?;
        let context =
            AttemptContext::capture(scope.job_spec, BOOTSTRAP_ATTEMPT_ID, 0, &scope.state);

        let code = lock_err.code;
        let report = ValidationReport::failure(
            Gate::Preflight,
            code,
            lock_err.message.clone(),
            Some(lock_err.next_action()),
            vec![CheckResult::failed(
                CHECK_WORKSPACE_LOCK,
                code,
                lock_err.message.clone(),
            )],
            context,
            paths.pointers(),
        );
        write_json_atomic(&paths.report_path, &report)?;

        scope.state.record_failure(Gate::Preflight, code);
        let terminal_reason = evaluate_retry(
            &scope.job_spec.retry_caps(),
            &scope.state,
            Gate::Preflight,
            code,
            code.classification(),
        )
        .map(|reason| reason.to_string());
        self.record(
            scope,
            failure_event(
                BOOTSTRAP_ATTEMPT_ID,
                0,
                Gate::Preflight,
                code,
                lock_err.next_action(),
                true,
                terminal_reason.clone(),
            ),
        )?;
        warn!(message = %lock_err.message, "workspace lock unavailable");
        Ok(OrchestrationResult {
            success: false,
            run_id: scope.job_spec.run_id().to_string(),
            attempt_id: BOOTSTRAP_ATTEMPT_ID.to_string(),
            attempt_index: 0,
            code: Some(code),
            message: lock_err.message.clone(),
            terminal_reason,
            validator_report_path: Some(paths.report_path),
            acceptance_token_path: None,
            acceptance_record_path: None,
        })
    }

    fn attempt_loop<A: AgentRunner + ?Sized>(
        &self,
        scope: &mut RunScope<'_>,
        agent: &A,
    ) -> Result<OrchestrationResult> {
        let caps = scope.job_spec.retry_caps();
        let mut last_code = None;
        for attempt_index in 1..=caps.max_total_attempts_per_run {
            let attempt_id = attempt_id_for(attempt_index);
            let paths = scope.run_paths.attempt(&attempt_id);
            fs::create_dir_all(&paths.evidence_root)
                .with_context(|| format!("create {}", paths.evidence_root.display()))?;
            let job_spec_sha256 = write_job_spec(&paths.job_spec_path, scope.job_spec)?;
            let context =
                AttemptContext::capture(scope.job_spec, &attempt_id, attempt_index, &scope.state);
            info!(attempt_id = %attempt_id, "attempt started");

            let preflight = run_preflight(&PreflightRequest {
                workspace_root: &self.workspace_root,
                paths: &paths,
                context: &context,
            })?;
            if let GateOutcome::Failed(failure) = preflight {
                scope.state.record_failure(Gate::Preflight, failure.code);
                let terminal_reason = evaluate_retry(
                    &caps,
                    &scope.state,
                    Gate::Preflight,
                    failure.code,
                    failure.code.classification(),
                )
                .map(|reason| reason.to_string());
                let mut event = failure_event(
                    &attempt_id,
                    attempt_index,
                    Gate::Preflight,
                    failure.code,
                    failure.next_action,
                    true,
                    terminal_reason.clone(),
                );
                event.policy = Some(PREFLIGHT_TERMINAL_POLICY.to_string());
                self.record(scope, event)?;
                return Ok(self.failure_result(
                    scope,
                    &attempt_id,
                    attempt_index,
                    failure.code,
                    format!("Preflight failed: {}", failure.code),
                    terminal_reason,
                    Some(failure.report_path),
                ));
            }
            self.record(
                scope,
                RecoveryEvent {
                    timestamp: timestamp(Utc::now()),
                    attempt_id: attempt_id.clone(),
                    attempt_index,
                    gate: Gate::Preflight,
                    code: PREFLIGHT_PASSED_CODE.to_string(),
                    classification: None,
                    next_action: NextAction::None,
                    terminal: false,
                    policy: None,
                    terminal_reason: None,
                    agent_error: None,
                },
            )?;

            let agent_error = invoke_agent(agent, &paths.dir, scope.job_spec);

            let postflight = run_postflight(&PostflightRequest {
                workspace_root: &self.workspace_root,
                paths: &paths,
                context: &context,
                receipt_required: self.config.receipt_required,
                expected_job_spec_sha256: Some(&job_spec_sha256),
                now: Utc::now(),
            })?;
            let failure = match postflight {
                GateOutcome::Passed { token_path } => {
                    let token_path = token_path.unwrap_or_else(|| paths.token_path.clone());
                    return self.accept_token(
                        scope,
                        &attempt_id,
                        attempt_index,
                        token_path,
                        agent_error,
                    );
                }
                GateOutcome::Failed(failure) => failure,
            };

            scope.state.record_failure(Gate::Postflight, failure.code);
            let terminal_reason = evaluate_retry(
                &caps,
                &scope.state,
                Gate::Postflight,
                failure.code,
                failure.code.classification(),
            )
            .map(|reason| reason.to_string());
            let terminal = terminal_reason.is_some();
            let mut event = failure_event(
                &attempt_id,
                attempt_index,
                Gate::Postflight,
                failure.code,
                failure.next_action,
                terminal,
                terminal_reason.clone(),
            );
            event.agent_error = agent_error;
            self.record(scope, event)?;
            last_code = Some(failure.code);

            if terminal {
                let reason = terminal_reason.clone().unwrap_or_default();
                return Ok(self.failure_result(
                    scope,
                    &attempt_id,
                    attempt_index,
                    failure.code,
                    format!("Terminal failure: {reason}"),
                    terminal_reason,
                    Some(failure.report_path),
                ));
            }
            info!(attempt_id = %attempt_id, code = %failure.code, "retrying with a fresh attempt");
        }

        // Unreachable while the total cap is enforced by evaluate_retry.
        let attempt_index = caps.max_total_attempts_per_run;
        let attempt_id = attempt_id_for(attempt_index);
        let report_path = scope.run_paths.attempt(&attempt_id).report_path;
        Ok(OrchestrationResult {
            success: false,
            run_id: scope.job_spec.run_id().to_string(),
            attempt_id,
            attempt_index,
            code: last_code,
            message: "Retry loop exhausted".to_string(),
            terminal_reason: None,
            validator_report_path: report_path.exists().then_some(report_path),
            acceptance_token_path: None,
            acceptance_record_path: None,
        })
    }

    fn accept_token(
        &self,
        scope: &mut RunScope<'_>,
        attempt_id: &str,
        attempt_index: u32,
        token_path: PathBuf,
        agent_error: Option<String>,
    ) -> Result<OrchestrationResult> {
        match accept(&token_path, Utc::now()) {
            Ok(accepted) => {
                self.record(
                    scope,
                    RecoveryEvent {
                        timestamp: timestamp(Utc::now()),
                        attempt_id: attempt_id.to_string(),
                        attempt_index,
                        gate: Gate::Postflight,
                        code: SUCCESS_CODE.to_string(),
                        classification: Some(Classification::Terminal),
                        next_action: NextAction::None,
                        terminal: true,
                        policy: None,
                        terminal_reason: None,
                        agent_error,
                    },
                )?;
                info!(attempt_id, "attempt accepted");
                Ok(OrchestrationResult {
                    success: true,
                    run_id: scope.job_spec.run_id().to_string(),
                    attempt_id: attempt_id.to_string(),
                    attempt_index,
                    code: None,
                    message: "Accepted".to_string(),
                    terminal_reason: None,
                    validator_report_path: None,
                    acceptance_token_path: Some(token_path),
                    acceptance_record_path: Some(accepted.record_path),
                })
            }
            Err(err) => {
                let (code, message) = match gate_error(&err) {
                    Some(gate_err) => (gate_err.code, gate_err.message.clone()),
                    None => (Code::ValidatorCrash, format!("{err:#}")),
                };
                warn!(code = %code, message = %message, "acceptor rejected token");
                scope.state.record_failure(Gate::Acceptor, code);
                let terminal_reason = evaluate_retry(
                    &scope.job_spec.retry_caps(),
                    &scope.state,
                    Gate::Acceptor,
                    code,
                    code.classification(),
                )
                .map(|reason| reason.to_string());
                let mut event = failure_event(
                    attempt_id,
                    attempt_index,
                    Gate::Acceptor,
                    code,
                    NextAction::HaltValidatorBug,
                    true,
                    terminal_reason.clone(),
                );
                event.agent_error = agent_error;
                self.record(scope, event)?;
                let mut result = self.failure_result(
                    scope,
                    attempt_id,
                    attempt_index,
                    code,
                    format!("Acceptor rejected token: {message}"),
                    terminal_reason,
                    None,
                );
                result.acceptance_token_path = Some(token_path);
                Ok(result)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failure_result(
        &self,
        scope: &RunScope<'_>,
        attempt_id: &str,
        attempt_index: u32,
        code: Code,
        message: String,
        terminal_reason: Option<String>,
        validator_report_path: Option<PathBuf>,
    ) -> OrchestrationResult {
        OrchestrationResult {
            success: false,
            run_id: scope.job_spec.run_id().to_string(),
            attempt_id: attempt_id.to_string(),
            attempt_index,
            code: Some(code),
            message,
            terminal_reason,
            validator_report_path,
            acceptance_token_path: None,
            acceptance_record_path: None,
        }
    }

    fn record(&self, scope: &RunScope<'_>, event: RecoveryEvent) -> Result<()> {
        append_recovery_event(&scope.run_paths.recovery_log_path, &event)
    }
}

fn failure_event(
    attempt_id: &str,
    attempt_index: u32,
    gate: Gate,
    code: Code,
    next_action: NextAction,
    terminal: bool,
    terminal_reason: Option<String>,
) -> RecoveryEvent {
    RecoveryEvent {
        timestamp: timestamp(Utc::now()),
        attempt_id: attempt_id.to_string(),
        attempt_index,
        gate,
        code: code.as_str().to_string(),
        classification: Some(code.classification()),
        next_action,
        terminal,
        policy: None,
        terminal_reason,
        agent_error: None,
    }
}

/// Run the untrusted agent once. Errors and panics are returned as text so
/// postflight still judges whatever evidence exists.
fn invoke_agent<A: AgentRunner + ?Sized>(
    agent: &A,
    attempt_dir: &Path,
    job_spec: &JobSpec,
) -> Option<String> {
    match catch_unwind(AssertUnwindSafe(|| agent.run(attempt_dir, job_spec))) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => {
            warn!(err = %format!("{err:#}"), "agent returned an error");
            Some(format!("{err:#}"))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "agent panicked");
            Some(format!("agent panicked: {message}"))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

/// `run-<utc timestamp>-<pid>`; unique per process and sortable by start time.
pub fn default_run_id() -> String {
    format!(
        "run-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%6fZ"),
        std::process::id()
    )
}
