//! Retry bookkeeping and the retry-termination policy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::codes::{Classification, Code, Gate};
use crate::core::job_spec::RetryCaps;

/// Number of distinct failure codes in one run after which retrying stops.
pub const DISTINCT_FAILURE_CODES_LIMIT: u32 = 3;

/// Failure history of one run. Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts_total: u32,
    pub attempts_by_gate: BTreeMap<Gate, u32>,
    pub failure_codes: Vec<Code>,
}

impl RetryState {
    pub fn record_failure(&mut self, gate: Gate, code: Code) {
        self.attempts_total += 1;
        *self.attempts_by_gate.entry(gate).or_insert(0) += 1;
        self.failure_codes.push(code);
    }

    pub fn attempts_for_gate(&self, gate: Gate) -> u32 {
        self.attempts_by_gate.get(&gate).copied().unwrap_or(0)
    }

    pub fn distinct_failure_codes(&self) -> u32 {
        let distinct: BTreeSet<Code> = self.failure_codes.iter().copied().collect();
        distinct.len() as u32
    }

    /// Length of the trailing run of identical codes.
    pub fn consecutive_same_failure_code(&self) -> u32 {
        let Some(last) = self.failure_codes.last() else {
            return 0;
        };
        self.failure_codes
            .iter()
            .rev()
            .take_while(|code| *code == last)
            .count() as u32
    }
}

/// Why the retry loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    TerminalClassification(Code),
    EnvironmentCorruption(Code),
    MaxTotalAttempts,
    MaxAttemptsPerGate(Gate),
    ConsecutiveSameFailureCode(Code),
    DistinctFailureCodes,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminalClassification(code) => write!(f, "terminal_classification:{code}"),
            Self::EnvironmentCorruption(code) => write!(f, "environment_corruption:{code}"),
            Self::MaxTotalAttempts => f.write_str("max_total_attempts_per_run_reached"),
            Self::MaxAttemptsPerGate(gate) => {
                write!(f, "max_attempts_per_gate_per_run_reached:{gate}")
            }
            Self::ConsecutiveSameFailureCode(code) => {
                write!(f, "max_consecutive_same_failure_code_reached:{code}")
            }
            Self::DistinctFailureCodes => f.write_str("distinct_failure_codes_threshold_reached"),
        }
    }
}

/// Codes that mean the workspace itself cannot be trusted.
fn is_environment_corruption(code: Code) -> bool {
    matches!(
        code,
        Code::DirtyRepoPre | Code::EvidenceRootNotIgnored | Code::ConcurrentRunDetected
    )
}

/// Decide whether the run stops after a failure already recorded in `state`.
///
/// Checks run in a fixed order and the first one that fires wins. `None` means
/// another attempt may start.
pub fn evaluate_retry(
    caps: &RetryCaps,
    state: &RetryState,
    gate: Gate,
    code: Code,
    classification: Classification,
) -> Option<TerminalReason> {
    if classification == Classification::Terminal {
        return Some(TerminalReason::TerminalClassification(code));
    }
    if is_environment_corruption(code) {
        return Some(TerminalReason::EnvironmentCorruption(code));
    }
    if state.attempts_total >= caps.max_total_attempts_per_run {
        return Some(TerminalReason::MaxTotalAttempts);
    }
    if state.attempts_for_gate(gate) >= caps.max_attempts_per_gate_per_run {
        return Some(TerminalReason::MaxAttemptsPerGate(gate));
    }
    if state.consecutive_same_failure_code() >= caps.max_consecutive_same_failure_code {
        return Some(TerminalReason::ConsecutiveSameFailureCode(code));
    }
    if state.distinct_failure_codes() >= DISTINCT_FAILURE_CODES_LIMIT {
        return Some(TerminalReason::DistinctFailureCodes);
    }
    None
}
