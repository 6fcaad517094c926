//! Persisted verdict types: validator reports, acceptance tokens and records.
//!
//! Field order in these structs is the serialized key order, so a report built
//! from the same inputs always serializes to the same bytes.

use serde::{Deserialize, Serialize};

use crate::core::codes::{Classification, Code, Gate, NextAction};
use crate::core::job_spec::AttemptContext;

pub const VALIDATOR_REPORT_SCHEMA_VERSION: &str = "validator_report_v1";
pub const ACCEPTANCE_TOKEN_SCHEMA_VERSION: &str = "acceptance_token_v1";
pub const ACCEPTANCE_RECORD_SCHEMA_VERSION: &str = "acceptance_record_v1";

/// One named check that contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub code: Code,
    pub ok: bool,
    pub message: String,
}

impl CheckResult {
    pub fn failed(name: impl Into<String>, code: Code, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code,
            ok: false,
            message: message.into(),
        }
    }
}

/// Locations of an attempt's artifacts. Keys serialize in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointers {
    pub attempt_dir: String,
    pub evidence_root: String,
    pub manifest_path: String,
    pub receipt_path: String,
}

/// Failure verdict written as `validator_report.json`.
///
/// Only constructible through [`ValidationReport::failure`], so `pass` is
/// always false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub schema_version: String,
    #[serde(rename = "pass")]
    passed: bool,
    pub gate: Gate,
    pub summary_code: Code,
    pub exit_code: i32,
    pub message: String,
    pub classification: Classification,
    pub next_action: NextAction,
    pub checks: Vec<CheckResult>,
    pub attempt_context: AttemptContext,
    pub pointers: Pointers,
}

impl ValidationReport {
    /// Build a failure report. Exit code and classification come from the code
    /// table; `next_action` falls back to the code's default.
    pub fn failure(
        gate: Gate,
        code: Code,
        message: impl Into<String>,
        next_action: Option<NextAction>,
        mut checks: Vec<CheckResult>,
        attempt_context: AttemptContext,
        pointers: Pointers,
    ) -> Self {
        let spec = code.spec();
        checks.sort_by(|a, b| {
            (a.name.as_str(), a.code.as_str(), a.message.as_str()).cmp(&(
                b.name.as_str(),
                b.code.as_str(),
                b.message.as_str(),
            ))
        });
        Self {
            schema_version: VALIDATOR_REPORT_SCHEMA_VERSION.to_string(),
            passed: false,
            gate,
            summary_code: code,
            exit_code: spec.exit_code,
            message: message.into(),
            classification: spec.classification,
            next_action: next_action.unwrap_or(spec.default_next_action),
            checks,
            attempt_context,
            pointers,
        }
    }

    /// Always false; a report is only written for a failure.
    pub fn passed(&self) -> bool {
        self.passed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provenance {
    pub minted_by: String,
    pub attempt_dir: String,
    pub evidence_root: String,
    pub manifest_path: String,
    pub receipt_path: String,
}

/// Certificate minted by postflight. Never carries a hash of itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcceptanceToken {
    pub schema_version: String,
    #[serde(rename = "pass")]
    pub passed: bool,
    pub run_id: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    pub gate_pipeline_version: String,
    pub evidence_manifest_sha256: String,
    pub receipt_sha256: Option<String>,
    pub created_at: String,
    pub provenance: Provenance,
}

/// Written by the acceptor after independently re-verifying a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceRecord {
    pub schema_version: String,
    pub accepted: bool,
    pub run_id: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    pub accepted_at: String,
    pub token_path: String,
    pub manifest_path: String,
    pub receipt_path: String,
    pub evidence_manifest_sha256: String,
    pub receipt_sha256: Option<String>,
    pub acceptance_token_sha256: String,
}
