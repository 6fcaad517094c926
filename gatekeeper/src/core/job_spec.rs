//! Trusted job description, retry caps and per-attempt context.
//!
//! `JobSpec` is the only description of a run the gates trust. It is built once
//! per run, written to every attempt directory, and never mutated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::attempts::RetryState;
use crate::core::codes::Code;
use crate::error::GateError;

pub const JOB_SPEC_SCHEMA_VERSION: &str = "job_spec_v1";

/// Named minimum set of evidence artifacts an attempt must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceTier {
    Light,
    Standard,
    Full,
}

impl EvidenceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for EvidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceTier {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "standard" => Ok(Self::Standard),
            "full" => Ok(Self::Full),
            other => Err(GateError::new(
                Code::JobSpecInvalid,
                format!("unsupported evidence tier: {other}"),
            )),
        }
    }
}

/// The three ceilings that bound work per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryCaps {
    pub max_attempts_per_gate_per_run: u32,
    pub max_total_attempts_per_run: u32,
    pub max_consecutive_same_failure_code: u32,
}

impl Default for RetryCaps {
    fn default() -> Self {
        Self {
            max_attempts_per_gate_per_run: 2,
            max_total_attempts_per_run: 3,
            max_consecutive_same_failure_code: 2,
        }
    }
}

impl RetryCaps {
    pub fn new(per_gate: u32, total: u32, consecutive_same: u32) -> Self {
        Self {
            max_attempts_per_gate_per_run: per_gate,
            max_total_attempts_per_run: total,
            max_consecutive_same_failure_code: consecutive_same,
        }
    }

    pub fn validate(&self) -> Result<(), GateError> {
        for (name, value) in [
            (
                "max_attempts_per_gate_per_run",
                self.max_attempts_per_gate_per_run,
            ),
            ("max_total_attempts_per_run", self.max_total_attempts_per_run),
            (
                "max_consecutive_same_failure_code",
                self.max_consecutive_same_failure_code,
            ),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be a positive integer")));
            }
        }
        Ok(())
    }
}

/// On-disk shape of `job_spec.json`: flat, every key required, nothing extra.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpecDocument {
    pub schema_version: String,
    pub run_id: String,
    pub mission_kind: String,
    pub evidence_tier: EvidenceTier,
    pub gate_pipeline_version: String,
    pub max_attempts_per_gate_per_run: u32,
    pub max_total_attempts_per_run: u32,
    pub max_consecutive_same_failure_code: u32,
}

/// Validated, immutable description of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    run_id: String,
    mission_kind: String,
    evidence_tier: EvidenceTier,
    gate_pipeline_version: String,
    retry_caps: RetryCaps,
}

impl JobSpec {
    pub fn new(
        run_id: impl Into<String>,
        mission_kind: impl Into<String>,
        evidence_tier: EvidenceTier,
        gate_pipeline_version: impl Into<String>,
        retry_caps: RetryCaps,
    ) -> Result<Self, GateError> {
        let spec = Self {
            run_id: run_id.into(),
            mission_kind: mission_kind.into(),
            evidence_tier,
            gate_pipeline_version: gate_pipeline_version.into(),
            retry_caps,
        };
        for (name, value) in [
            ("run_id", &spec.run_id),
            ("mission_kind", &spec.mission_kind),
            ("gate_pipeline_version", &spec.gate_pipeline_version),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{name} must be a non-empty string")));
            }
        }
        validate_path_component("run_id", &spec.run_id)?;
        spec.retry_caps.validate()?;
        Ok(spec)
    }

    /// Parse a raw JSON document. Missing keys, extra keys and wrong types are errors.
    pub fn from_json_str(raw: &str) -> Result<Self, GateError> {
        let document: JobSpecDocument = serde_json::from_str(raw)
            .map_err(|err| invalid(format!("parse job_spec.json: {err}")))?;
        Self::try_from(document)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn mission_kind(&self) -> &str {
        &self.mission_kind
    }

    pub fn evidence_tier(&self) -> EvidenceTier {
        self.evidence_tier
    }

    pub fn gate_pipeline_version(&self) -> &str {
        &self.gate_pipeline_version
    }

    pub fn retry_caps(&self) -> RetryCaps {
        self.retry_caps
    }

    pub fn to_document(&self) -> JobSpecDocument {
        JobSpecDocument {
            schema_version: JOB_SPEC_SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            mission_kind: self.mission_kind.clone(),
            evidence_tier: self.evidence_tier,
            gate_pipeline_version: self.gate_pipeline_version.clone(),
            max_attempts_per_gate_per_run: self.retry_caps.max_attempts_per_gate_per_run,
            max_total_attempts_per_run: self.retry_caps.max_total_attempts_per_run,
            max_consecutive_same_failure_code: self.retry_caps.max_consecutive_same_failure_code,
        }
    }
}

impl TryFrom<JobSpecDocument> for JobSpec {
    type Error = GateError;

    fn try_from(document: JobSpecDocument) -> Result<Self, Self::Error> {
        if document.schema_version != JOB_SPEC_SCHEMA_VERSION {
            return Err(invalid(format!(
                "schema_version must be '{JOB_SPEC_SCHEMA_VERSION}', got '{}'",
                document.schema_version
            )));
        }
        JobSpec::new(
            document.run_id,
            document.mission_kind,
            document.evidence_tier,
            document.gate_pipeline_version,
            RetryCaps::new(
                document.max_attempts_per_gate_per_run,
                document.max_total_attempts_per_run,
                document.max_consecutive_same_failure_code,
            ),
        )
    }
}

/// Snapshot of one attempt, captured when the attempt begins.
///
/// Only used to build reports; control flow never reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub run_id: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    pub max_attempts_per_gate_per_run: u32,
    pub max_total_attempts_per_run: u32,
    pub max_consecutive_same_failure_code: u32,
    pub distinct_failure_codes_count: u32,
    pub consecutive_same_failure_code: u32,
}

impl AttemptContext {
    pub fn capture(
        job_spec: &JobSpec,
        attempt_id: impl Into<String>,
        attempt_index: u32,
        state: &RetryState,
    ) -> Self {
        let caps = job_spec.retry_caps();
        Self {
            run_id: job_spec.run_id().to_string(),
            attempt_id: attempt_id.into(),
            attempt_index,
            max_attempts_per_gate_per_run: caps.max_attempts_per_gate_per_run,
            max_total_attempts_per_run: caps.max_total_attempts_per_run,
            max_consecutive_same_failure_code: caps.max_consecutive_same_failure_code,
            distinct_failure_codes_count: state.distinct_failure_codes(),
            consecutive_same_failure_code: state.consecutive_same_failure_code(),
        }
    }
}

/// Attempt ids are zero-padded so directory listings sort by index.
pub fn attempt_id_for(attempt_index: u32) -> String {
    format!("attempt-{attempt_index:04}")
}

/// Fail unless `value` can name exactly one directory under the runs root.
///
/// Run and attempt ids become path components, so separators, `.`, `..` and
/// NUL are rejected before anything is written.
pub fn validate_path_component(name: &str, value: &str) -> Result<(), GateError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(invalid(format!(
            "{name} must be a single path component, got {value:?}"
        )));
    }
    Ok(())
}

fn invalid(message: String) -> GateError {
    GateError::new(Code::JobSpecInvalid, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codes::Gate;

    fn sample() -> JobSpec {
        JobSpec::new(
            "run-1",
            "build_with_validation",
            EvidenceTier::Light,
            "gates-v1",
            RetryCaps::new(2, 3, 2),
        )
        .expect("job spec")
    }

    #[test]
    fn document_serializes_flat_with_stable_key_order() {
        let json = serde_json::to_string(&sample().to_document()).expect("serialize");
        assert_eq!(
            json,
            "{\"schema_version\":\"job_spec_v1\",\"run_id\":\"run-1\",\
             \"mission_kind\":\"build_with_validation\",\"evidence_tier\":\"light\",\
             \"gate_pipeline_version\":\"gates-v1\",\"max_attempts_per_gate_per_run\":2,\
             \"max_total_attempts_per_run\":3,\"max_consecutive_same_failure_code\":2}"
        );
    }

    #[test]
    fn rejects_extra_keys() {
        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value["debug"] = serde_json::json!(true);
        let err = JobSpec::from_json_str(&value.to_string()).unwrap_err();
        assert_eq!(err.code, Code::JobSpecInvalid);
        assert!(err.message.contains("debug"), "{}", err.message);
    }

    #[test]
    fn rejects_missing_keys() {
        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value
            .as_object_mut()
            .expect("object")
            .remove("max_total_attempts_per_run");
        let err = JobSpec::from_json_str(&value.to_string()).unwrap_err();
        assert_eq!(err.code, Code::JobSpecInvalid);
        assert!(err.message.contains("max_total_attempts_per_run"));
    }

    #[test]
    fn rejects_zero_and_negative_caps() {
        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value["max_attempts_per_gate_per_run"] = serde_json::json!(0);
        let err = JobSpec::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.message.contains("positive integer"));

        value["max_attempts_per_gate_per_run"] = serde_json::json!(-1);
        assert!(JobSpec::from_json_str(&value.to_string()).is_err());
    }

    #[test]
    fn rejects_blank_strings_and_wrong_schema() {
        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value["mission_kind"] = serde_json::json!("  ");
        assert!(JobSpec::from_json_str(&value.to_string()).is_err());

        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value["schema_version"] = serde_json::json!("job_spec_v0");
        let err = JobSpec::from_json_str(&value.to_string()).unwrap_err();
        assert!(err.message.contains("schema_version"));
    }

    #[test]
    fn unknown_tier_is_job_spec_invalid() {
        let err = "platinum".parse::<EvidenceTier>().unwrap_err();
        assert_eq!(err.code, Code::JobSpecInvalid);

        let mut value = serde_json::to_value(sample().to_document()).expect("value");
        value["evidence_tier"] = serde_json::json!("platinum");
        assert!(JobSpec::from_json_str(&value.to_string()).is_err());
    }

    #[test]
    fn document_round_trips_into_identical_spec() {
        let spec = sample();
        let raw = serde_json::to_string_pretty(&spec.to_document()).expect("serialize");
        assert_eq!(JobSpec::from_json_str(&raw).expect("parse"), spec);
    }

    #[test]
    fn attempt_context_captures_retry_counters() {
        let mut state = RetryState::default();
        state.record_failure(Gate::Postflight, Code::EvidenceHashMismatch);
        state.record_failure(Gate::Postflight, Code::EvidenceOrphanFile);
        state.record_failure(Gate::Postflight, Code::EvidenceOrphanFile);

        let ctx = AttemptContext::capture(&sample(), attempt_id_for(4), 4, &state);
        assert_eq!(ctx.attempt_id, "attempt-0004");
        assert_eq!(ctx.distinct_failure_codes_count, 2);
        assert_eq!(ctx.consecutive_same_failure_code, 2);
        assert_eq!(ctx.max_total_attempts_per_run, 3);
    }

    #[test]
    fn run_id_must_be_a_single_path_component() {
        for run_id in ["../../x", "a/b", "a\\b", ".", "..", "nul\0id"] {
            let err = JobSpec::new(
                run_id,
                "build_with_validation",
                EvidenceTier::Light,
                "gates-v1",
                RetryCaps::default(),
            )
            .unwrap_err();
            assert_eq!(err.code, Code::JobSpecInvalid, "{run_id:?}");
            assert!(err.message.contains("single path component"), "{run_id:?}");
        }
        assert!(validate_path_component("run_id", "run-20260210T120000Z-42").is_ok());
        assert!(validate_path_component("run_id", "..hidden").is_ok());
    }
}
