//! `job_spec.json` load/save with schema validation.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::core::codes::Code;
use crate::core::job_spec::{JobSpec, JobSpecDocument};
use crate::error::GateError;
use crate::io::atomic::write_json_atomic;
use crate::io::digest::sha256_file;
use crate::io::schema::{JOB_SPEC_SCHEMA, schema_violations};

/// Write the job spec atomically and return the sha256 of the written file.
pub fn write_job_spec(path: &Path, job_spec: &JobSpec) -> Result<String> {
    write_json_atomic(path, &job_spec.to_document())?;
    sha256_file(path)
}

/// Load and validate a job spec (schema, then typed checks).
///
/// Every failure, including a missing file, is `JOB_SPEC_INVALID`.
pub fn load_job_spec(path: &Path) -> Result<JobSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|err| invalid(format!("read {}: {err}", path.display())))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| invalid(format!("parse {}: {err}", path.display())))?;
    let violations = schema_violations(JOB_SPEC_SCHEMA, &value)?;
    if !violations.is_empty() {
        return Err(invalid(format!(
            "job spec schema validation failed: {}",
            violations.join("; ")
        ))
        .into());
    }
    let document: JobSpecDocument = serde_json::from_value(value)
        .map_err(|err| invalid(format!("deserialize {}: {err}", path.display())))?;
    Ok(JobSpec::try_from(document)?)
}

fn invalid(message: String) -> GateError {
    GateError::new(Code::JobSpecInvalid, format!("invalid job_spec.json: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job_spec::EvidenceTier;
    use crate::error::gate_error;
    use crate::test_support::sample_job_spec;

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("job_spec.json");
        let spec = sample_job_spec("run-1", EvidenceTier::Standard);

        let sha = write_job_spec(&path, &spec).expect("write");
        assert_eq!(sha.len(), 64);
        assert_eq!(load_job_spec(&path).expect("load"), spec);
    }

    #[test]
    fn missing_file_is_job_spec_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_job_spec(&temp.path().join("job_spec.json")).unwrap_err();
        assert_eq!(gate_error(&err).expect("gate").code, Code::JobSpecInvalid);
    }

    #[test]
    fn schema_violation_is_job_spec_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("job_spec.json");
        let spec = sample_job_spec("run-1", EvidenceTier::Light);
        let mut value = serde_json::to_value(spec.to_document()).expect("value");
        value["max_total_attempts_per_run"] = serde_json::json!(0);
        fs::write(&path, value.to_string()).expect("write");

        let err = load_job_spec(&path).unwrap_err();
        let gate = gate_error(&err).expect("gate");
        assert_eq!(gate.code, Code::JobSpecInvalid);
        assert!(gate.message.contains("schema"), "{}", gate.message);
    }
}
