//! JSON Schema checks for persisted trusted inputs.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

pub const JOB_SPEC_SCHEMA: &str = include_str!("../../schemas/job_spec.schema.json");
pub const ACCEPTANCE_TOKEN_SCHEMA: &str =
    include_str!("../../schemas/acceptance_token.schema.json");

/// Validate `instance` against a compiled-in schema.
///
/// Returns the violation messages (empty when valid). `Err` means the schema
/// itself could not be compiled.
pub fn schema_violations(schema_src: &str, instance: &Value) -> Result<Vec<String>> {
    let schema_value: Value =
        serde_json::from_str(schema_src).map_err(|err| anyhow!("parse schema: {err}"))?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if compiled.is_valid(instance) {
        return Ok(Vec::new());
    }
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
