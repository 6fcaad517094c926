//! Independent re-verification of a minted acceptance token.
//!
//! Minting and accepting are separate steps. The acceptor re-derives every
//! claim from disk, so a gate bug that mints a bad token is still caught here.
//! Every rejection is `ACCEPTANCE_TOKEN_INVALID`.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::codes::Code;
use crate::core::remote_op::timestamp;
use crate::core::report::{
    ACCEPTANCE_RECORD_SCHEMA_VERSION, ACCEPTANCE_TOKEN_SCHEMA_VERSION, AcceptanceRecord,
    AcceptanceToken,
};
use crate::error::GateError;
use crate::io::atomic::write_json_atomic;
use crate::io::digest::sha256_file;
use crate::io::evidence::verify_manifest;
use crate::io::layout::{ACCEPTANCE_RECORD_FILENAME, AttemptPaths};
use crate::io::schema::{ACCEPTANCE_TOKEN_SCHEMA, schema_violations};

/// Field a token must never carry: a minter cannot vouch for its own bytes.
pub const FORBIDDEN_SELF_HASH_FIELD: &str = "token_sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub record: AcceptanceRecord,
    pub record_path: PathBuf,
}

/// Verify `token_path` and write `acceptance_record.json` next to it.
#[instrument(skip_all, fields(token = %token_path.display()))]
pub fn accept(token_path: &Path, now: DateTime<Utc>) -> Result<Accepted> {
    let token = load_token(token_path)?;
    let paths = verify_layout(token_path, &token)?;

    let manifest_sha256 = hash(&paths.manifest_path)?;
    if manifest_sha256 != token.evidence_manifest_sha256 {
        return Err(invalid(format!(
            "evidence manifest hash mismatch: token claims {}, disk has {manifest_sha256}",
            token.evidence_manifest_sha256
        )));
    }
    verify_manifest(&paths.evidence_root)
        .map_err(|err| invalid(format!("evidence no longer matches manifest: {err:#}")))?;

    match (&token.receipt_sha256, paths.receipt_path.is_file()) {
        (Some(claimed), true) => {
            let actual = hash(&paths.receipt_path)?;
            if &actual != claimed {
                return Err(invalid(format!(
                    "receipt hash mismatch: token claims {claimed}, disk has {actual}"
                )));
            }
        }
        (Some(_), false) => {
            return Err(invalid(format!(
                "token claims a receipt but {} is missing",
                paths.receipt_path.display()
            )));
        }
        (None, true) => {
            return Err(invalid(format!(
                "receipt {} is not covered by the token",
                paths.receipt_path.display()
            )));
        }
        (None, false) => {}
    }

    let record = AcceptanceRecord {
        schema_version: ACCEPTANCE_RECORD_SCHEMA_VERSION.to_string(),
        accepted: true,
        run_id: token.run_id.clone(),
        attempt_id: token.attempt_id.clone(),
        attempt_index: token.attempt_index,
        accepted_at: timestamp(now),
        token_path: token_path.display().to_string(),
        manifest_path: token.provenance.manifest_path.clone(),
        receipt_path: token.provenance.receipt_path.clone(),
        evidence_manifest_sha256: token.evidence_manifest_sha256.clone(),
        receipt_sha256: token.receipt_sha256.clone(),
        acceptance_token_sha256: hash(token_path)?,
    };
    let record_path = paths.dir.join(ACCEPTANCE_RECORD_FILENAME);
    write_json_atomic(&record_path, &record)?;
    info!(run_id = %record.run_id, attempt_id = %record.attempt_id, "token accepted");
    Ok(Accepted {
        record,
        record_path,
    })
}

fn load_token(token_path: &Path) -> Result<AcceptanceToken> {
    let raw = fs::read_to_string(token_path)
        .map_err(|err| invalid(format!("read {}: {err}", token_path.display())))?;
    let value: Value =
        serde_json::from_str(&raw).map_err(|err| invalid(format!("parse token: {err}")))?;
    let Some(object) = value.as_object() else {
        return Err(invalid("token must be a JSON object".to_string()));
    };
    if object.contains_key(FORBIDDEN_SELF_HASH_FIELD) {
        warn!("token carries a self-hash");
        return Err(invalid(format!(
            "token must not contain {FORBIDDEN_SELF_HASH_FIELD}"
        )));
    }
    let violations = schema_violations(ACCEPTANCE_TOKEN_SCHEMA, &value)?;
    if !violations.is_empty() {
        return Err(invalid(format!(
            "token schema validation failed: {}",
            violations.join("; ")
        )));
    }
    let token: AcceptanceToken =
        serde_json::from_value(value).map_err(|err| invalid(format!("decode token: {err}")))?;
    if token.schema_version != ACCEPTANCE_TOKEN_SCHEMA_VERSION || !token.passed {
        return Err(invalid(format!(
            "token must be {ACCEPTANCE_TOKEN_SCHEMA_VERSION} with pass=true"
        )));
    }
    Ok(token)
}

/// The token must sit in the attempt directory its provenance names, and the
/// provenance paths must follow the attempt layout.
fn verify_layout(token_path: &Path, token: &AcceptanceToken) -> Result<AttemptPaths> {
    let resolved = canonical(token_path)?;
    let actual_dir = resolved
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| invalid(format!("token path has no parent: {}", resolved.display())))?;
    let claimed_dir = canonical(Path::new(&token.provenance.attempt_dir))?;
    if actual_dir != claimed_dir {
        return Err(invalid(format!(
            "token lives in {} but claims attempt_dir {}",
            actual_dir.display(),
            claimed_dir.display()
        )));
    }

    let claimed = AttemptPaths::from_dir(&token.provenance.attempt_dir);
    let provenance = &token.provenance;
    for (name, value, expected) in [
        ("evidence_root", &provenance.evidence_root, &claimed.evidence_root),
        ("manifest_path", &provenance.manifest_path, &claimed.manifest_path),
        ("receipt_path", &provenance.receipt_path, &claimed.receipt_path),
    ] {
        if Path::new(value) != expected.as_path() {
            return Err(invalid(format!(
                "provenance {name} {value} does not match attempt layout {}",
                expected.display()
            )));
        }
    }
    if actual_dir.file_name() != Some(OsStr::new(&token.attempt_id)) {
        return Err(invalid(format!(
            "token attempt_id {} does not match directory {}",
            token.attempt_id,
            actual_dir.display()
        )));
    }
    Ok(AttemptPaths::from_dir(actual_dir))
}

fn canonical(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map_err(|err| invalid(format!("resolve {}: {err}", path.display())))
}

fn hash(path: &Path) -> Result<String> {
    sha256_file(path).map_err(|err| invalid(format!("{err:#}")))
}

fn invalid(message: String) -> anyhow::Error {
    GateError::new(Code::AcceptanceTokenInvalid, message).into()
}
