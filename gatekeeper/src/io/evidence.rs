//! Evidence tier enforcement and manifest compute/verify.
//!
//! The manifest is computed once after the agent returns and verified once in
//! postflight. Any divergence between the manifest and the evidence root is a
//! coded failure; nothing here repairs or deletes evidence.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::core::codes::Code;
use crate::core::job_spec::EvidenceTier;
use crate::error::GateError;
use crate::io::atomic::write_json_atomic;
use crate::io::digest::sha256_file;
use crate::io::layout::MANIFEST_FILENAME;

pub const EVIDENCE_MANIFEST_SCHEMA_VERSION: &str = "evidence_manifest_v1";

const LIGHT_FILES: &[&str] = &[
    "meta.json",
    "exitcode.txt",
    "commands.jsonl",
    MANIFEST_FILENAME,
];
const STANDARD_FILES: &[&str] = &["stdout.txt", "stderr.txt", "git_head.txt", "git_status.txt"];
const FULL_FILES: &[&str] = &["git_diff_name_only.txt"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relpath: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceManifest {
    pub schema_version: String,
    pub files: Vec<ManifestEntry>,
}

/// Relative paths every evidence root of `tier` must contain, plus `extras`.
pub fn required_files_for_tier(tier: EvidenceTier, extras: &[&str]) -> BTreeSet<String> {
    let tiers: &[&[&str]] = match tier {
        EvidenceTier::Light => &[LIGHT_FILES],
        EvidenceTier::Standard => &[LIGHT_FILES, STANDARD_FILES],
        EvidenceTier::Full => &[LIGHT_FILES, STANDARD_FILES, FULL_FILES],
    };
    let mut required: BTreeSet<String> = tiers
        .iter()
        .flat_map(|files| files.iter())
        .map(|rel| (*rel).to_string())
        .collect();
    required.extend(extras.iter().map(|rel| (*rel).to_string()));
    required
}

/// Fail with `EVIDENCE_MISSING_REQUIRED_FILE` listing every missing file.
///
/// Only regular files count; a directory or symlink under a required name is
/// missing.
#[instrument(skip_all, fields(tier = %tier))]
pub fn enforce_evidence_tier(evidence_root: &Path, tier: EvidenceTier, extras: &[&str]) -> Result<()> {
    let missing: Vec<String> = required_files_for_tier(tier, extras)
        .into_iter()
        .filter(|rel| !is_regular_file(&evidence_root.join(rel)))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(GateError::new(
        Code::EvidenceMissingRequiredFile,
        format!("missing required evidence files for tier '{tier}': {missing:?}"),
    )
    .into())
}

/// Hash every file under the evidence root and write the manifest atomically.
#[instrument(skip_all, fields(evidence_root = %evidence_root.display()))]
pub fn compute_manifest(evidence_root: &Path) -> Result<EvidenceManifest> {
    let mut files = Vec::new();
    for rel in evidence_relpaths(evidence_root)? {
        let path = evidence_root.join(&rel);
        let size_bytes = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        files.push(ManifestEntry {
            sha256: sha256_file(&path)?,
            relpath: rel,
            size_bytes,
        });
    }
    files.sort_by(|a, b| a.relpath.cmp(&b.relpath));

    let manifest = EvidenceManifest {
        schema_version: EVIDENCE_MANIFEST_SCHEMA_VERSION.to_string(),
        files,
    };
    write_json_atomic(&evidence_root.join(MANIFEST_FILENAME), &manifest)?;
    debug!(file_count = manifest.files.len(), "computed evidence manifest");
    Ok(manifest)
}

/// Re-derive the evidence root from disk and compare it with the manifest.
#[instrument(skip_all, fields(evidence_root = %evidence_root.display()))]
pub fn verify_manifest(evidence_root: &Path) -> Result<EvidenceManifest> {
    let manifest_path = evidence_root.join(MANIFEST_FILENAME);
    if !manifest_path.exists() {
        return Err(missing(format!("{MANIFEST_FILENAME} is missing")).into());
    }
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("read manifest {}", manifest_path.display()))?;
    let manifest = parse_manifest(&raw)?;

    let mut listed = BTreeSet::new();
    for entry in &manifest.files {
        if !listed.insert(entry.relpath.clone()) {
            return Err(mismatch(format!("duplicate relpath in manifest: {}", entry.relpath)).into());
        }
        let path = evidence_root.join(&entry.relpath);
        if !is_regular_file(&path) {
            return Err(missing(format!("missing evidence file: {}", entry.relpath)).into());
        }
        let actual = sha256_file(&path)?;
        if actual != entry.sha256 {
            return Err(mismatch(format!(
                "hash mismatch for {}: expected {}, got {actual}",
                entry.relpath, entry.sha256
            ))
            .into());
        }
        let size = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        if size != entry.size_bytes {
            return Err(mismatch(format!(
                "size mismatch for {}: expected {}, got {size}",
                entry.relpath, entry.size_bytes
            ))
            .into());
        }
    }

    let orphans: Vec<String> = evidence_relpaths(evidence_root)?
        .into_iter()
        .filter(|rel| !listed.contains(rel))
        .collect();
    if !orphans.is_empty() {
        return Err(orphan(format!("orphan evidence files detected: {orphans:?}")).into());
    }

    debug!(file_count = manifest.files.len(), "evidence manifest verified");
    Ok(manifest)
}

fn parse_manifest(raw: &str) -> Result<EvidenceManifest> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| mismatch(format!("manifest is not valid JSON: {err}")))?;
    if value.get("schema_version").and_then(Value::as_str) != Some(EVIDENCE_MANIFEST_SCHEMA_VERSION) {
        return Err(mismatch("unsupported evidence manifest schema".to_string()).into());
    }
    if !value.get("files").is_some_and(Value::is_array) {
        return Err(mismatch("manifest files must be a list".to_string()).into());
    }
    let manifest: EvidenceManifest = serde_json::from_value(value)
        .map_err(|err| mismatch(format!("manifest entry is malformed: {err}")))?;
    if let Some(entry) = manifest.files.iter().find(|entry| !is_safe_relpath(&entry.relpath)) {
        return Err(mismatch(format!("manifest entry escapes evidence root: {}", entry.relpath)).into());
    }
    Ok(manifest)
}

/// Sorted `/`-separated paths of every file under `evidence_root`, minus the manifest.
///
/// Links are not followed. Anything that is neither a regular file nor a
/// directory (symlinks, sockets, fifos), or whose name is not UTF-8, cannot be
/// hashed faithfully and fails as `EVIDENCE_ORPHAN_FILE`.
fn evidence_relpaths(evidence_root: &Path) -> Result<Vec<String>> {
    let mut relpaths = Vec::new();
    for entry in WalkDir::new(evidence_root).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("walk evidence root {}", evidence_root.display()))?;
        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(evidence_root)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let Some(parts) = rel
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
        else {
            return Err(orphan(format!(
                "evidence file name is not UTF-8: {}",
                rel.display()
            ))
            .into());
        };
        let rel = parts.join("/");
        if !entry.file_type().is_file() {
            return Err(orphan(format!("evidence entry is not a regular file: {rel}")).into());
        }
        if rel == MANIFEST_FILENAME {
            continue;
        }
        relpaths.push(rel);
    }
    relpaths.sort();
    Ok(relpaths)
}

fn is_regular_file(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_file())
}

fn is_safe_relpath(relpath: &str) -> bool {
    !relpath.is_empty()
        && Path::new(relpath)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn missing(message: String) -> GateError {
    GateError::new(Code::EvidenceMissingRequiredFile, message)
}

fn mismatch(message: String) -> GateError {
    GateError::new(Code::EvidenceHashMismatch, message)
}

fn orphan(message: String) -> GateError {
    GateError::new(Code::EvidenceOrphanFile, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::gate_error;
    use crate::test_support::write_light_evidence;

    fn code_of(err: &anyhow::Error) -> Code {
        gate_error(err).expect("gate error").code
    }

    #[test]
    fn tiers_are_cumulative() {
        let light = required_files_for_tier(EvidenceTier::Light, &[]);
        let standard = required_files_for_tier(EvidenceTier::Standard, &[]);
        let full = required_files_for_tier(EvidenceTier::Full, &["extra.txt"]);

        assert_eq!(light.len(), 4);
        assert!(light.is_subset(&standard));
        assert!(standard.is_subset(&full));
        assert!(full.contains("git_diff_name_only.txt"));
        assert!(full.contains("extra.txt"));
    }

    #[test]
    fn enforce_tier_reports_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        fs::remove_file(temp.path().join("exitcode.txt")).expect("remove");

        let err = enforce_evidence_tier(temp.path(), EvidenceTier::Light, &[]).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceMissingRequiredFile);
        assert!(err.to_string().contains("exitcode.txt"));
    }

    #[test]
    fn compute_then_verify_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        fs::create_dir_all(temp.path().join("logs")).expect("mkdir");
        fs::write(temp.path().join("logs/run.log"), "ok\n").expect("write");

        let computed = compute_manifest(temp.path()).expect("compute");
        let relpaths: Vec<&str> = computed.files.iter().map(|e| e.relpath.as_str()).collect();
        assert_eq!(
            relpaths,
            vec!["commands.jsonl", "exitcode.txt", "logs/run.log", "meta.json"]
        );

        let verified = verify_manifest(temp.path()).expect("verify");
        assert_eq!(verified, computed);
    }

    #[test]
    fn mutated_file_is_hash_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        compute_manifest(temp.path()).expect("compute");
        fs::write(temp.path().join("exitcode.txt"), "1\n").expect("mutate");

        let err = verify_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceHashMismatch);
    }

    #[test]
    fn added_file_is_orphan() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        compute_manifest(temp.path()).expect("compute");
        fs::write(temp.path().join("late.txt"), "late").expect("write");

        let err = verify_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceOrphanFile);
        assert!(err.to_string().contains("late.txt"));
    }

    #[test]
    fn deleted_file_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        compute_manifest(temp.path()).expect("compute");
        fs::remove_file(temp.path().join("meta.json")).expect("remove");

        let err = verify_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceMissingRequiredFile);
    }

    #[test]
    fn missing_manifest_is_missing_required_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = verify_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceMissingRequiredFile);
    }

    #[test]
    fn duplicate_relpath_is_hash_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        let mut manifest = compute_manifest(temp.path()).expect("compute");
        manifest.files.push(manifest.files[0].clone());
        write_json_atomic(&temp.path().join(MANIFEST_FILENAME), &manifest).expect("rewrite");

        let err = verify_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceHashMismatch);
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn malformed_manifests_are_hash_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manifest_path = temp.path().join(MANIFEST_FILENAME);
        for raw in [
            "not json",
            r#"{"schema_version":"evidence_manifest_v0","files":[]}"#,
            r#"{"schema_version":"evidence_manifest_v1","files":{}}"#,
            r#"{"schema_version":"evidence_manifest_v1","files":[{"relpath":1}]}"#,
            r#"{"schema_version":"evidence_manifest_v1","files":[{"relpath":"../x","sha256":"00","size_bytes":0}]}"#,
        ] {
            fs::write(&manifest_path, raw).expect("write manifest");
            let err = verify_manifest(temp.path()).unwrap_err();
            assert_eq!(code_of(&err), Code::EvidenceHashMismatch, "{raw}");
        }
    }

    #[test]
    fn directory_under_required_name_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        fs::remove_file(temp.path().join("exitcode.txt")).expect("remove");
        fs::create_dir(temp.path().join("exitcode.txt")).expect("mkdir");

        let err = enforce_evidence_tier(temp.path(), EvidenceTier::Light, &[]).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceMissingRequiredFile);
        assert!(err.to_string().contains("exitcode.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_evidence_fails_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let evidence = temp.path().join("evidence");
        write_light_evidence(&evidence).expect("evidence");
        let outside = temp.path().join("outside.txt");
        fs::write(&outside, "0\n").expect("outside");
        fs::remove_file(evidence.join("exitcode.txt")).expect("remove");
        std::os::unix::fs::symlink(&outside, evidence.join("exitcode.txt")).expect("symlink");

        let err = enforce_evidence_tier(&evidence, EvidenceTier::Light, &[]).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceMissingRequiredFile);

        let err = compute_manifest(&evidence).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceOrphanFile);
        assert!(err.to_string().contains("exitcode.txt"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_added_after_manifest_is_orphan() {
        let temp = tempfile::tempdir().expect("tempdir");
        let evidence = temp.path().join("evidence");
        write_light_evidence(&evidence).expect("evidence");
        compute_manifest(&evidence).expect("compute");
        let outside = temp.path().join("outside.txt");
        fs::write(&outside, "mutable").expect("outside");
        std::os::unix::fs::symlink(&outside, evidence.join("late.txt")).expect("symlink");

        let err = verify_manifest(&evidence).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceOrphanFile);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_file_name_is_orphan() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempfile::tempdir().expect("tempdir");
        write_light_evidence(temp.path()).expect("evidence");
        fs::write(temp.path().join(OsStr::from_bytes(b"bad-\xff.txt")), "x").expect("write");

        let err = compute_manifest(temp.path()).unwrap_err();
        assert_eq!(code_of(&err), Code::EvidenceOrphanFile);
        assert!(err.to_string().contains("not UTF-8"), "{err}");
    }
}
