//! Workspace cleanliness and ignore proofs.
//!
//! Both checks fail closed: if git cannot answer, the workspace is treated as
//! dirty (or the output roots as not ignored).

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::codes::Code;
use crate::error::GateError;
use crate::io::git::Git;

/// Number of output roots proven ignored: evidence root, attempt dir, run root.
const OUTPUT_ROOT_DEPTH: usize = 3;

/// Fail with `code` (`DIRTY_REPO_PRE` or `DIRTY_REPO_POST`) if the worktree has
/// any tracked change or untracked file.
#[instrument(skip_all, fields(code = %code))]
pub fn verify_repo_clean(workspace_root: &Path, code: Code) -> Result<()> {
    Git::new(workspace_root)
        .ensure_clean()
        .map_err(|err| GateError::new(code, format!("{err:#}")))?;
    Ok(())
}

/// Prove the evidence root and its attempt and run directories are ignored.
///
/// Checking only the innermost directory is not enough: an unignored ancestor
/// still dirties the tree once anything is written into it.
#[instrument(skip_all, fields(evidence_root = %evidence_root.display()))]
pub fn verify_output_roots_ignored(workspace_root: &Path, evidence_root: &Path) -> Result<()> {
    let git = Git::new(workspace_root);
    for root in output_roots(evidence_root) {
        let Ok(relative) = root.strip_prefix(workspace_root) else {
            return Err(not_ignored(format!(
                "output root {} is outside workspace {}",
                root.display(),
                workspace_root.display()
            ))
            .into());
        };
        if relative.as_os_str().is_empty() {
            return Err(not_ignored("output root must not be the workspace root".to_string()).into());
        }
        match git.is_ignored(relative) {
            Ok(true) => debug!(path = %relative.display(), "output root ignored"),
            Ok(false) => {
                warn!(path = %relative.display(), "output root not ignored");
                return Err(not_ignored(format!(
                    "output root is not ignored by git: {}",
                    relative.display()
                ))
                .into());
            }
            Err(err) => {
                return Err(not_ignored(format!(
                    "cannot prove {} is ignored: {err:#}",
                    relative.display()
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn output_roots(evidence_root: &Path) -> Vec<PathBuf> {
    evidence_root
        .ancestors()
        .take(OUTPUT_ROOT_DEPTH)
        .map(Path::to_path_buf)
        .collect()
}

fn not_ignored(message: String) -> GateError {
    GateError::new(Code::EvidenceRootNotIgnored, message)
}
