//! Git adapter for the gates.
//!
//! Cleanliness and ignore proofs both come from git itself, so we keep a small,
//! explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Raw porcelain status, including untracked files.
    pub fn status_porcelain_raw(&self) -> Result<String> {
        self.run_capture(&["status", "--porcelain=v1", "-uall"])
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.status_porcelain_raw()?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Paths changed relative to HEAD (tracked files only).
    pub fn diff_name_only(&self) -> Result<String> {
        self.run_capture(&["diff", "--name-only", "HEAD"])
    }

    /// Ensure the worktree is fully clean (including untracked files).
    ///
    /// The error message lists every offending entry.
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// True if git ignores `path` (relative to the workdir).
    ///
    /// `git check-ignore -q` exits 0 when ignored, 1 when not; anything else
    /// is an error rather than a "no".
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn is_ignored(&self, path: &Path) -> Result<bool> {
        let arg = path.to_string_lossy();
        let output = self.run(&["check-ignore", "-q", "--", arg.as_ref()])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(anyhow!(
                    "git check-ignore {} failed ({other:?}): {}",
                    path.display(),
                    stderr.trim()
                ))
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    let parts = line
        .split_at_checked(2)
        .and_then(|(code, rest)| Some((code, rest.get(1..)?)));
    let Some((code, rest)) = parts.filter(|(_, rest)| !rest.is_empty()) else {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    };
    // Renames and copies report `old -> new`; the new path is what is on disk.
    let path = rest.rsplit_once(" -> ").map_or(rest, |(_, new)| new).trim();
    Ok(StatusEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_porcelain_lines() {
        for (line, code, path) in [
            ("?? foo.txt", "??", "foo.txt"),
            (" M src/main.rs", " M", "src/main.rs"),
            ("R  old.txt -> new.txt", "R ", "new.txt"),
            ("A  artifacts/a b.txt", "A ", "artifacts/a b.txt"),
        ] {
            let entry = parse_status_line(line).expect("parse");
            assert_eq!(entry.code, code, "{line}");
            assert_eq!(entry.path, path, "{line}");
        }
        assert!(parse_status_line("M").is_err());
    }

    #[test]
    fn ensure_clean_lists_dirty_entries() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.ensure_clean().expect("fresh repo is clean");

        repo.write("untracked.txt", "x").expect("write");
        let err = git.ensure_clean().unwrap_err();
        assert!(err.to_string().contains("?? untracked.txt"), "{err}");
    }

    #[test]
    fn ignored_paths_are_reported() {
        let repo = TestRepo::new().expect("repo");
        let evidence = Path::new("artifacts/validation_runs/run-1/attempt-0001/evidence");
        std::fs::create_dir_all(repo.path().join(evidence)).expect("mkdir");
        let git = Git::new(repo.path());
        assert!(git.is_ignored(evidence).expect("check ignore"));
        assert!(!git.is_ignored(Path::new("tracked.txt")).expect("check ignore"));
    }

    #[test]
    fn head_sha_is_full_length() {
        let repo = TestRepo::new().expect("repo");
        let sha = Git::new(repo.path()).head_sha().expect("head");
        assert_eq!(sha.len(), 40);
    }
}
