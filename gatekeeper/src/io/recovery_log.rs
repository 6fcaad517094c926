//! Append-only `recovery_log.jsonl`: one line per gate transition.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::codes::{Classification, Gate, NextAction};

/// Code column of a successful terminal transition.
pub const SUCCESS_CODE: &str = "SUCCESS";
pub const PREFLIGHT_PASSED_CODE: &str = "OK";
pub const PREFLIGHT_TERMINAL_POLICY: &str = "all_preflight_failures_terminal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub timestamp: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    pub gate: Gate,
    pub code: String,
    /// Absent for a passed preflight, which has no entry in the code table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    pub next_action: NextAction,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_error: Option<String>,
}

/// Append one compact JSON line. Existing lines are never rewritten.
pub fn append_recovery_event(path: &Path, event: &RecoveryEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(event).context("serialize recovery event")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open recovery log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append recovery log {}", path.display()))
}

pub fn read_recovery_log(path: &Path) -> Result<Vec<RecoveryEvent>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read recovery log {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse recovery log line {}", idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(attempt_index: u32, terminal: bool) -> RecoveryEvent {
        RecoveryEvent {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            attempt_id: format!("attempt-{attempt_index:04}"),
            attempt_index,
            gate: Gate::Postflight,
            code: "EVIDENCE_HASH_MISMATCH".to_string(),
            classification: Some(Classification::Retryable),
            next_action: NextAction::RecaptureEvidence,
            terminal,
            policy: None,
            terminal_reason: None,
            agent_error: None,
        }
    }

    #[test]
    fn appends_lines_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run/recovery_log.jsonl");

        append_recovery_event(&path, &event(1, false)).expect("append 1");
        append_recovery_event(&path, &event(2, true)).expect("append 2");

        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 2);
        assert!(!raw.contains("terminal_reason"), "absent options are omitted");

        let events = read_recovery_log(&path).expect("parse");
        assert_eq!(events, vec![event(1, false), event(2, true)]);
    }
}
