//! Remote housekeeping operations: identity, backoff and outcome rules.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const OP_TYPE_DELETE_REMOTE_BRANCH: &str = "DELETE_REMOTE_BRANCH";
pub const BLOCKED_DNS: &str = "dns_or_name_resolution_failure";

/// Attempts after which a non-DNS failure stops being retried.
pub const TERMINAL_AFTER_ATTEMPTS: u32 = 4;

static DNS_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)could not resolve hostname|name resolution").expect("valid DNS pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteOpStatus {
    Pending,
    Deferred,
    Done,
    Terminal,
}

/// One queued operation. Never deleted, only moved between statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOp {
    pub op_id: String,
    pub op_type: String,
    pub target: String,
    pub created_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: RemoteOpStatus,
}

impl RemoteOp {
    pub fn pending(op_type: &str, target: &str, now: DateTime<Utc>) -> Self {
        let created_at = timestamp(now);
        Self {
            op_id: op_id_for(op_type, target),
            op_type: op_type.to_string(),
            target: target.to_string(),
            created_at: created_at.clone(),
            attempts: 0,
            next_attempt_at: Some(created_at),
            last_error: None,
            status: RemoteOpStatus::Pending,
        }
    }
}

/// Result of running the external command once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub error_text: String,
}

/// Stable id derived from the operation type and its target.
pub fn op_id_for(op_type: &str, target: &str) -> String {
    let digest = hex::encode(Sha256::digest(format!("{op_type}:{target}").as_bytes()));
    format!("op-{}", &digest[..16])
}

/// 5m, 15m, 45m, then a flat 24h.
pub fn backoff_for_attempt(attempts: u32) -> Duration {
    match attempts {
        0 | 1 => Duration::minutes(5),
        2 => Duration::minutes(15),
        3 => Duration::minutes(45),
        _ => Duration::hours(24),
    }
}

pub fn looks_like_dns_failure(error_text: &str) -> bool {
    DNS_FAILURE.is_match(error_text)
}

/// Fold one command outcome into the op. Returns the updated op, the blocked
/// reason (if any) and whether an operator must step in.
pub fn apply_outcome(
    prior: &RemoteOp,
    outcome: &CommandOutcome,
    now: DateTime<Utc>,
) -> (RemoteOp, Option<&'static str>, bool) {
    let attempts = prior.attempts + 1;
    let mut updated = RemoteOp {
        attempts,
        ..prior.clone()
    };

    if outcome.exit_code == 0 {
        updated.status = RemoteOpStatus::Done;
        updated.next_attempt_at = None;
        updated.last_error = None;
        return (updated, None, false);
    }

    updated.last_error = Some(outcome.error_text.clone());
    if looks_like_dns_failure(&outcome.error_text) {
        updated.status = RemoteOpStatus::Deferred;
        updated.next_attempt_at = Some(timestamp(now + backoff_for_attempt(attempts)));
        return (updated, Some(BLOCKED_DNS), false);
    }
    if attempts >= TERMINAL_AFTER_ATTEMPTS {
        updated.status = RemoteOpStatus::Terminal;
        updated.next_attempt_at = None;
        return (updated, None, true);
    }
    updated.status = RemoteOpStatus::Deferred;
    updated.next_attempt_at = Some(timestamp(now + backoff_for_attempt(attempts)));
    (updated, None, false)
}

/// Insert or replace by `op_id`, keeping the list sorted by `op_id`.
pub fn upsert(ops: &mut Vec<RemoteOp>, op: RemoteOp) {
    ops.retain(|existing| existing.op_id != op.op_id);
    ops.push(op);
    ops.sort_by(|a, b| a.op_id.cmp(&b.op_id));
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).single().expect("valid time")
    }

    fn failure(text: &str) -> CommandOutcome {
        CommandOutcome {
            exit_code: 128,
            error_text: text.to_string(),
        }
    }

    #[test]
    fn op_id_is_stable_per_type_and_target() {
        let a = op_id_for(OP_TYPE_DELETE_REMOTE_BRANCH, "feature/x");
        let b = op_id_for(OP_TYPE_DELETE_REMOTE_BRANCH, "feature/x");
        let c = op_id_for(OP_TYPE_DELETE_REMOTE_BRANCH, "feature/y");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("op-"));
        assert_eq!(a.len(), 3 + 16);
    }

    #[test]
    fn backoff_schedule_caps_at_a_day() {
        assert_eq!(backoff_for_attempt(1), Duration::minutes(5));
        assert_eq!(backoff_for_attempt(2), Duration::minutes(15));
        assert_eq!(backoff_for_attempt(3), Duration::minutes(45));
        assert_eq!(backoff_for_attempt(4), Duration::hours(24));
        assert_eq!(backoff_for_attempt(40), Duration::hours(24));
    }

    #[test]
    fn dns_match_is_case_insensitive() {
        assert!(looks_like_dns_failure(
            "ssh: Could not resolve hostname github.com: Temporary failure"
        ));
        assert!(looks_like_dns_failure("Temporary failure in NAME RESOLUTION"));
        assert!(!looks_like_dns_failure("remote ref does not exist"));
    }

    #[test]
    fn dns_failure_defers_with_backoff() {
        let prior = RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "b", fixed_now());
        let (updated, blocked, escalate) = apply_outcome(
            &prior,
            &failure("Could not resolve hostname github.com"),
            fixed_now(),
        );
        assert_eq!(updated.status, RemoteOpStatus::Deferred);
        assert_eq!(blocked, Some(BLOCKED_DNS));
        assert!(!escalate);
        assert_eq!(
            updated.next_attempt_at.as_deref(),
            Some("2026-02-10T12:05:00+00:00")
        );
    }

    #[test]
    fn dns_failures_never_escalate() {
        let mut op = RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "b", fixed_now());
        for _ in 0..5 {
            let (updated, blocked, escalate) =
                apply_outcome(&op, &failure("name resolution failed"), fixed_now());
            assert_eq!(blocked, Some(BLOCKED_DNS));
            assert!(!escalate);
            op = updated;
        }
        assert_eq!(op.status, RemoteOpStatus::Deferred);
        assert_eq!(
            op.next_attempt_at.as_deref(),
            Some("2026-02-11T12:00:00+00:00")
        );
    }

    #[test]
    fn fourth_plain_failure_is_terminal() {
        let mut op = RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "b", fixed_now());
        let mut statuses = Vec::new();
        let mut escalations = Vec::new();
        for _ in 0..4 {
            let (updated, _, escalate) =
                apply_outcome(&op, &failure("permission denied"), fixed_now());
            statuses.push(updated.status);
            escalations.push(escalate);
            op = updated;
        }
        assert_eq!(
            statuses,
            vec![
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Deferred,
                RemoteOpStatus::Terminal,
            ]
        );
        assert_eq!(escalations, vec![false, false, false, true]);
        assert_eq!(op.next_attempt_at, None);
    }

    #[test]
    fn success_clears_schedule_and_error() {
        let mut prior = RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "b", fixed_now());
        prior.last_error = Some("earlier".to_string());
        let (updated, blocked, escalate) = apply_outcome(
            &prior,
            &CommandOutcome {
                exit_code: 0,
                error_text: String::new(),
            },
            fixed_now(),
        );
        assert_eq!(updated.status, RemoteOpStatus::Done);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.next_attempt_at, None);
        assert_eq!(updated.last_error, None);
        assert_eq!(blocked, None);
        assert!(!escalate);
    }

    #[test]
    fn upsert_replaces_and_sorts() {
        let now = fixed_now();
        let mut ops = vec![
            RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "zeta", now),
            RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "alpha", now),
        ];
        let mut replacement = RemoteOp::pending(OP_TYPE_DELETE_REMOTE_BRANCH, "alpha", now);
        replacement.attempts = 3;
        upsert(&mut ops, replacement);

        assert_eq!(ops.len(), 2);
        assert!(ops[0].op_id < ops[1].op_id);
        let alpha = ops.iter().find(|op| op.target == "alpha").expect("alpha");
        assert_eq!(alpha.attempts, 3);
    }
}
