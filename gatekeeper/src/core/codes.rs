//! Stable validation codes and their exit-code mapping.
//!
//! Every failure path looks its code up here instead of hard-coding exit codes.
//! Exit codes are namespaced: 10-19 preflight, 30-39 postflight/evidence,
//! 90-99 internal (validator defects and trusted-input problems).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether the retry policy may start another attempt after this failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Retryable,
    Terminal,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "RETRYABLE",
            Self::Terminal => "TERMINAL",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate that owns a code, and the gate names used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    Preflight,
    Postflight,
    Acceptor,
    Internal,
}

impl Gate {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Postflight => "postflight",
            Self::Acceptor => "acceptor",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation the caller should take next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    None,
    HaltDirtyRepo,
    EscalateToOperator,
    HaltSchemaDrift,
    RecaptureEvidence,
    RegenerateReceipt,
    HaltValidatorBug,
}

impl NextAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::HaltDirtyRepo => "HALT_DIRTY_REPO",
            Self::EscalateToOperator => "ESCALATE_TO_OPERATOR",
            Self::HaltSchemaDrift => "HALT_SCHEMA_DRIFT",
            Self::RecaptureEvidence => "RECAPTURE_EVIDENCE",
            Self::RegenerateReceipt => "REGENERATE_RECEIPT",
            Self::HaltValidatorBug => "HALT_VALIDATOR_BUG",
        }
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of validation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    DirtyRepoPre,
    ConcurrentRunDetected,
    EvidenceRootNotIgnored,
    DirtyRepoPost,
    EvidenceMissingRequiredFile,
    EvidenceHashMismatch,
    EvidenceOrphanFile,
    JobSpecInvalid,
    ValidatorCrash,
    AcceptanceTokenInvalid,
    JobSpecTampered,
}

/// Static description of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeSpec {
    pub code: Code,
    pub exit_code: i32,
    pub classification: Classification,
    pub default_next_action: NextAction,
    pub gate: Gate,
}

impl Code {
    pub const ALL: [Code; 11] = [
        Code::DirtyRepoPre,
        Code::ConcurrentRunDetected,
        Code::EvidenceRootNotIgnored,
        Code::DirtyRepoPost,
        Code::EvidenceMissingRequiredFile,
        Code::EvidenceHashMismatch,
        Code::EvidenceOrphanFile,
        Code::JobSpecInvalid,
        Code::ValidatorCrash,
        Code::AcceptanceTokenInvalid,
        Code::JobSpecTampered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirtyRepoPre => "DIRTY_REPO_PRE",
            Self::ConcurrentRunDetected => "CONCURRENT_RUN_DETECTED",
            Self::EvidenceRootNotIgnored => "EVIDENCE_ROOT_NOT_IGNORED",
            Self::DirtyRepoPost => "DIRTY_REPO_POST",
            Self::EvidenceMissingRequiredFile => "EVIDENCE_MISSING_REQUIRED_FILE",
            Self::EvidenceHashMismatch => "EVIDENCE_HASH_MISMATCH",
            Self::EvidenceOrphanFile => "EVIDENCE_ORPHAN_FILE",
            Self::JobSpecInvalid => "JOB_SPEC_INVALID",
            Self::ValidatorCrash => "VALIDATOR_CRASH",
            Self::AcceptanceTokenInvalid => "ACCEPTANCE_TOKEN_INVALID",
            Self::JobSpecTampered => "JOB_SPEC_TAMPERED",
        }
    }

    pub fn spec(self) -> CodeSpec {
        use Classification::{Retryable, Terminal};

        let (exit_code, classification, default_next_action, gate) = match self {
            Self::DirtyRepoPre => (10, Terminal, NextAction::HaltDirtyRepo, Gate::Preflight),
            Self::ConcurrentRunDetected => (
                11,
                Terminal,
                NextAction::EscalateToOperator,
                Gate::Preflight,
            ),
            Self::EvidenceRootNotIgnored => {
                (12, Terminal, NextAction::HaltSchemaDrift, Gate::Preflight)
            }
            Self::DirtyRepoPost => (30, Terminal, NextAction::HaltDirtyRepo, Gate::Postflight),
            Self::EvidenceMissingRequiredFile => (
                31,
                Retryable,
                NextAction::RecaptureEvidence,
                Gate::Postflight,
            ),
            Self::EvidenceHashMismatch => (
                32,
                Retryable,
                NextAction::RecaptureEvidence,
                Gate::Postflight,
            ),
            Self::EvidenceOrphanFile => (
                33,
                Retryable,
                NextAction::RecaptureEvidence,
                Gate::Postflight,
            ),
            Self::JobSpecInvalid => (90, Terminal, NextAction::HaltSchemaDrift, Gate::Internal),
            Self::ValidatorCrash => (91, Terminal, NextAction::HaltValidatorBug, Gate::Internal),
            Self::AcceptanceTokenInvalid => {
                (92, Terminal, NextAction::HaltValidatorBug, Gate::Internal)
            }
            Self::JobSpecTampered => (93, Terminal, NextAction::HaltSchemaDrift, Gate::Internal),
        };
        CodeSpec {
            code: self,
            exit_code,
            classification,
            default_next_action,
            gate,
        }
    }

    pub fn classification(self) -> Classification {
        self.spec().classification
    }

    pub fn exit_code(self) -> i32 {
        self.spec().exit_code
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a code string is not part of the table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown validation code: {0}")]
pub struct UnknownCodeError(pub String);

impl FromStr for Code {
    type Err = UnknownCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Code::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownCodeError(s.to_string()))
    }
}
