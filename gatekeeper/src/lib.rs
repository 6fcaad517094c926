//! Validation gatekeeper for untrusted build attempts.
//!
//! An agent may write files, run commands and fail unpredictably. The
//! gatekeeper runs it inside a retry-governed attempt loop and only accepts an
//! attempt whose evidence passes fixed, auditable gates:
//!
//! - **[`core`]**: Pure, deterministic logic (code taxonomy, job spec, retry
//!   policy, verdict types, remote-op rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, hashing, process
//!   execution, the workspace lock). Isolated behind traits where tests need
//!   to script them.
//!
//! Orchestration modules ([`gate`], [`acceptor`], [`orchestrator`]) compose
//! the two into preflight/postflight gates, token re-verification and the
//! attempt loop.

pub mod acceptor;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
