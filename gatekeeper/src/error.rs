//! Coded failures raised by gates, the acceptor and the workspace lock.
//!
//! These travel inside `anyhow::Error`; callers that need the code recover it
//! with `err.downcast_ref::<GateError>()`. Anything that is not a `GateError`
//! is treated as a validator defect.

use thiserror::Error;

use crate::core::codes::{Code, NextAction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct GateError {
    pub code: Code,
    pub message: String,
    /// Overrides the code's default next action (e.g. `REGENERATE_RECEIPT`).
    pub next_action: Option<NextAction>,
}

impl GateError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            next_action: None,
        }
    }

    pub fn with_next_action(mut self, next_action: NextAction) -> Self {
        self.next_action = Some(next_action);
        self
    }

    pub fn next_action(&self) -> NextAction {
        self.next_action
            .unwrap_or_else(|| self.code.spec().default_next_action)
    }
}

/// Extract the coded failure from an error chain, if there is one.
pub fn gate_error(err: &anyhow::Error) -> Option<&GateError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GateError>())
}
