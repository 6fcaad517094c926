//! Process exit codes for gatekeeper CLI commands.
//!
//! Gate failures exit with the taxonomy code of the failure (10-19 preflight,
//! 30-39 postflight, 90-99 internal). The values below cover everything else.

/// Command succeeded (run accepted, token accepted, manifest verified).
pub const OK: i32 = 0;
/// Usage, configuration or infrastructure error without a validation code.
pub const INVALID: i32 = 1;
