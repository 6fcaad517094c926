//! Deterministic, pure logic shared by the gatekeeper.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod attempts;
pub mod codes;
pub mod job_spec;
pub mod remote_op;
pub mod report;
