//! I/O helpers for the gates, the acceptor and the orchestrator.

pub mod agent;
pub mod atomic;
pub mod cleanliness;
pub mod config;
pub mod digest;
pub mod evidence;
pub mod git;
pub mod job_spec_store;
pub mod layout;
pub mod lock;
pub mod process;
pub mod recovery_log;
pub mod remote_ops;
pub mod schema;
