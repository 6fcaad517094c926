//! Gatekeeper configuration stored in `gatekeeper.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::job_spec::RetryCaps;
use crate::io::atomic::write_atomic;
use crate::io::lock::DEFAULT_LOCK_TTL_SECS;

pub const CONFIG_FILENAME: &str = "gatekeeper.toml";

/// Gatekeeper configuration (TOML).
///
/// Loaded once by the caller and passed down explicitly. Missing fields take
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Stamped into every job spec and acceptance token.
    pub gate_pipeline_version: String,

    /// Age after which a lock with a dead holder may be reclaimed.
    pub lock_ttl_secs: u64,

    /// Postflight fails unless the agent wrote `receipt.json`.
    pub receipt_required: bool,

    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub remote_ops: RemoteOpsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts_per_gate_per_run: u32,
    pub max_total_attempts_per_run: u32,
    pub max_consecutive_same_failure_code: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Wall-clock budget for one agent command.
    pub timeout_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteOpsConfig {
    pub remote: String,
    pub timeout_secs: u64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            gate_pipeline_version: "gates-v1".to_string(),
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            receipt_required: false,
            retry: RetryConfig::default(),
            agent: AgentConfig::default(),
            remote_ops: RemoteOpsConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let caps = RetryCaps::default();
        Self {
            max_attempts_per_gate_per_run: caps.max_attempts_per_gate_per_run,
            max_total_attempts_per_run: caps.max_total_attempts_per_run,
            max_consecutive_same_failure_code: caps.max_consecutive_same_failure_code,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for RemoteOpsConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            timeout_secs: 20,
        }
    }
}

impl RetryConfig {
    pub fn caps(&self) -> RetryCaps {
        RetryCaps::new(
            self.max_attempts_per_gate_per_run,
            self.max_total_attempts_per_run,
            self.max_consecutive_same_failure_code,
        )
    }
}

impl GatekeeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gate_pipeline_version.trim().is_empty() {
            return Err(anyhow!("gate_pipeline_version must be non-empty"));
        }
        if self.lock_ttl_secs == 0 {
            return Err(anyhow!("lock_ttl_secs must be > 0"));
        }
        self.retry
            .caps()
            .validate()
            .map_err(|err| anyhow!("retry: {}", err.message))?;
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.remote_ops.remote.trim().is_empty() {
            return Err(anyhow!("remote_ops.remote must be non-empty"));
        }
        if self.remote_ops.timeout_secs == 0 {
            return Err(anyhow!("remote_ops.timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GatekeeperConfig::default()`.
pub fn load_config(path: &Path) -> Result<GatekeeperConfig> {
    if !path.exists() {
        let cfg = GatekeeperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GatekeeperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &GatekeeperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
