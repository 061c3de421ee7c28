use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

pub const DEFAULT_HEARTBEAT_MS: u64 = 1_000;
pub const DEFAULT_LIVENESS_MS: u64 = 3_000;
pub const DEFAULT_DELTA_LOG_CAPACITY: usize = 64;
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Timing and retry knobs shared by every tab of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub heartbeat_interval_ms: u64,
    /// A tab silent for longer than this is considered gone.
    pub liveness_timeout_ms: u64,
    /// Deltas kept in the channel before followers must fall back to a snapshot.
    pub delta_log_capacity: usize,
    /// Attempts before a connection or resource failure is shown to the user.
    pub retry_budget: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_MS,
            liveness_timeout_ms: DEFAULT_LIVENESS_MS,
            delta_log_capacity: DEFAULT_DELTA_LOG_CAPACITY,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

impl MeshConfig {
    /// Defaults, then the YAML file (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub(crate) fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_env(&lookup, "TABMESH_HEARTBEAT_MS")? {
            self.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = parse_env(&lookup, "TABMESH_LIVENESS_MS")? {
            self.liveness_timeout_ms = ms;
        }
        if let Some(budget) = parse_env(&lookup, "TABMESH_RETRY_BUDGET")? {
            self.retry_budget = budget;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.liveness_timeout_ms < self.heartbeat_interval_ms.saturating_mul(2) {
            return Err(MeshError::InvalidConfig(format!(
                "liveness_timeout_ms ({}) must be at least twice heartbeat_interval_ms ({})",
                self.liveness_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.delta_log_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "delta_log_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| MeshError::InvalidConfig(format!("{key}={raw} is not a valid number")))
}
