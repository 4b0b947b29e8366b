//! Simulator configuration.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Result, SimError};

pub const DEFAULT_MAX_SETTLE_EVALS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Upper bound on combinational block evaluations in one settle.
    pub max_settle_evals: usize,
    pub backend: Backend,
    /// Where the native backend keeps compiled libraries; the system temp
    /// directory when unset.
    pub native_cache_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_settle_evals: DEFAULT_MAX_SETTLE_EVALS,
            backend: Backend::Interpreted,
            native_cache_dir: None,
        }
    }
}

impl SimConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `CYCLE_SIM_BACKEND` and `CYCLE_SIM_MAX_SETTLE_EVALS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(backend) = env::var("CYCLE_SIM_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Ok(limit) = env::var("CYCLE_SIM_MAX_SETTLE_EVALS") {
            config.max_settle_evals = limit.trim().parse().map_err(|_| {
                SimError::Parse(format!("CYCLE_SIM_MAX_SETTLE_EVALS: `{}` is not a count", limit))
            })?;
        }
        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_settle_evals(mut self, limit: usize) -> Self {
        self.max_settle_evals = limit;
        self
    }
}
