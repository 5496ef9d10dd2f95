//! Agent configuration (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Agent configuration.
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory builds run in; the default working directory of every tree.
    pub sandbox_dir: PathBuf,

    /// Root of the local artifact store.
    pub artifacts_dir: PathBuf,

    /// How often to poll external processes for exit, in milliseconds.
    pub process_poll_interval_ms: u64,

    /// Environment variables seeded into every build session.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sandbox_dir: PathBuf::from("sandbox"),
            artifacts_dir: PathBuf::from("artifacts"),
            process_poll_interval_ms: 20,
            env: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.process_poll_interval_ms == 0 {
            return Err(anyhow!("process_poll_interval_ms must be > 0"));
        }
        if self.sandbox_dir.as_os_str().is_empty() {
            return Err(anyhow!("sandbox_dir must not be empty"));
        }
        if self.artifacts_dir.as_os_str().is_empty() {
            return Err(anyhow!("artifacts_dir must not be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.process_poll_interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent.toml");
        fs::write(&path, "process_poll_interval_ms = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.process_poll_interval_ms, 5);
        assert_eq!(cfg.sandbox_dir, PathBuf::from("sandbox"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent.toml");
        fs::write(&path, "process_poll_interval_ms = 0\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
