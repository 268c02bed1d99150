//! Reconciler tuning knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tick and timeout of one bounded state-transition poll, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub tick_ms: u64,
    pub timeout_ms: u64,
}

impl PollSettings {
    pub const fn from_secs(tick: u64, timeout: u64) -> Self {
        Self {
            tick_ms: tick * 1000,
            timeout_ms: timeout * 1000,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Revisit interval returned when a pass made partial progress.
    pub requeue_after_ms: u64,
    /// Upper bound for one whole reconciliation pass.
    pub pass_deadline_ms: u64,
    pub vm_running_poll: PollSettings,
    pub volume_state_poll: PollSettings,
    pub lb_deregister_poll: PollSettings,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            requeue_after_ms: 30_000,
            pass_deadline_ms: 600_000,
            vm_running_poll: PollSettings::from_secs(20, 240),
            volume_state_poll: PollSettings::from_secs(20, 240),
            lb_deregister_poll: PollSettings::from_secs(20, 120),
        }
    }
}

impl ReconcilerConfig {
    pub fn requeue_after(&self) -> Duration {
        Duration::from_millis(self.requeue_after_ms)
    }

    pub fn pass_deadline(&self) -> Duration {
        Duration::from_millis(self.pass_deadline_ms)
    }

    /// Short ticks and timeouts, used by `simulate` and tests.
    pub fn fast() -> Self {
        let poll = PollSettings {
            tick_ms: 5,
            timeout_ms: 200,
        };
        Self {
            requeue_after_ms: 10,
            pass_deadline_ms: 10_000,
            vm_running_poll: poll,
            volume_state_poll: poll,
            lb_deregister_poll: poll,
        }
    }
}

/// Errors reading a spec or config document from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Read a YAML (or JSON) document.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.requeue_after(), Duration::from_secs(30));
        assert_eq!(config.lb_deregister_poll.tick(), Duration::from_secs(20));
        assert_eq!(config.lb_deregister_poll.timeout(), Duration::from_secs(120));
        assert_eq!(config.vm_running_poll.timeout(), Duration::from_secs(240));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: ReconcilerConfig =
            serde_yaml::from_str("lb_deregister_poll:\n  tick_ms: 100\n  timeout_ms: 500\n")
                .unwrap();
        assert_eq!(config.lb_deregister_poll.timeout(), Duration::from_millis(500));
        assert_eq!(config.pass_deadline(), Duration::from_secs(600));
    }

    #[test]
    fn test_load_document_reports_path() {
        let err = load_document::<ReconcilerConfig>(Path::new("/nonexistent/config.yaml"))
            .unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/config.yaml"));
    }
}
