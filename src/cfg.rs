use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables of a debugging session.
///
/// Loadable from a TOML file; the defaults carry the timing constants the
/// debugger is designed around.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often request handlers poll the session state, in milliseconds.
    pub request_poll_ms: u64,
    /// Default deadline for run/continue/step requests, in milliseconds.
    pub default_deadline_ms: u64,
    /// How long session close waits for the worker thread before leaving
    /// handles to OS cleanup, in milliseconds.
    pub worker_join_grace_ms: u64,
    /// Idle sessions older than this are removed by `cleanup_expired`.
    pub session_timeout_secs: u64,
    /// Extra directories searched for source files.
    pub source_directories: Vec<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_poll_ms: 10,
            default_deadline_ms: 10_000,
            worker_join_grace_ms: 5_000,
            session_timeout_secs: 3_600,
            source_directories: vec![],
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn request_poll(&self) -> Duration {
        Duration::from_millis(self.request_poll_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn worker_join_grace(&self) -> Duration {
        Duration::from_millis(self.worker_join_grace_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.request_poll(), Duration::from_millis(10));
        assert_eq!(config.default_deadline(), Duration::from_secs(10));
        assert!(config.source_directories.is_empty());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: SessionConfig =
            toml::from_str("request_poll_ms = 25\nsource_directories = [\"c:/src\"]").unwrap();
        assert_eq!(config.request_poll_ms, 25);
        assert_eq!(config.source_directories, vec![PathBuf::from("c:/src")]);
        assert_eq!(config.default_deadline_ms, 10_000);
    }
}
