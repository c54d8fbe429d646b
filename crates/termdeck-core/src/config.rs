//! Manager configuration.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the session manager and its owned components.
///
/// All durations are milliseconds in the TOML file; accessors return
/// `Duration`. Tests shrink the timer values to keep runs fast.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Hard cap on concurrently registered sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Line buffer capacity for new sessions (forks inherit the parent's).
    #[serde(default = "default_line_buffer_capacity")]
    pub line_buffer_capacity: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Stall timer: how long processing may go without an activity tick
    /// before it is presumed complete.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Suppression window after an authoritative external stop signal.
    #[serde(default = "default_stop_cooldown_ms")]
    pub stop_cooldown_ms: u64,
    /// Suppression window after a client (re)attaches to a session.
    #[serde(default = "default_attach_grace_ms")]
    pub attach_grace_ms: u64,
    /// How long dispose waits for a drain loop to exit.
    #[serde(default = "default_dispose_join_ms")]
    pub dispose_join_ms: u64,
    /// How long dispose waits for a child to die gracefully before the
    /// force kill.
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    /// Settle delay between dispose and respawn during restart.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
}

fn default_max_sessions() -> usize {
    25
}

fn default_line_buffer_capacity() -> usize {
    10_000
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_stall_timeout_ms() -> u64 {
    8_000
}

fn default_stop_cooldown_ms() -> u64 {
    3_000
}

fn default_attach_grace_ms() -> u64 {
    10_000
}

fn default_dispose_join_ms() -> u64 {
    1_000
}

fn default_kill_wait_ms() -> u64 {
    1_000
}

fn default_restart_settle_ms() -> u64 {
    500
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            line_buffer_capacity: default_line_buffer_capacity(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            stall_timeout_ms: default_stall_timeout_ms(),
            stop_cooldown_ms: default_stop_cooldown_ms(),
            attach_grace_ms: default_attach_grace_ms(),
            dispose_join_ms: default_dispose_join_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            restart_settle_ms: default_restart_settle_ms(),
        }
    }
}

impl ManagerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stop_cooldown(&self) -> Duration {
        Duration::from_millis(self.stop_cooldown_ms)
    }

    pub fn attach_grace(&self) -> Duration {
        Duration::from_millis(self.attach_grace_ms)
    }

    pub fn dispose_join(&self) -> Duration {
        Duration::from_millis(self.dispose_join_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from the default locations: a user-level
    /// `termdeck/config.toml` under the platform config directory wins over
    /// a repo-local `config/default.toml`; built-in defaults otherwise.
    pub fn load() -> Result<Self> {
        if let Some(base) = dirs::config_dir() {
            let user_path = base.join("termdeck").join("config.toml");
            if user_path.exists() {
                return Self::load_from(&user_path);
            }
        }
        let local = PathBuf::from("config/default.toml");
        if local.exists() {
            return Self::load_from(&local);
        }
        Ok(ManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_sessions, 25);
        assert_eq!(config.line_buffer_capacity, 10_000);
        assert_eq!(config.stall_timeout(), Duration::from_secs(8));
        assert_eq!(config.stop_cooldown(), Duration::from_secs(3));
        assert_eq!(config.attach_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_sessions = 3\nstall_timeout_ms = 100").unwrap();

        let config = ManagerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.stall_timeout(), Duration::from_millis(100));
        // Unspecified fields keep their defaults.
        assert_eq!(config.line_buffer_capacity, 10_000);
    }

    #[test]
    fn test_load_from_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_sessions = \"many\"").unwrap();
        assert!(ManagerConfig::load_from(file.path()).is_err());
    }
}
