//! Layered configuration: built-in defaults, optional TOML file, `SKYTETHER_*`
//! environment overlay. The daemon binary layers CLI flags on top of whatever
//! this module loads.

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
    Block,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::DropOldest
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            remote_ip: "192.168.10.1".to_string(),
            remote_port: 8889,
            local_port: 9000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub retry_max: u32,
    pub backoff_ms: u64,
    pub grace_ms: u64,
    pub assume_ok_cmds: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_max: 2,
            backoff_ms: 200,
            grace_ms: 400,
            assume_ok_cmds: vec!["takeoff".to_string(), "land".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub period_ms: u64,
    pub max_heartbeat_fail: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            max_heartbeat_fail: 3,
        }
    }
}

impl MonitorConfig {
    /// Effective tick period, clamped to the 200ms floor.
    pub fn effective_period_ms(&self) -> u64 {
        self.period_ms.max(200)
    }

    /// Effective failure threshold, at least 1.
    pub fn effective_max_heartbeat_fail(&self) -> u32 {
        self.max_heartbeat_fail.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub subscriber_maxsize: usize,
    pub drop_policy: DropPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            subscriber_maxsize: 100,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// The user config dir's `skytether/config.toml`, used when no `--config`
/// path is given. Returns `None` if the platform's home directory can't be
/// resolved at all (not if the file happens not to exist there).
fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|d| d.config_dir().join("skytether").join("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub driver: DriverConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub event_bus: EventBusConfig,
}

impl MiddlewareConfig {
    /// Load defaults, overlay a TOML file, then overlay `SKYTETHER_*`
    /// environment variables. `path` is a CLI-provided override; when absent,
    /// the platform's standard user config dir (`$XDG_CONFIG_HOME/skytether/config.toml`
    /// or the macOS/Windows equivalent) is tried instead. Either way, a
    /// missing file is not an error: defaults and env overlay still apply.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        let candidate = path.map(PathBuf::from).or_else(default_config_path);
        if let Some(path) = candidate.as_deref() {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                cfg = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }

        cfg.apply_env_overlay();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overlay(&mut self) {
        if let Ok(v) = std::env::var("SKYTETHER_REMOTE_IP") {
            self.driver.remote_ip = v;
        }
        if let Ok(v) = std::env::var("SKYTETHER_REMOTE_PORT") {
            if let Ok(p) = v.parse() {
                self.driver.remote_port = p;
            }
        }
        if let Ok(v) = std::env::var("SKYTETHER_LOCAL_PORT") {
            if let Ok(p) = v.parse() {
                self.driver.local_port = p;
            }
        }
        if let Ok(v) = std::env::var("SKYTETHER_RETRY_MAX") {
            if let Ok(n) = v.parse() {
                self.scheduler.retry_max = n;
            }
        }
        if let Ok(v) = std::env::var("SKYTETHER_BACKOFF_MS") {
            if let Ok(n) = v.parse() {
                self.scheduler.backoff_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SKYTETHER_GRACE_MS") {
            if let Ok(n) = v.parse() {
                self.scheduler.grace_ms = n;
            }
        }
        if let Ok(v) = std::env::var("SKYTETHER_MONITOR_PERIOD_MS") {
            if let Ok(n) = v.parse() {
                self.monitor.period_ms = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.driver.local_port == 0 {
            return Err(ConfigError::Invalid("local_port must be nonzero".into()));
        }
        if self.driver.remote_port == 0 {
            return Err(ConfigError::Invalid("remote_port must be nonzero".into()));
        }
        if self.event_bus.subscriber_maxsize == 0 {
            return Err(ConfigError::Invalid(
                "event_bus.subscriber_maxsize must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MiddlewareConfig::default();
        assert_eq!(cfg.driver.remote_ip, "192.168.10.1");
        assert_eq!(cfg.driver.remote_port, 8889);
        assert_eq!(cfg.driver.local_port, 9000);
        assert_eq!(cfg.scheduler.retry_max, 2);
        assert_eq!(cfg.scheduler.backoff_ms, 200);
        assert_eq!(cfg.scheduler.grace_ms, 400);
        assert_eq!(cfg.monitor.period_ms, 1000);
        assert_eq!(cfg.monitor.max_heartbeat_fail, 3);
    }

    #[test]
    fn monitor_period_is_clamped() {
        let cfg = MonitorConfig {
            period_ms: 50,
            ..Default::default()
        };
        assert_eq!(cfg.effective_period_ms(), 200);
    }

    #[test]
    fn default_config_path_targets_skytether_subdir() {
        let path = default_config_path().expect("no home dir resolvable in this environment");
        assert!(path.ends_with("skytether/config.toml"));
    }

    #[test]
    fn load_with_no_path_falls_back_to_defaults() {
        // No SKYTETHER_* vars set and no CLI path: whatever sits at the
        // default user config path (if anything) is this machine's own
        // config, not a fixture, so just check loading still validates.
        let cfg = MiddlewareConfig::load(None).unwrap();
        assert!(cfg.driver.local_port > 0);
    }

    #[test]
    fn file_overlay_then_env_overlay_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skytether.toml");
        std::fs::write(&path, "[scheduler]\nretry_max = 5\n").unwrap();

        std::env::set_var("SKYTETHER_RETRY_MAX", "1");
        let cfg = MiddlewareConfig::load(Some(&path)).unwrap();
        std::env::remove_var("SKYTETHER_RETRY_MAX");

        assert_eq!(cfg.scheduler.retry_max, 1);
    }

    #[test]
    fn rejects_zero_local_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skytether.toml");
        std::fs::write(&path, "[driver]\nlocal_port = 0\n").unwrap();
        let err = MiddlewareConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
