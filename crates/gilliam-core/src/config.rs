//! gilliam.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Tick;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GilliamConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            data_dir: PathBuf::from("/var/lib/gilliam"),
        }
    }
}

/// Node ordering used to pick among eligible nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingPolicy {
    /// Most-allocated first, smallest residual on ties.
    #[default]
    BestFit,
    /// Least-allocated first, largest residual on ties.
    Spread,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Wall-clock interval between reconciliation cycles.
    pub cycle_interval_ms: u64,
    /// TTL granted to new leases and used for heartbeat renewals.
    pub default_lease_ttl: Tick,
    /// Failed placements before a work unit is marked failed.
    pub max_placement_attempts: u32,
    /// Extend every lease on a node when it heartbeats.
    pub renew_on_heartbeat: bool,
    pub packing: PackingPolicy,
    pub dispatch_limit: Option<DispatchLimit>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 3000,
            default_lease_ttl: 30,
            max_placement_attempts: 3,
            renew_on_heartbeat: true,
            packing: PackingPolicy::BestFit,
            dispatch_limit: None,
        }
    }
}

impl SchedulerConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}

/// Token bucket: at most `rate` lease grants per `per_ticks` ticks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DispatchLimit {
    pub rate: u32,
    pub per_ticks: Tick,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Silence (in ticks) after which a node turns suspect.
    pub suspect_after: Tick,
    /// Silence after which a node is dead and its leases are reclaimed.
    pub dead_after: Tick,
    /// Additional silence after death before the node is deregistered.
    pub remove_dead_after: Option<Tick>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            suspect_after: 10,
            dead_after: 30,
            remove_dead_after: None,
        }
    }
}

impl GilliamConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GilliamConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        let h = &self.heartbeat;
        if s.default_lease_ttl == 0 {
            return Err(ConfigError::Invalid("scheduler.default_lease_ttl must be > 0".into()));
        }
        if s.max_placement_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_placement_attempts must be > 0".into(),
            ));
        }
        if s.cycle_interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.cycle_interval_ms must be > 0".into()));
        }
        if let Some(limit) = s.dispatch_limit {
            if limit.rate == 0 || limit.per_ticks == 0 {
                return Err(ConfigError::Invalid(
                    "scheduler.dispatch_limit rate and per_ticks must be > 0".into(),
                ));
            }
        }
        if h.dead_after <= h.suspect_after {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.dead_after ({}) must exceed heartbeat.suspect_after ({})",
                h.dead_after, h.suspect_after
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GilliamConfig::from_toml_str("").unwrap();
        assert_eq!(config, GilliamConfig::default());
        assert_eq!(config.scheduler.max_placement_attempts, 3);
        assert_eq!(config.scheduler.packing, PackingPolicy::BestFit);
    }

    #[test]
    fn parses_full_file() {
        let toml_str = r#"
[server]
port = 9000
data_dir = "/tmp/gilliam"

[scheduler]
cycle_interval_ms = 500
default_lease_ttl = 60
packing = "spread"

[scheduler.dispatch_limit]
rate = 10
per_ticks = 30

[heartbeat]
suspect_after = 5
dead_after = 20
remove_dead_after = 100
"#;
        let config = GilliamConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.scheduler.cycle_interval(), Duration::from_millis(500));
        assert_eq!(config.scheduler.packing, PackingPolicy::Spread);
        assert_eq!(
            config.scheduler.dispatch_limit,
            Some(DispatchLimit { rate: 10, per_ticks: 30 })
        );
        assert_eq!(config.heartbeat.remove_dead_after, Some(100));
        // Unset fields keep their defaults.
        assert!(config.scheduler.renew_on_heartbeat);
    }

    #[test]
    fn rejects_inverted_heartbeat_thresholds() {
        let err = GilliamConfig::from_toml_str("[heartbeat]\nsuspect_after = 30\ndead_after = 30\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_ttl() {
        let err =
            GilliamConfig::from_toml_str("[scheduler]\ndefault_lease_ttl = 0\n").unwrap_err();
        assert!(err.to_string().contains("default_lease_ttl"));
    }

    #[test]
    fn rejects_unknown_packing_policy() {
        let err = GilliamConfig::from_toml_str("[scheduler]\npacking = \"random\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn renders_back_to_toml() {
        let rendered = GilliamConfig::default().to_toml_string().unwrap();
        assert!(rendered.contains("best_fit"));
        let reparsed = GilliamConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed, GilliamConfig::default());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gilliam.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();

        let config = GilliamConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 7000);

        let missing = GilliamConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
