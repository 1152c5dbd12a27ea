//! Coordinator configuration, persisted as TOML.
//!
//! Lives at `$XDG_CONFIG_HOME/agora/agora.toml` unless `--config` says
//! otherwise. Every field has a default, so an empty file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition;
use crate::error::ConfigError;
use crate::heartbeat::HeartbeatConfig;
use crate::trigger::{ProposalTemplate, Trigger};

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A trigger declared in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    /// Predicate-language source, e.g. `type == "step_completed"`.
    pub condition: String,
    #[serde(default)]
    pub cooldown_seconds: u64,
    /// Title template with `{placeholder}` substitutions.
    pub title: String,
    pub step_kinds: Vec<String>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TriggerConfig {
    /// Compile into a trigger with no id and no firing history.
    pub fn to_trigger(&self) -> ConfigResult<Trigger> {
        let condition = condition::parse(&self.condition).map_err(|e| ConfigError::Condition {
            trigger: self.name.clone(),
            source: e,
        })?;
        let mut trigger = Trigger::new(
            &self.name,
            condition,
            ProposalTemplate {
                title_template: self.title.clone(),
                step_kinds: self.step_kinds.clone(),
                auto_approve: self.auto_approve,
            },
        )
        .with_cooldown(self.cooldown_seconds);
        trigger.enabled = self.enabled;
        Ok(trigger)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgoraConfig {
    /// Seconds between heartbeat ticks.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Seconds between executor polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// A claim is stale after this many poll intervals.
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,
    /// Durable store directory. Defaults to the XDG data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

fn default_heartbeat_interval() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    30
}
fn default_staleness_multiplier() -> u64 {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_event_batch_size() -> usize {
    256
}

impl Default for AgoraConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            poll_interval_seconds: default_poll_interval(),
            staleness_multiplier: default_staleness_multiplier(),
            max_attempts: default_max_attempts(),
            event_batch_size: default_event_batch_size(),
            data_dir: None,
            triggers: Vec::new(),
        }
    }
}

impl AgoraConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// Load from a TOML file, or fall back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.heartbeat_interval_seconds == 0 {
            return invalid("heartbeat_interval_seconds must be positive");
        }
        if self.poll_interval_seconds == 0 {
            return invalid("poll_interval_seconds must be positive");
        }
        if self.staleness_multiplier == 0 {
            return invalid("staleness_multiplier must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.event_batch_size == 0 {
            return invalid("event_batch_size must be positive");
        }
        for trigger in &self.triggers {
            if trigger.step_kinds.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("trigger \"{}\" declares no step_kinds", trigger.name),
                });
            }
            trigger.to_trigger()?;
        }
        Ok(())
    }

    /// Seconds after which a claim is considered abandoned.
    pub fn staleness_threshold(&self) -> u64 {
        self.staleness_multiplier
            .saturating_mul(self.poll_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_seconds),
            staleness_threshold: self.staleness_threshold(),
            event_batch_size: self.event_batch_size,
        }
    }

    /// Compile every declared trigger.
    pub fn triggers(&self) -> ConfigResult<Vec<Trigger>> {
        self.triggers.iter().map(TriggerConfig::to_trigger).collect()
    }
}
