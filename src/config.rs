//! Configuration loaded from `mainline.toml` in the data root.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lock::DEFAULT_LOCK_TIMEOUT_MS;

/// Name of the configuration file inside the data root
pub const CONFIG_FILENAME: &str = "mainline.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Branch that changes land on
    #[serde(default = "default_mainline_branch")]
    pub mainline_branch: String,

    #[serde(default)]
    pub snapshots: SnapshotsConfig,

    #[serde(default)]
    pub diff: DiffConfig,

    #[serde(default)]
    pub locks: LocksConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub actor: ActorConfig,

    /// Known users, used for commit signatures and authorship
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    /// Quiescence window for coalescing sync snapshots on one view
    #[serde(default = "default_sync_throttle_secs")]
    pub sync_throttle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Files above this size (bytes) are diffed as pointers
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Unchanged lines around each hunk
    #[serde(default = "default_context_lines")]
    pub context_lines: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber buffer; events beyond it are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Append every event to `state/events.jsonl`
    #[serde(default)]
    pub record: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    #[serde(default = "default_actor")]
    pub default: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserConfig {
    pub id: String,
    pub name: String,
    pub email: String,
}

fn default_mainline_branch() -> String {
    "mainline".to_string()
}

fn default_sync_throttle_secs() -> u64 {
    10
}

fn default_large_file_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_context_lines() -> u32 {
    3
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_channel_capacity() -> usize {
    256
}

fn default_actor() -> String {
    "unknown".to_string()
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            sync_throttle_secs: default_sync_throttle_secs(),
        }
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            large_file_threshold: default_large_file_threshold(),
            context_lines: default_context_lines(),
        }
    }
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            record: false,
        }
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            default: default_actor(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mainline_branch: default_mainline_branch(),
            snapshots: SnapshotsConfig::default(),
            diff: DiffConfig::default(),
            locks: LocksConfig::default(),
            events: EventsConfig::default(),
            actor: ActorConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `mainline.toml` from the data root, or return defaults when absent
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILENAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Look up a configured user by id
    pub fn user(&self, id: &str) -> Option<&UserConfig> {
        self.users.iter().find(|user| user.id == id)
    }

    fn validate(&self) -> Result<()> {
        let branch = self.mainline_branch.trim();
        if branch.is_empty() || !git2::Branch::name_is_valid(branch).unwrap_or(false) {
            return Err(Error::InvalidConfig(format!(
                "mainline_branch: invalid branch name '{}'",
                self.mainline_branch
            )));
        }
        if self.diff.large_file_threshold == 0 {
            return Err(Error::InvalidConfig(
                "diff.large_file_threshold must be > 0".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "events.channel_capacity must be > 0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if user.id.trim().is_empty() {
                return Err(Error::InvalidConfig("users.id cannot be empty".to_string()));
            }
            if !seen.insert(user.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "users: duplicate id '{}'",
                    user.id
                )));
            }
        }
        Ok(())
    }
}
