//! # config
//!
//! why: collect every tunable of the replication core in one serde-friendly place
//! relations: consumed by coordinator.rs and link.rs, loaded from json by repl-check
//! what: ReplConfig (runtime knobs), ClusterConfig (members and initial primary)

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::membership::{MemberStatus, Roster};
use crate::node::NodeId;
use crate::waiter::AckLevel;

/// Runtime configuration for a node's write path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// How long `write` waits before reporting a result-unknown timeout (ms)
    pub write_timeout_ms: u64,
    /// Messages buffered per replication link before it stalls
    pub link_capacity: usize,
    /// Commands buffered in front of the coordinator
    pub command_capacity: usize,
    /// Most entries shipped in one link message
    pub max_batch: usize,
    /// Mark each primary append durable immediately after it is written
    pub flush_on_append: bool,
    /// Level used by `write` when the caller does not pick one
    pub default_ack_level: AckLevel,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5000,
            link_capacity: 1024,
            command_capacity: 1024,
            max_batch: 64,
            flush_on_append: true,
            default_ack_level: AckLevel::Quorum,
        }
    }
}

impl ReplConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid cluster config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    #[serde(default)]
    pub catching_up: bool,
}

/// Static cluster description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: Vec<MemberConfig>,
    pub primary: NodeId,
    #[serde(default = "default_initial_term")]
    pub initial_term: u64,
    #[serde(default)]
    pub replication: ReplConfig,
}

fn default_initial_term() -> u64 {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: (1..=3).map(|id| MemberConfig { id, catching_up: false }).collect(),
            primary: 1,
            initial_term: default_initial_term(),
            replication: ReplConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::Invalid("no members".into()));
        }
        let mut seen = BTreeSet::new();
        for member in &self.members {
            if !seen.insert(member.id) {
                return Err(ConfigError::Invalid(format!("duplicate member {}", member.id)));
            }
        }
        match self.members.iter().find(|m| m.id == self.primary) {
            None => Err(ConfigError::Invalid(format!("primary {} is not a member", self.primary))),
            Some(m) if m.catching_up => Err(ConfigError::Invalid(format!(
                "primary {} cannot be catching up",
                self.primary
            ))),
            Some(_) if self.initial_term == 0 => Err(ConfigError::Invalid("initial_term must be at least 1".into())),
            Some(_) => Ok(()),
        }
    }

    pub fn roster(&self) -> Roster {
        let mut roster = Roster::new();
        for member in &self.members {
            let status = if member.catching_up {
                MemberStatus::CatchingUp
            } else {
                MemberStatus::Voting
            };
            roster.insert(member.id, status);
        }
        roster
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &MemberConfig> {
        self.members.iter().filter(move |m| m.id != self.primary)
    }
}
