//! Exercise parameters shared by the relay and its participants.
//!
//! Loaded from the same JSON parameter file the operators edit, whose keys
//! are upper snake case. Keys this crate does not use are ignored.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid parameter file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("parameter file lists no roles")]
    NoRoles,
}

/// One collectible item kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDef {
    pub code: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct GameConfig {
    pub round_count: u32,
    pub round_duration_sec: u64,
    pub grid_size: u32,
    pub max_steps_per_round: u32,
    /// First round in which inject events can fire
    pub inject_start_round: u32,
    /// Share of grid cells that hold an inject event, between 0 and 1
    pub inject_cell_share: f64,
    pub items: Vec<ItemDef>,
    /// The first role is the leader
    pub roles: Vec<String>,
}

impl Default for GameConfig {
    fn default() -> Self {
        let items = [("A", "Amulet"), ("W", "Water"), ("S", "Seeds"), ("C", "Cloth")]
            .into_iter()
            .map(|(code, name)| ItemDef {
                code: code.to_string(),
                name: name.to_string(),
            })
            .collect();

        Self {
            round_count: 4,
            round_duration_sec: 120,
            grid_size: 5,
            max_steps_per_round: 3,
            inject_start_round: 4,
            inject_cell_share: 0.8,
            items,
            roles: ["Charlie", "Alpha", "Bravo", "Delta"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl GameConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GameConfig = serde_json::from_str(text)?;
        if config.roles.is_empty() {
            return Err(ConfigError::NoRoles);
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn leader_role(&self) -> &str {
        self.roles.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_leader_role(&self, role: &str) -> bool {
        self.leader_role() == role
    }

    pub fn item_codes(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.code.as_str())
    }

    /// Display name of an item, falling back to its code
    pub fn item_name<'a>(&'a self, code: &'a str) -> &'a str {
        self.items
            .iter()
            .find(|item| item.code == code && !item.name.is_empty())
            .map_or(code, |item| item.name.as_str())
    }

    pub fn session_duration_sec(&self) -> u64 {
        u64::from(self.round_count).saturating_mul(self.round_duration_sec)
    }
}
