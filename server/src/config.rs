//! Relay settings derived from the exercise parameters and command line

use shared::GameConfig;

/// Default offset applied to the wall clock when stamping game instances
pub const DEFAULT_INSTANCE_UTC_OFFSET_HOURS: i32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Role whose `session-start` moves a session out of the lobby
    pub leader_role: String,
    /// Offset used for the `HH:MM` game instance label
    pub instance_utc_offset_secs: i64,
}

impl RelayConfig {
    pub fn from_game_config(game: &GameConfig, instance_utc_offset_hours: i32) -> Self {
        Self {
            leader_role: game.leader_role().to_owned(),
            instance_utc_offset_secs: i64::from(instance_utc_offset_hours) * 3600,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_game_config(&GameConfig::default(), DEFAULT_INSTANCE_UTC_OFFSET_HOURS)
    }
}
