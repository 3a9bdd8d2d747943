//! Types shared between the session relay and its participants: the JSON
//! wire protocol, the epoch-based round clock, and the exercise parameters.

pub mod clock;
pub mod config;
pub mod protocol;

pub use clock::{aligned_start, now_ms, ClockReading, RoundClock, RoundTimer, TimerEvent};
pub use config::{ConfigError, GameConfig, ItemDef};
pub use protocol::{
    ClientMessage, InboundFrame, LogEntry, ProtocolError, Reflections, Roles, ServerMessage,
    StateMap, KEEPALIVE_TOKEN,
};

pub const DEFAULT_PORT: u16 = 8080;

/// Player identifier used for entries the relay writes on its own behalf
pub const SERVER_PLAYER_ID: &str = "server";

/// Reason attached to every missed-reflection penalty
pub const PENALTY_REASON: &str = "A reflection was missed.";
