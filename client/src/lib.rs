//! # Session Participant Library
//!
//! This library provides a headless participant for the session relay. It
//! can either lead a session, authoring the state the relay distributes, or
//! follow one as a team member that mirrors that state and keeps its own
//! countdown.
//!
//! ## Architecture Overview
//!
//! ### Leader-Authored State
//! Only the leader changes the game state. Each action goes to the relay as
//! a message carrying the changed fields; the relay merges them and sends
//! every other participant the event followed by the full merged state.
//!
//! ### Local Countdowns
//! The leader picks a start epoch aligned to a whole second and ships the
//! derived end epochs with `session-start`. Every participant, including
//! late joiners, polls its own clock against those epochs. Nothing ticks on
//! the relay.
//!
//! ### Reflections
//! At each round boundary a participant that has not submitted a reflection
//! for the round reports it missing. The relay turns the first such report
//! per round into a team-wide penalty.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! WebSocket connection to the relay, bound to one session.
//!
//! ### Mirror Module (`mirror`)
//! The local copy of session state and roles, and the round timer built
//! from received epochs.
//!
//! ### Leader Module (`leader`)
//! Grid walk, visited cells and inventory for the leading participant.
//!
//! ### Participant Module (`participant`)
//! The polling loop tying the above together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::RelayClient;
//! use client::participant::{Participant, ParticipantOptions};
//! use shared::GameConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayClient::connect("127.0.0.1:8080", "session-1").await?;
//!     let options = ParticipantOptions::new("player-2", "Alpha");
//!     let mut participant = Participant::new(relay, GameConfig::default(), options);
//!     participant.run().await?;
//!     Ok(())
//! }
//! ```

pub mod leader;
pub mod mirror;
pub mod network;
pub mod participant;
