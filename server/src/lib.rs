//! # Session Relay Library
//!
//! This library provides the relay behind a leader-driven, round-based
//! team exercise. Each session has one leader whose client owns the game
//! state; the relay keeps a merged copy of that state, fans every event out
//! to the other participants, and enforces the exercise's single server-side
//! rule: a missed reflection costs the team one item per round.
//!
//! ## Core Responsibilities
//!
//! ### State Reconciliation
//! The leader sends partial state with every action. The relay shallow-merges
//! it into the session and follows each relayed event with a full
//! `state-update`, so a participant that dropped an event converges on the
//! next one.
//!
//! ### Session Lifecycle
//! Sessions are created lazily by the first message that names them, leave
//! the lobby on the leader's `session-start`, and are replaced wholesale by
//! `reset-session`. Participants that register mid-session receive a
//! snapshot of the current state and roles.
//!
//! ### Penalty Arbitration
//! Every participant detects round expiry on its own clock and reports a
//! missed reflection independently. The relay deduplicates these reports
//! so the team loses at most one item per round.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! Connection tasks only decode the transport. Every decoded frame is sent
//! over a channel to one loop that owns the [`relay::Relay`], which makes
//! each operation on a session atomic with respect to every other one.
//!
//! ### WebSocket Communication
//! Participants connect over WebSocket and exchange JSON text frames of the
//! form `{sessionId, type, payload}`. A bare `keepalive` frame is accepted
//! and ignored.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Connection handles and the identity each connection has claimed.
//!
//! ### Session Module (`session`)
//! Per-session state, role bindings and the action log accumulated since
//! the last start.
//!
//! ### Penalty Module (`penalty`)
//! The once-per-round item deduction.
//!
//! ### Relay Module (`relay`)
//! Message dispatch and broadcast.
//!
//! ### Sink Module (`sink`)
//! Append-only action log for post-session analysis.
//!
//! ### Network Module (`network`)
//! WebSocket accept loop, per-connection tasks and the event loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::RelayConfig;
//! use server::network::RelayServer;
//! use server::relay::Relay;
//! use server::sink::NullSink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new(RelayConfig::default(), Box::new(NullSink));
//!     let server = RelayServer::bind("127.0.0.1:8080", relay).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod network;
pub mod penalty;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sink;
