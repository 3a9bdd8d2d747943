//! Message handling and fan-out for every session on this process
//!
//! The [`Relay`] is a merge-and-forward function over the leader's opaque
//! state blob. It never runs game logic of its own: it merges each
//! state-carrying message into the session, forwards the specific event to
//! the other participants, and follows it with the reconciled state. The
//! only decision it takes on its own is the once-per-round penalty.
//!
//! All methods take `&mut self` and run on one task, so every operation on
//! a session completes before the next one starts.

use crate::config::RelayConfig;
use crate::penalty::{apply_missed_reflection, PenaltyOutcome};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, Frame};
use crate::session::{game_instance_label, Session, SessionStore, StartOutcome};
use crate::sink::{ActionEntry, ActionSink};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{json, Value};
use shared::protocol::SessionStartPayload;
use shared::{
    now_ms, ClientMessage, InboundFrame, ServerMessage, StateMap, PENALTY_REASON, SERVER_PLAYER_ID,
};
use std::sync::Arc;

pub struct Relay {
    sessions: SessionStore,
    connections: ConnectionRegistry,
    config: RelayConfig,
    sink: Box<dyn ActionSink>,
    rng: StdRng,
}

fn payload_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

impl Relay {
    pub fn new(config: RelayConfig, sink: Box<dyn ActionSink>) -> Self {
        Self::with_rng(config, sink, StdRng::from_entropy())
    }

    /// Relay with a caller-supplied random source for penalty selection
    pub fn with_rng(config: RelayConfig, sink: Box<dyn ActionSink>, rng: StdRng) -> Self {
        Self {
            sessions: SessionStore::new(),
            connections: ConnectionRegistry::new(),
            config,
            sink,
            rng,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Tracks a connection the transport has just opened
    pub fn connect(&mut self, connection: Connection) {
        self.connections.insert(connection);
    }

    /// Handles the transport's disconnect notification
    pub fn disconnect(&mut self, id: ConnectionId) {
        self.unregister(id);
        if let Some(connection) = self.connections.remove(id) {
            info!(
                "Client {} disconnected from session {} after {:.1}s",
                connection.label(),
                connection.session_id.as_deref().unwrap_or("UnknownSession"),
                connection.connected_for().as_secs_f64()
            );
        }
    }

    /// Binds a connection to a session and records the role it claims.
    ///
    /// Idempotent for the same (session, player) pair. Role exclusivity has
    /// already been arbitrated by the claim step, so the claim is trusted.
    /// If the session is already active the connection immediately receives
    /// a snapshot of the current state and roles.
    pub fn register(
        &mut self,
        id: ConnectionId,
        session_id: &str,
        player_id: &str,
        role: &str,
    ) {
        self.attach(id, session_id);
        self.connections.identify(id, player_id, Some(role));

        let session = self.sessions.get_or_create(session_id);
        if session.bind_role(role, player_id) {
            info!(
                "[{}] Registered role: {} for player {}",
                session_id, role, player_id
            );
        }

        if session.started {
            let snapshot = session.snapshot();
            if self.send_to(id, session_id, &snapshot) {
                info!(
                    "[{}] Sent session-started to late-joining client {}",
                    session_id, player_id
                );
            }
        }
    }

    /// Removes a connection from its session's fan-out set.
    ///
    /// Never touches session state and is safe to call repeatedly.
    pub fn unregister(&mut self, id: ConnectionId) {
        let Some(session_id) = self
            .connections
            .get(id)
            .and_then(|c| c.session_id.clone())
        else {
            return;
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.connections.remove(&id) {
                info!(
                    "[{}] Client removed. Remaining clients: {}",
                    session_id,
                    session.connections.len()
                );
            }
        }
    }

    /// Delivers `message` to every open connection of the session except
    /// `exclude`. Closed connections are skipped and never retried.
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast(
        &self,
        session_id: &str,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let Some(session) = self.sessions.get(session_id) else {
            debug!("[{}] Broadcast skipped: session not found", session_id);
            return 0;
        };

        let frame: Frame = match message.to_frame(session_id) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                error!("[{}] Failed to serialize '{}': {}", session_id, message.kind(), e);
                return 0;
            }
        };

        let mut sent = 0;
        for id in &session.connections {
            if Some(*id) == exclude {
                continue;
            }
            match self.connections.get(*id) {
                Some(connection) if connection.send(&frame) => sent += 1,
                Some(connection) => {
                    debug!(
                        "[{}] Skipping client {} (not open)",
                        session_id,
                        connection.label()
                    );
                }
                None => {}
            }
        }

        debug!(
            "[{}] Broadcast '{}' sent to {} clients",
            session_id,
            message.kind(),
            sent
        );
        sent
    }

    /// Broadcasts the session's reconciled state as it is at this moment
    pub fn broadcast_state(&self, session_id: &str, exclude: Option<ConnectionId>) -> usize {
        match self.sessions.get(session_id) {
            Some(session) => self.broadcast(session_id, &session.state_update(), exclude),
            None => 0,
        }
    }

    /// Decodes and handles one text frame from a connection.
    ///
    /// Keep-alives and undecodable frames are dropped without a reply.
    pub fn handle_text(&mut self, id: ConnectionId, text: &str) {
        match InboundFrame::parse(text) {
            Ok(Some(frame)) => self.handle_frame(id, frame),
            Ok(None) => {}
            Err(e) => debug!("Dropping frame from connection {}: {}", id, e),
        }
    }

    pub fn handle_frame(&mut self, id: ConnectionId, frame: InboundFrame) {
        if self.connections.get(id).is_none() {
            warn!("Frame from unknown connection {}, ignoring", id);
            return;
        }

        let InboundFrame {
            session_id,
            message,
        } = frame;
        let sid = session_id.as_str();

        self.attach(id, sid);
        if let Some(player_id) = message.player_id() {
            self.connections.identify(id, player_id, None);
        }
        info!(
            "[{}] Received '{}' from {}",
            sid,
            message.kind(),
            self.player_label(id)
        );

        match message {
            ClientMessage::Register(p) => self.register(id, sid, &p.player_id, &p.role),
            ClientMessage::SessionStart(p) => self.start_session(id, sid, p),
            ClientMessage::Move(p) => {
                let data = payload_value(&p);
                let step = p.step;
                self.relay_gameplay(id, sid, "move", data, step.clone(), p.state, |state| {
                    ServerMessage::Move { step, state }
                });
            }
            ClientMessage::Inject(p) => {
                let data = payload_value(&p);
                let inject = p.inject;
                self.relay_gameplay(id, sid, "inject", data, inject.clone(), p.state, |state| {
                    ServerMessage::Inject { inject, state }
                });
            }
            ClientMessage::InventoryUpdate(p) => {
                let data = payload_value(&p);
                let inventory = p.inventory;
                self.relay_gameplay(
                    id,
                    sid,
                    "inventory-update",
                    data,
                    inventory.clone(),
                    p.state,
                    |state| ServerMessage::InventoryUpdate { inventory, state },
                );
            }
            ClientMessage::StateUpdate(p) => {
                self.sessions.merge(sid, p.state);
                self.broadcast_state(sid, Some(id));
            }
            ClientMessage::Reflection(p) => {
                self.sessions
                    .get_or_create(sid)
                    .record_reflection(p.round_num, &p.player_id, &p.text);
                self.record(
                    sid,
                    Some(p.round_num),
                    &p.player_id,
                    "reflection",
                    json!({ "text": p.text }),
                );
            }
            ClientMessage::ReflectionMissing(p) => {
                self.reflection_missing(sid, &p.player_id, p.round_num, &p.text);
            }
            ClientMessage::PickupChoicesShown(payload) => {
                info!("[{}] Leader presented pickup choices.", sid);
                self.broadcast(sid, &ServerMessage::PickupChoicesShown(payload), Some(id));
            }
            ClientMessage::ShowModal(payload) => {
                info!(
                    "[{}] Leader triggered modal: {}",
                    sid,
                    payload.get("main").and_then(Value::as_str).unwrap_or("")
                );
                self.broadcast(sid, &ServerMessage::ShowModal(payload), Some(id));
            }
            ClientMessage::Log(p) => {
                let data = payload_value(&p);
                let round = {
                    let session = self.sessions.get_or_create(sid);
                    session.push_log("log", Some(&p.player_id), json!(p.msg));
                    session.round_num()
                };
                let event = ServerMessage::Log {
                    player_id: p.player_id.clone(),
                    msg: p.msg,
                };
                self.broadcast(sid, &event, Some(id));
                self.broadcast_state(sid, Some(id));
                self.record(sid, round, &p.player_id, "log", data);
            }
            ClientMessage::Hello(p) => {
                let sent = self.send_to_leader(
                    sid,
                    &ServerMessage::Hello {
                        from: p.player_id.clone(),
                    },
                );
                if sent > 0 {
                    info!("[{}] Forwarded HELLO from {} to leader", sid, p.player_id);
                }
            }
            ClientMessage::MemberClicked(p) => {
                let alert = ServerMessage::ShowAlert {
                    message: format!("Member {} clicked the button!", p.player_id),
                };
                if self.send_to_leader(sid, &alert) > 0 {
                    info!("[{}] Sent show-alert to leader", sid);
                }
            }
            ClientMessage::GameOver(p) => {
                let round = self.sessions.get_or_create(sid).round_num();
                let player = self.player_label(id);
                self.record(sid, round, &player, "game-over", json!({ "reason": p.reason }));
            }
            ClientMessage::ResetSession(p) => {
                self.sessions.reset(sid);
                info!(
                    "[{}] Session reset by {}",
                    sid,
                    p.player_id.as_deref().unwrap_or("Unknown")
                );
                self.broadcast(sid, &ServerMessage::SessionReset {}, None);
            }
        }
    }

    /// Makes `id` a member of `session_id`, leaving any previous session
    fn attach(&mut self, id: ConnectionId, session_id: &str) {
        if self.connections.get(id).is_none() {
            return;
        }
        if let Some(previous) = self.connections.bind_session(id, session_id) {
            if let Some(old) = self.sessions.get_mut(&previous) {
                old.connections.remove(&id);
            }
        }

        let label = self.player_label(id);
        let session = self.sessions.get_or_create(session_id);
        if session.connections.insert(id) {
            info!(
                "[{}] Client {} added. Total clients: {}",
                session_id,
                label,
                session.connections.len()
            );
        }
    }

    fn start_session(&mut self, id: ConnectionId, session_id: &str, payload: SessionStartPayload) {
        if payload.role != self.config.leader_role {
            warn!(
                "[{}] Ignoring session-start from {} with non-leader role {}",
                session_id, payload.player_id, payload.role
            );
            return;
        }

        self.connections
            .identify(id, &payload.player_id, Some(&payload.role));
        let label = game_instance_label(now_ms(), self.config.instance_utc_offset_secs);
        let outcome = self.sessions.start(
            session_id,
            payload.state,
            &self.config.leader_role,
            &payload.player_id,
            label,
        );

        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        match outcome {
            StartOutcome::Started => info!(
                "[{}] Leader started session (playerId: {})",
                session_id, payload.player_id
            ),
            StartOutcome::Restarted => info!(
                "[{}] Leader restarted an active session (playerId: {}), keeping gameInstance {}",
                session_id, payload.player_id, session.game_instance
            ),
        }
        debug!(
            "[{}] Initial state end times: session={:?} round={:?}",
            session_id,
            session.state.get("sessionEndTime"),
            session.state.get("roundEndTime")
        );

        let roles = json!({ "roles": session.player_roles() });
        let snapshot = session.snapshot();
        self.record(session_id, Some(0), &payload.player_id, "roles", roles);
        self.broadcast(session_id, &snapshot, Some(id));
    }

    /// Merge, then forward the event, then the reconciled state
    #[allow(clippy::too_many_arguments)]
    fn relay_gameplay(
        &mut self,
        id: ConnectionId,
        session_id: &str,
        kind: &str,
        action_data: Value,
        log_data: Value,
        partial: StateMap,
        event: impl FnOnce(StateMap) -> ServerMessage,
    ) {
        let player_id = self.connections.get(id).and_then(|c| c.player_id.clone());
        info!(
            "[{}] {} by {}",
            session_id,
            kind,
            player_id.as_deref().unwrap_or("leader")
        );

        self.sessions.merge(session_id, partial);
        let session = self.sessions.get_or_create(session_id);
        session.push_log(kind, player_id.as_deref(), log_data);
        let round = session.round_num();
        let message = event(session.state.clone());

        self.broadcast(session_id, &message, Some(id));
        self.broadcast_state(session_id, Some(id));
        self.record(
            session_id,
            round,
            player_id.as_deref().unwrap_or("Unknown"),
            kind,
            action_data,
        );
    }

    fn reflection_missing(
        &mut self,
        session_id: &str,
        player_id: &str,
        round_num: Option<u32>,
        text: &str,
    ) {
        let round = round_num.or_else(|| self.sessions.get_or_create(session_id).round_num());
        self.record(
            session_id,
            round,
            player_id,
            "reflection-missing",
            json!({ "text": text }),
        );

        let Some(round) = round else {
            warn!(
                "[{}] reflection-missing from {} names no round, ignoring",
                session_id, player_id
            );
            return;
        };
        info!(
            "[{}] Received reflection-missing for round {} from {}. Checking penalty status...",
            session_id, round, player_id
        );

        let session = self.sessions.get_or_create(session_id);
        match apply_missed_reflection(session, round, &mut self.rng) {
            PenaltyOutcome::Applied {
                round,
                item_code,
                inventory,
            } => {
                match &item_code {
                    Some(code) => info!(
                        "[{}] Penalty: Lost 1 {} due to missed reflection in round {}",
                        session_id, code, round
                    ),
                    None => info!(
                        "[{}] Penalty: No item to lose for missed reflection in round {}",
                        session_id, round
                    ),
                }

                let notice = ServerMessage::ReflectionPenalty {
                    item_code: item_code.clone(),
                    reason: PENALTY_REASON.to_string(),
                    inventory: inventory.clone(),
                };
                let sent = self.broadcast(session_id, &notice, None);
                info!(
                    "[{}] Broadcast reflection-penalty to {} clients",
                    session_id, sent
                );
                self.record(
                    session_id,
                    Some(round),
                    SERVER_PLAYER_ID,
                    "penalty",
                    json!({
                        "reason": PENALTY_REASON,
                        "lostItem": item_code,
                        "inventory": inventory,
                    }),
                );
            }
            PenaltyOutcome::AlreadyApplied { round } => info!(
                "[{}] Penalty already applied for round {}, ignoring duplicate reflection-missing from {}",
                session_id, round, player_id
            ),
        }
    }

    fn send_to(&self, id: ConnectionId, session_id: &str, message: &ServerMessage) -> bool {
        let Some(connection) = self.connections.get(id) else {
            return false;
        };
        match message.to_frame(session_id) {
            Ok(text) => connection.send(&Arc::from(text)),
            Err(e) => {
                error!("[{}] Failed to serialize '{}': {}", session_id, message.kind(), e);
                false
            }
        }
    }

    /// Sends to the open connections of the player bound to the leader role
    fn send_to_leader(&self, session_id: &str, message: &ServerMessage) -> usize {
        let Some(session) = self.sessions.get(session_id) else {
            return 0;
        };
        let Some(leader_id) = session.player_for(&self.config.leader_role) else {
            info!("[{}] No leader registered", session_id);
            return 0;
        };

        let sent = self
            .connections
            .find_by_player(session_id, leader_id)
            .into_iter()
            .filter(|cid| session.connections.contains(cid))
            .filter(|cid| self.send_to(*cid, session_id, message))
            .count();
        if sent == 0 {
            info!(
                "[{}] Could not find open leader client for leaderId: {}",
                session_id, leader_id
            );
        }
        sent
    }

    fn player_label(&self, id: ConnectionId) -> String {
        self.connections
            .get(id)
            .map(|c| c.label().to_owned())
            .unwrap_or_else(|| "Unknown".into())
    }

    /// Hands an entry to the action sink; never fails the caller
    fn record(
        &self,
        session_id: &str,
        round_num: Option<u32>,
        player_id: &str,
        action_type: &str,
        action_data: Value,
    ) {
        let game_instance = self
            .sessions
            .get(session_id)
            .map(|s| s.game_instance.clone())
            .unwrap_or_default();

        self.sink.record(ActionEntry {
            session_id: session_id.to_owned(),
            round_num,
            player_id: player_id.to_owned(),
            action_type: action_type.to_owned(),
            action_data,
            game_instance,
            timestamp_ms: now_ms(),
        });
    }
}
