//! Per-session authoritative state
//!
//! A [`Session`] is created implicitly the first time any message names an
//! unknown session identifier, mutated in place by every state-carrying
//! message, and swapped for a fresh one on an explicit reset. Nothing is
//! persisted and abandoned sessions are never collected.

use crate::registry::ConnectionId;
use log::info;
use serde_json::Value;
use shared::{LogEntry, Reflections, Roles, ServerMessage, StateMap};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One exercise instance: the leader's state blob plus relay bookkeeping
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    /// Role name to player. A player holds at most one role.
    pub roles: Roles,
    /// Leader-authored state; only ever shallow-merged
    pub state: StateMap,
    /// Non-owning handles of the connections bound to this session
    pub connections: BTreeSet<ConnectionId>,
    pub started: bool,
    /// Deduplication flags for the missed-reflection penalty
    pub penalty_applied_for_round: BTreeMap<u32, bool>,
    /// Label for correlating external log entries, stamped on start
    pub game_instance: String,
    /// Accumulated per-action log since the last start
    pub log: Vec<LogEntry>,
    pub reflections: Reflections,
}

/// Result of a `session-start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session left the lobby
    Started,
    /// The session was already active; state was replaced in place
    Restarted,
}

impl Session {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            ..Self::default()
        }
    }

    /// Binds `role` to `player_id`, releasing any other role the player held.
    /// Returns true if the role map changed.
    pub fn bind_role(&mut self, role: &str, player_id: &str) -> bool {
        if self.roles.get(role).map(String::as_str) == Some(player_id) {
            return false;
        }
        self.roles.retain(|r, p| r.as_str() == role || p.as_str() != player_id);
        self.roles.insert(role.to_owned(), player_id.to_owned());
        true
    }

    /// Player identifier bound to `role`
    pub fn player_for(&self, role: &str) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }

    /// Player to role, as written to the action log on start
    pub fn player_roles(&self) -> BTreeMap<String, String> {
        self.roles
            .iter()
            .filter(|(_, player)| !player.is_empty())
            .map(|(role, player)| (player.clone(), role.clone()))
            .collect()
    }

    /// Shallow, last-write-wins merge of `partial` into the state
    pub fn merge(&mut self, partial: StateMap) {
        for (key, value) in partial {
            self.state.insert(key, value);
        }
    }

    /// Current round as recorded by the leader
    pub fn round_num(&self) -> Option<u32> {
        self.state
            .get("roundNum")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn is_penalized(&self, round: u32) -> bool {
        self.penalty_applied_for_round
            .get(&round)
            .copied()
            .unwrap_or(false)
    }

    pub fn push_log(&mut self, kind: &str, player_id: Option<&str>, data: Value) {
        self.log.push(LogEntry {
            kind: kind.to_owned(),
            player_id: player_id.map(str::to_owned),
            data,
        });
    }

    pub fn record_reflection(&mut self, round: u32, player_id: &str, text: &str) {
        self.reflections
            .entry(round)
            .or_default()
            .insert(player_id.to_owned(), text.to_owned());
    }

    /// Full snapshot delivered to a connection that registers mid-session
    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::SessionStarted {
            state: self.state.clone(),
            roles: self.roles.clone(),
        }
    }

    /// Reconciled state envelope, built from the fields as they are right now
    pub fn state_update(&self) -> ServerMessage {
        ServerMessage::StateUpdate {
            state: self.state.clone(),
            roles: self.roles.clone(),
            log: self.log.clone(),
            reflections: self.reflections.clone(),
        }
    }
}

/// All sessions known to this process
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session, creating an empty lobby session if it is unknown
    pub fn get_or_create(&mut self, session_id: &str) -> &mut Session {
        self.sessions.entry(session_id.to_owned()).or_insert_with(|| {
            info!("[{}] New session created", session_id);
            Session::new(session_id)
        })
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(session_id)
    }

    /// Moves the session from lobby to active.
    ///
    /// State is replaced by `initial_state`, penalty flags and the action log
    /// are cleared, and the leader's role binding is confirmed. `started` and
    /// `game_instance` are only written on the first start; a repeated start
    /// keeps the original label.
    pub fn start(
        &mut self,
        session_id: &str,
        initial_state: StateMap,
        leader_role: &str,
        leader_player_id: &str,
        game_instance: String,
    ) -> StartOutcome {
        let session = self.get_or_create(session_id);
        session.state = initial_state;
        session.penalty_applied_for_round.clear();
        session.log.clear();
        if session.bind_role(leader_role, leader_player_id) {
            info!(
                "[{}] Explicitly registered leader role for {}",
                session_id, leader_player_id
            );
        }

        if session.started {
            StartOutcome::Restarted
        } else {
            session.started = true;
            session.game_instance = game_instance;
            info!("[{}] New gameInstance: {}", session_id, session.game_instance);
            StartOutcome::Started
        }
    }

    /// Shallow-merges `partial` into the session's state
    pub fn merge(&mut self, session_id: &str, partial: StateMap) -> &Session {
        let session = self.get_or_create(session_id);
        session.merge(partial);
        session
    }

    /// Replaces the session with an empty one.
    ///
    /// Connection handles are carried over: they belong to the transport,
    /// not to the discarded session state.
    pub fn reset(&mut self, session_id: &str) -> &mut Session {
        let connections = self
            .sessions
            .remove(session_id)
            .map(|old| old.connections)
            .unwrap_or_default();

        let session = self
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Session::new(session_id));
        session.connections = connections;
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// `HH:MM` of `now_ms` shifted by `utc_offset_secs`
pub fn game_instance_label(now_ms: u64, utc_offset_secs: i64) -> String {
    let local_secs = (now_ms / 1000) as i64 + utc_offset_secs;
    let day_secs = local_secs.rem_euclid(24 * 60 * 60);
    format!("{:02}:{:02}", day_secs / 3600, (day_secs % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("state must be an object"),
        }
    }

    #[test]
    fn test_get_or_create_is_lazy_and_empty() {
        let mut store = SessionStore::new();
        assert!(store.get("S1").is_none());

        let session = store.get_or_create("S1");
        assert_eq!(session.id, "S1");
        assert!(!session.started);
        assert!(session.roles.is_empty());
        assert!(session.state.is_empty());
        assert!(session.penalty_applied_for_round.is_empty());

        store.get_or_create("S1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_round_num_out_of_range_is_none() {
        let mut session = Session::new("S1");
        session.state = state(json!({"roundNum": 4_294_967_299u64}));
        assert_eq!(session.round_num(), None);

        session.state = state(json!({"roundNum": 3}));
        assert_eq!(session.round_num(), Some(3));
    }

    #[test]
    fn test_merge_is_shallow_last_write_wins() {
        let mut store = SessionStore::new();
        store.get_or_create("S1").state = state(json!({"roundNum": 1, "inventory": {"A": 0}}));

        store.merge("S1", state(json!({"roundNum": 2})));
        let session = store.merge("S1", state(json!({"inventory": {"A": 5}})));

        assert_eq!(
            Value::Object(session.state.clone()),
            json!({"roundNum": 2, "inventory": {"A": 5}})
        );
    }

    #[test]
    fn test_merge_replaces_nested_values_wholesale() {
        let mut session = Session::new("S1");
        session.state = state(json!({"inventory": {"A": 1, "W": 2}}));
        session.merge(state(json!({"inventory": {"S": 3}})));

        assert_eq!(session.state["inventory"], json!({"S": 3}));
    }

    #[test]
    fn test_merge_twice_equals_merge_once() {
        let partial = state(json!({"curr": [2, 3], "visited": [[0, 0], [2, 3]]}));
        let mut once = Session::new("S1");
        once.state = state(json!({"roundNum": 1}));
        let mut twice = once.clone();

        once.merge(partial.clone());
        twice.merge(partial.clone());
        twice.merge(partial);

        assert_eq!(once.state, twice.state);
    }

    #[test]
    fn test_start_transitions_once() {
        let mut store = SessionStore::new();
        store.get_or_create("S1").penalty_applied_for_round.insert(1, true);

        let outcome = store.start(
            "S1",
            state(json!({"roundNum": 1})),
            "Charlie",
            "leader-1",
            "09:30".into(),
        );
        assert_eq!(outcome, StartOutcome::Started);

        let session = store.get("S1").unwrap();
        assert!(session.started);
        assert_eq!(session.game_instance, "09:30");
        assert_eq!(session.player_for("Charlie"), Some("leader-1"));
        assert!(session.penalty_applied_for_round.is_empty());
    }

    #[test]
    fn test_repeated_start_keeps_instance_and_replaces_state() {
        let mut store = SessionStore::new();
        store.start("S1", state(json!({"roundNum": 1})), "Charlie", "L", "09:30".into());
        store.get_mut("S1").unwrap().penalty_applied_for_round.insert(1, true);
        store.get_mut("S1").unwrap().push_log("move", Some("L"), json!("up"));

        let outcome = store.start("S1", state(json!({"roundNum": 7})), "Charlie", "L", "10:45".into());
        assert_eq!(outcome, StartOutcome::Restarted);

        let session = store.get("S1").unwrap();
        assert_eq!(session.game_instance, "09:30");
        assert_eq!(session.round_num(), Some(7));
        assert!(session.penalty_applied_for_round.is_empty());
        assert!(session.log.is_empty());
    }

    #[test]
    fn test_bind_role_keeps_one_role_per_player() {
        let mut session = Session::new("S1");
        assert!(session.bind_role("Alpha", "p1"));
        assert!(!session.bind_role("Alpha", "p1"));
        assert!(session.bind_role("Bravo", "p1"));

        assert_eq!(session.player_for("Alpha"), None);
        assert_eq!(session.player_for("Bravo"), Some("p1"));

        assert!(session.bind_role("Bravo", "p2"));
        assert_eq!(session.player_for("Bravo"), Some("p2"));
        assert_eq!(session.roles.len(), 1);
    }

    #[test]
    fn test_reset_discards_everything_but_connections() {
        let mut store = SessionStore::new();
        store.start("S1", state(json!({"roundNum": 3})), "Charlie", "L", "09:30".into());
        {
            let session = store.get_mut("S1").unwrap();
            session.connections.insert(11);
            session.connections.insert(12);
            session.penalty_applied_for_round.insert(3, true);
            session.record_reflection(3, "p2", "text");
        }

        let session = store.reset("S1");
        assert!(!session.started);
        assert!(session.roles.is_empty());
        assert!(session.state.is_empty());
        assert!(session.penalty_applied_for_round.is_empty());
        assert!(session.reflections.is_empty());
        assert!(session.game_instance.is_empty());
        assert_eq!(session.connections.iter().copied().collect::<Vec<_>>(), vec![11, 12]);
    }

    #[test]
    fn test_reset_unknown_session_creates_it() {
        let mut store = SessionStore::new();
        store.reset("fresh");
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_snapshot_mirrors_current_fields() {
        let mut session = Session::new("S1");
        session.bind_role("Charlie", "L");
        session.state = state(json!({"roundNum": 2}));

        match session.snapshot() {
            ServerMessage::SessionStarted { state, roles } => {
                assert_eq!(state, session.state);
                assert_eq!(roles, session.roles);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_player_roles_inverts_map() {
        let mut session = Session::new("S1");
        session.bind_role("Charlie", "L");
        session.bind_role("Alpha", "p2");

        let inverted = session.player_roles();
        assert_eq!(inverted.get("L").map(String::as_str), Some("Charlie"));
        assert_eq!(inverted.get("p2").map(String::as_str), Some("Alpha"));
    }

    #[test]
    fn test_game_instance_label() {
        // 2024-01-01T00:00:00Z
        let midnight_utc = 1_704_067_200_000;
        assert_eq!(game_instance_label(midnight_utc, 0), "00:00");
        assert_eq!(game_instance_label(midnight_utc, 8 * 3600), "08:00");
        assert_eq!(game_instance_label(midnight_utc + 90_000, -3600), "23:01");
    }
}
