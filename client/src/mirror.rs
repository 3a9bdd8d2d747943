use log::debug;
use serde_json::Value;
use shared::{LogEntry, Roles, RoundTimer, ServerMessage, StateMap};
use std::collections::BTreeMap;

/// A participant's local copy of the session, rebuilt from relayed messages.
///
/// Every gameplay message carries the leader's full merged state, so each
/// one simply replaces the local copy. Counting down is local: the timer is
/// built from the epochs in the first state that carries them and is never
/// recomputed from the local clock.
#[derive(Debug, Clone, Default)]
pub struct SessionMirror {
    pub state: StateMap,
    pub roles: Roles,
    pub log: Vec<LogEntry>,
    pub started: bool,
    timer: Option<RoundTimer>,
}

impl SessionMirror {
    /// Empty mirror for a participant that has not seen the session start
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mirror with a session snapshot.
    ///
    /// Used for `session-started`, both the leader's own start and a late
    /// join. The timer is rebuilt from the snapshot's epochs and the
    /// accumulated log is dropped until the next `state-update` brings it.
    pub fn replace(&mut self, state: StateMap, roles: Roles) {
        self.timer = RoundTimer::from_state(&state);
        self.state = state;
        self.roles = roles;
        self.log.clear();
        self.started = true;
    }

    /// Applies one relayed message. Returns true if the local state changed.
    ///
    /// A penalty only overwrites the inventory, and a reset returns the
    /// mirror to its empty state. Messages that carry no state are ignored.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::SessionStarted { state, roles } => {
                self.replace(state.clone(), roles.clone());
                true
            }
            ServerMessage::StateUpdate {
                state, roles, log, ..
            } => {
                self.roles = roles.clone();
                self.log = log.clone();
                self.adopt_state(state);
                true
            }
            ServerMessage::Move { state, .. }
            | ServerMessage::Inject { state, .. }
            | ServerMessage::InventoryUpdate { state, .. } => {
                self.adopt_state(state);
                true
            }
            ServerMessage::ReflectionPenalty { inventory, .. } => {
                self.state
                    .insert("inventory".into(), Value::Object(inventory.clone()));
                true
            }
            ServerMessage::SessionReset {} => {
                *self = Self::default();
                true
            }
            other => {
                debug!("Mirror ignores '{}'", other.kind());
                false
            }
        }
    }

    fn adopt_state(&mut self, state: &StateMap) {
        self.state = state.clone();
        match &mut self.timer {
            Some(timer) => timer.sync_from_state(state),
            None => self.timer = RoundTimer::from_state(state),
        }
    }

    /// Local countdown, once some state has carried the clock epochs
    pub fn timer(&self) -> Option<&RoundTimer> {
        self.timer.as_ref()
    }

    pub fn timer_mut(&mut self) -> Option<&mut RoundTimer> {
        self.timer.as_mut()
    }

    /// Round as last written by the leader
    pub fn round_num(&self) -> Option<u32> {
        self.state
            .get("roundNum")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    }

    /// Item counts, ignoring entries that are not integers
    pub fn inventory(&self) -> BTreeMap<String, i64> {
        match self.state.get("inventory") {
            Some(Value::Object(items)) => items
                .iter()
                .filter_map(|(code, count)| count.as_i64().map(|n| (code.clone(), n)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Player currently bound to `role`
    pub fn player_for(&self, role: &str) -> Option<&str> {
        self.roles.get(role).map(String::as_str)
    }
}
