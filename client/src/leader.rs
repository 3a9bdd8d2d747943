use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use shared::protocol::{
    InjectPayload, InventoryUpdatePayload, MovePayload, SessionStartPayload, StateUpdatePayload,
};
use shared::{aligned_start, ClientMessage, GameConfig, RoundClock, StateMap};
use std::collections::{BTreeMap, BTreeSet};

/// Chance that stepping onto an unvisited cell turns up an item
const PICKUP_CHANCE: f64 = 0.3;

/// Chance that an inject takes a random item instead of letting the leader pick
const RANDOM_INJECT_CHANCE: f64 = 0.3;

const INJECT_STORIES: [&str; 6] = [
    "A rockslide buries part of the camp.",
    "A river crossing sweeps a pack downstream.",
    "A curious goat chews through a strap.",
    "A storm forces the team to lighten its load.",
    "A toll keeper demands payment at the bridge.",
    "A hidden pit swallows whatever was on top.",
];

/// One grid step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// Name used on the wire as the `move` payload
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    fn offset(self) -> (i64, i64) {
        match self {
            Direction::Up => (-1, 0),
            Direction::Down => (1, 0),
            Direction::Left => (0, -1),
            Direction::Right => (0, 1),
        }
    }
}

/// Leader-side author of the session state.
///
/// Walks the team on an N×N grid, tracks visited cells and the team
/// inventory, and turns each action into the message that carries the
/// changed part of the state to the relay. Random events come from two
/// sources: a pickup when a new cell is discovered, and an inject when a
/// new cell holding one is discovered from the configured round onward.
pub struct LeaderDriver {
    player_id: String,
    config: GameConfig,
    clock: Option<RoundClock>,
    position: (u32, u32),
    visited: BTreeSet<(u32, u32)>,
    inject_cells: BTreeSet<(u32, u32)>,
    inventory: BTreeMap<String, i64>,
    round_num: u32,
    steps_this_round: u32,
    rng: StdRng,
}

impl LeaderDriver {
    /// Creates a driver standing on the origin with an empty inventory.
    ///
    /// `rng` drives every random decision, so a seeded generator replays
    /// the same walk.
    pub fn new(player_id: &str, config: GameConfig, rng: StdRng) -> Self {
        let inventory = config.item_codes().map(|code| (code.to_owned(), 0)).collect();
        Self {
            player_id: player_id.to_owned(),
            config,
            clock: None,
            position: (0, 0),
            visited: BTreeSet::from([(0, 0)]),
            inject_cells: BTreeSet::new(),
            inventory,
            round_num: 1,
            steps_this_round: 0,
            rng,
        }
    }

    pub fn clock(&self) -> Option<&RoundClock> {
        self.clock.as_ref()
    }

    pub fn position(&self) -> (u32, u32) {
        self.position
    }

    pub fn inventory(&self) -> &BTreeMap<String, i64> {
        &self.inventory
    }

    pub fn round_num(&self) -> u32 {
        self.round_num
    }

    /// Picks the start epoch and returns the session's initial state.
    ///
    /// The start is aligned to the next whole second. This is also when the
    /// grid cells holding an inject event are drawn.
    pub fn start(&mut self, now_ms: u64) -> StateMap {
        let clock = RoundClock::new(
            aligned_start(now_ms),
            self.config.round_duration_sec,
            self.config.round_count,
        );
        info!(
            "Session starts at {} and ends at {} ({}s)",
            clock.session_start_ms,
            clock.session_end_ms(),
            self.config.session_duration_sec()
        );
        self.clock = Some(clock);
        self.round_num = 1;
        self.steps_this_round = 0;
        self.inject_cells = self.draw_inject_cells();
        self.state()
    }

    fn draw_inject_cells(&mut self) -> BTreeSet<(u32, u32)> {
        let size = self.config.grid_size;
        let mut cells: Vec<(u32, u32)> = (0..size)
            .flat_map(|row| (0..size).map(move |col| (row, col)))
            .collect();
        cells.shuffle(&mut self.rng);

        let share = self.config.inject_cell_share.clamp(0.0, 1.0);
        let quiet = (cells.len() as f64 * (1.0 - share)).round() as usize;
        cells.into_iter().skip(quiet).collect()
    }

    /// `session-start` carrying `state`
    pub fn session_start(&self, role: &str, state: StateMap) -> ClientMessage {
        ClientMessage::SessionStart(SessionStartPayload {
            player_id: self.player_id.clone(),
            role: role.to_owned(),
            state,
        })
    }

    /// Full current state, including the clock epochs once started.
    ///
    /// This is what `session-start` carries. Later messages carry only the
    /// fields they change and rely on the relay's merge for the rest.
    pub fn state(&self) -> StateMap {
        let mut state = match &self.clock {
            Some(clock) => clock.epoch_fields(),
            None => StateMap::new(),
        };
        if let Some(clock) = &self.clock {
            state.insert(
                "roundEndTime".into(),
                json!(clock.round_end_ms(self.round_num)),
            );
        }
        state.insert("roundNum".into(), json!(self.round_num));
        state.insert("gridSize".into(), json!(self.config.grid_size));
        state.insert("curr".into(), self.position_value());
        state.insert("visited".into(), self.visited_value());
        state.insert("stepsThisRound".into(), json!(self.steps_this_round));
        state.insert("inventory".into(), self.inventory_value());
        state
    }

    /// Steps that keep the team on the grid
    pub fn legal_steps(&self) -> Vec<Direction> {
        Direction::ALL
            .into_iter()
            .filter(|direction| self.target(*direction).is_some())
            .collect()
    }

    fn target(&self, direction: Direction) -> Option<(u32, u32)> {
        let (dr, dc) = direction.offset();
        let row = i64::from(self.position.0) + dr;
        let col = i64::from(self.position.1) + dc;
        let size = i64::from(self.config.grid_size);
        if (0..size).contains(&row) && (0..size).contains(&col) {
            Some((row as u32, col as u32))
        } else {
            None
        }
    }

    /// Takes one random legal step.
    ///
    /// Returns the `move` first. A newly discovered cell may add a pickup
    /// (`pickup-choices-shown` then `inventory-update`) and, from
    /// `inject_start_round` on, an inject (`show-modal` then `inject`).
    /// Returns nothing once the round's step budget is spent.
    pub fn next_move(&mut self) -> Vec<ClientMessage> {
        if self.steps_this_round >= self.config.max_steps_per_round {
            debug!("No steps left in round {}", self.round_num);
            return Vec::new();
        }
        let Some(direction) = self.legal_steps().choose(&mut self.rng).copied() else {
            return Vec::new();
        };
        let Some(target) = self.target(direction) else {
            return Vec::new();
        };

        self.position = target;
        self.steps_this_round += 1;
        let discovered = self.visited.insert(target);

        let mut partial = StateMap::new();
        partial.insert("curr".into(), self.position_value());
        partial.insert("visited".into(), self.visited_value());
        partial.insert("stepsThisRound".into(), json!(self.steps_this_round));

        let mut messages = vec![ClientMessage::Move(MovePayload {
            player_id: Some(self.player_id.clone()),
            step: json!(direction.as_str()),
            state: partial,
        })];

        if !discovered {
            return messages;
        }
        if self.rng.gen_bool(PICKUP_CHANCE) {
            messages.extend(self.pick_up());
        }
        if self.round_num >= self.config.inject_start_round && self.inject_cells.remove(&target) {
            messages.extend(self.inject());
        }
        messages
    }

    /// Offers up to two items and takes one of them
    fn pick_up(&mut self) -> Vec<ClientMessage> {
        let codes: Vec<String> = self.inventory.keys().cloned().collect();
        let options: Vec<String> = codes.choose_multiple(&mut self.rng, 2).cloned().collect();
        let Some(code) = options.choose(&mut self.rng).cloned() else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        if options.len() > 1 {
            let offered: Vec<Value> = options
                .iter()
                .map(|code| json!({"code": code, "qty": 1}))
                .collect();
            messages.push(ClientMessage::PickupChoicesShown(json!({ "options": offered })));
        }

        *self.inventory.entry(code.clone()).or_insert(0) += 1;
        info!("Picked up {} at {:?}", code, self.position);

        let inventory = self.inventory_value();
        let mut partial = StateMap::new();
        partial.insert("inventory".into(), inventory.clone());
        messages.push(ClientMessage::InventoryUpdate(InventoryUpdatePayload {
            inventory,
            state: partial,
        }));
        messages
    }

    /// Costs the team one item, if it has any.
    ///
    /// A random inject takes any item with a positive count. Otherwise the
    /// leader chooses and gives up the most plentiful one. The inject is
    /// sent even when nothing could be lost, so members still see the story.
    fn inject(&mut self) -> Vec<ClientMessage> {
        let story = INJECT_STORIES.choose(&mut self.rng).copied().unwrap_or_default();
        let available: Vec<(String, i64)> = self
            .inventory
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(code, count)| (code.clone(), *count))
            .collect();

        let random = self.rng.gen_bool(RANDOM_INJECT_CHANCE);
        let lost = if random {
            available.choose(&mut self.rng).map(|(code, _)| code.clone())
        } else {
            available
                .iter()
                .max_by_key(|(_, count)| *count)
                .map(|(code, _)| code.clone())
        };

        let mut messages = Vec::new();
        let inject = match &lost {
            Some(code) => {
                if let Some(count) = self.inventory.get_mut(code) {
                    *count -= 1;
                }
                info!("Inject in round {}: lost {}", self.round_num, code);
                messages.push(ClientMessage::ShowModal(json!({
                    "emoji": "",
                    "main": format!("You lost 1 {}!", self.config.item_name(code)),
                    "sub": story,
                    "okText": "OK",
                    "borderColor": "#e0e0e0",
                    "eventType": "Inject event",
                })));
                let kind = if random { "random" } else { "choice" };
                json!({"type": kind, "item": code, "story": story})
            }
            None => {
                info!("Inject in round {}: no items to lose", self.round_num);
                json!({"type": "none", "story": story})
            }
        };

        let mut partial = StateMap::new();
        partial.insert("inventory".into(), self.inventory_value());
        partial.insert("curr".into(), self.position_value());
        partial.insert("visited".into(), self.visited_value());
        partial.insert("inject".into(), inject.clone());
        messages.push(ClientMessage::Inject(InjectPayload {
            inject,
            state: partial,
        }));
        messages
    }

    /// Moves to `round` and returns the `state-update` announcing it.
    ///
    /// Resets the step budget and pushes the round's end epoch so late
    /// joiners rebuild their timer from it.
    pub fn advance_round(&mut self, round: u32) -> ClientMessage {
        self.round_num = round;
        self.steps_this_round = 0;

        let mut partial = StateMap::new();
        partial.insert("roundNum".into(), json!(round));
        partial.insert("stepsThisRound".into(), json!(0));
        if let Some(clock) = &self.clock {
            partial.insert("roundEndTime".into(), json!(clock.round_end_ms(round)));
        }
        ClientMessage::StateUpdate(StateUpdatePayload { state: partial })
    }

    /// Adopts the inventory the relay left after a penalty.
    ///
    /// Non-integer counts are dropped, since the leader only ever writes
    /// whole numbers.
    pub fn apply_penalty(&mut self, inventory: &StateMap) {
        self.inventory = inventory
            .iter()
            .filter_map(|(code, count)| count.as_i64().map(|n| (code.clone(), n)))
            .collect();
    }

    fn position_value(&self) -> Value {
        json!([self.position.0, self.position.1])
    }

    fn visited_value(&self) -> Value {
        Value::Array(
            self.visited
                .iter()
                .map(|(row, col)| json!([row, col]))
                .collect(),
        )
    }

    fn inventory_value(&self) -> Value {
        Value::Object(
            self.inventory
                .iter()
                .map(|(code, count)| (code.clone(), json!(count)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn driver() -> LeaderDriver {
        LeaderDriver::new("L", GameConfig::default(), StdRng::seed_from_u64(3))
    }

    #[test]
    fn test_start_aligns_epochs() {
        let mut leader = driver();
        let state = leader.start(10_250);

        assert_eq!(state["sessionStartTime"], json!(11_000));
        assert_eq!(state["roundEndTime"], json!(11_000 + 120_000));
        assert_eq!(state["sessionEndTime"], json!(11_000 + 4 * 120_000));
        assert_eq!(state["roundNum"], json!(1));
        assert_eq!(state["curr"], json!([0, 0]));
        assert_eq!(state["inventory"], json!({"A": 0, "W": 0, "S": 0, "C": 0}));
    }

    #[test]
    fn test_corner_has_two_legal_steps() {
        let leader = driver();
        assert_eq!(
            leader.legal_steps(),
            vec![Direction::Down, Direction::Right]
        );
    }

    #[test]
    fn test_moves_stay_on_grid_and_respect_budget() {
        let mut leader = driver();
        leader.start(0);

        let mut moves = 0;
        for _ in 0..10 {
            let messages = leader.next_move();
            if messages.is_empty() {
                break;
            }
            assert_eq!(messages[0].kind(), "move");
            moves += 1;
            let (row, col) = leader.position();
            assert!(row < 5 && col < 5);
        }
        assert_eq!(moves, 3);

        leader.advance_round(2);
        assert!(!leader.next_move().is_empty());
    }

    #[test]
    fn test_advance_round_pushes_new_end_time() {
        let mut leader = driver();
        leader.start(0);

        match leader.advance_round(2) {
            ClientMessage::StateUpdate(payload) => {
                assert_eq!(payload.state["roundNum"], json!(2));
                assert_eq!(payload.state["roundEndTime"], json!(240_000));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(leader.state()["roundEndTime"], json!(240_000));
    }

    fn inject_config() -> GameConfig {
        GameConfig::from_json(r#"{"INJECT_START_ROUND": 1, "INJECT_CELL_SHARE": 1.0}"#).unwrap()
    }

    #[test]
    fn test_first_discovery_fires_inject_when_enabled() {
        let mut leader = LeaderDriver::new("L", inject_config(), StdRng::seed_from_u64(8));
        leader.start(0);

        let messages = leader.next_move();
        assert_eq!(messages[0].kind(), "move");
        match messages.last() {
            Some(ClientMessage::Inject(payload)) => {
                assert!(payload.inject["story"].is_string());
                assert_eq!(payload.state["inject"], payload.inject);
                assert_eq!(payload.state["curr"], messages_curr(&messages[0]));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    fn messages_curr(message: &ClientMessage) -> Value {
        match message {
            ClientMessage::Move(payload) => payload.state["curr"].clone(),
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_no_inject_before_start_round() {
        let mut leader = driver();
        leader.start(0);

        for round in 1..4 {
            leader.advance_round(round);
            for _ in 0..3 {
                let kinds: Vec<&str> = leader.next_move().iter().map(|m| m.kind()).collect();
                assert_eq!(kinds.first().copied(), Some("move"));
                assert!(!kinds.contains(&"inject"));
                assert!(!kinds.contains(&"show-modal"));
            }
        }
    }

    #[test]
    fn test_inject_costs_one_item_and_announces_it() {
        let mut leader = LeaderDriver::new("L", inject_config(), StdRng::seed_from_u64(5));
        leader.start(0);
        let mut inventory = StateMap::new();
        inventory.insert("W".into(), json!(2));
        leader.apply_penalty(&inventory);

        let messages = leader.inject();

        assert_eq!(
            messages.iter().map(|m| m.kind()).collect::<Vec<_>>(),
            vec!["show-modal", "inject"]
        );
        match &messages[0] {
            ClientMessage::ShowModal(modal) => {
                assert_eq!(modal["main"], json!("You lost 1 Water!"));
                assert_eq!(modal["eventType"], json!("Inject event"));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        match &messages[1] {
            ClientMessage::Inject(payload) => {
                assert_eq!(payload.inject["item"], json!("W"));
                assert_eq!(payload.state["inventory"], json!({"W": 1}));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(leader.inventory().get("W"), Some(&1));
    }

    #[test]
    fn test_inject_with_empty_inventory_loses_nothing() {
        let mut leader = LeaderDriver::new("L", inject_config(), StdRng::seed_from_u64(5));
        leader.start(0);

        let messages = leader.inject();

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ClientMessage::Inject(payload) => assert_eq!(payload.inject["type"], json!("none")),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(leader.inventory().values().all(|count| *count == 0));
    }

    #[test]
    fn test_pickup_shows_choices_then_takes_one() {
        let mut leader = driver();
        leader.start(0);

        let messages = leader.pick_up();

        assert_eq!(
            messages.iter().map(|m| m.kind()).collect::<Vec<_>>(),
            vec!["pickup-choices-shown", "inventory-update"]
        );
        let offered: Vec<String> = match &messages[0] {
            ClientMessage::PickupChoicesShown(payload) => payload["options"]
                .as_array()
                .unwrap()
                .iter()
                .map(|option| option["code"].as_str().unwrap().to_string())
                .collect(),
            other => panic!("Unexpected message: {:?}", other),
        };
        assert_eq!(offered.len(), 2);
        let taken: Vec<&String> = leader
            .inventory()
            .iter()
            .filter(|(_, count)| **count == 1)
            .map(|(code, _)| code)
            .collect();
        assert_eq!(taken.len(), 1);
        assert!(offered.contains(taken[0]));
    }

    #[test]
    fn test_inject_cells_follow_share() {
        let mut leader = driver();
        leader.start(0);
        assert_eq!(leader.inject_cells.len(), 20);

        let mut none = LeaderDriver::new(
            "L",
            GameConfig::from_json(r#"{"INJECT_CELL_SHARE": 0.0}"#).unwrap(),
            StdRng::seed_from_u64(1),
        );
        none.start(0);
        assert!(none.inject_cells.is_empty());
    }

    #[test]
    fn test_penalty_is_adopted() {
        let mut leader = driver();
        let mut inventory = StateMap::new();
        inventory.insert("A".into(), json!(0));
        inventory.insert("W".into(), json!(2));

        leader.apply_penalty(&inventory);

        assert_eq!(leader.inventory().get("W"), Some(&2));
        assert_eq!(leader.inventory().len(), 2);
    }
}
