//! Round and session countdowns derived from a shared start epoch.
//!
//! Nothing here ticks on the relay. The leader picks a start epoch, ships
//! the derived end epochs inside the session state, and every participant
//! polls its own wall clock against those epochs. Two parties holding the
//! same epochs and configuration therefore agree on the round number and
//! remaining time up to their polling interval.

use crate::protocol::StateMap;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Polling interval used by participants for countdown checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// First whole-second epoch at or after `now_ms`
///
/// Aligning the start to a second boundary keeps the visible "seconds left"
/// of every participant flipping at the same instant.
pub fn aligned_start(now_ms: u64) -> u64 {
    match now_ms % 1000 {
        0 => now_ms,
        rem => now_ms + (1000 - rem),
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Pure clock configuration shared by all participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundClock {
    pub session_start_ms: u64,
    pub round_duration_sec: u64,
    pub total_rounds: u32,
}

/// Snapshot of a [`RoundClock`] at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub round_num: u32,
    pub remaining_round_sec: u64,
    pub remaining_session_sec: u64,
    pub session_ended: bool,
}

impl RoundClock {
    pub fn new(session_start_ms: u64, round_duration_sec: u64, total_rounds: u32) -> Self {
        Self {
            session_start_ms,
            round_duration_sec,
            total_rounds: total_rounds.max(1),
        }
    }

    fn round_ms(&self) -> u64 {
        self.round_duration_sec.saturating_mul(1000)
    }

    pub fn session_end_ms(&self) -> u64 {
        self.round_end_ms(self.total_rounds)
    }

    /// End epoch of `round` (1-based)
    ///
    /// Saturates at `u64::MAX`, which reads as a round that never ends.
    pub fn round_end_ms(&self, round: u32) -> u64 {
        let elapsed = u64::from(round.max(1)).saturating_mul(self.round_ms());
        self.session_start_ms.saturating_add(elapsed)
    }

    /// Reads the clock at `now_ms`.
    ///
    /// Before the start epoch the reading reports round 1 with the full
    /// durations remaining. Once the session end is reached the session-ended
    /// flag wins over any round advance and the final round is reported.
    pub fn reading(&self, now_ms: u64) -> ClockReading {
        let session_end = self.session_end_ms();
        if now_ms >= session_end {
            return ClockReading {
                round_num: self.total_rounds,
                remaining_round_sec: 0,
                remaining_session_sec: 0,
                session_ended: true,
            };
        }

        let elapsed = now_ms.saturating_sub(self.session_start_ms);
        let round_index = match self.round_ms() {
            0 => 0,
            round_ms => elapsed / round_ms,
        };
        let round_num = u32::try_from(round_index)
            .unwrap_or(u32::MAX)
            .saturating_add(1)
            .min(self.total_rounds);
        let now = now_ms.max(self.session_start_ms);

        ClockReading {
            round_num,
            remaining_round_sec: ceil_secs(self.round_end_ms(round_num).saturating_sub(now)),
            remaining_session_sec: ceil_secs(session_end - now),
            session_ended: false,
        }
    }

    /// State fields the leader ships with `session-start`
    pub fn epoch_fields(&self) -> StateMap {
        let mut fields = StateMap::new();
        fields.insert("sessionStartTime".into(), Value::from(self.session_start_ms));
        fields.insert("sessionEndTime".into(), Value::from(self.session_end_ms()));
        fields.insert("roundEndTime".into(), Value::from(self.round_end_ms(1)));
        fields.insert("roundDuration".into(), Value::from(self.round_duration_sec));
        fields.insert("totalRounds".into(), Value::from(self.total_rounds));
        fields
    }
}

/// Boundary crossings observed by a polling participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    RoundEnded(u32),
    SessionEnded { last_round: u32 },
}

/// Stateful countdown poller held by each participant
///
/// Tracks the current round and its end epoch, and reports each boundary
/// crossing exactly once. A crossing is purely local: every participant
/// detects it on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTimer {
    round_num: u32,
    round_end_ms: u64,
    session_end_ms: u64,
    round_duration_ms: u64,
    total_rounds: u32,
    finished: bool,
}

impl RoundTimer {
    /// Timer for a participant that witnessed the start computation
    pub fn from_clock(clock: &RoundClock) -> Self {
        Self {
            round_num: 1,
            round_end_ms: clock.round_end_ms(1),
            session_end_ms: clock.session_end_ms(),
            round_duration_ms: clock.round_ms(),
            total_rounds: clock.total_rounds,
            finished: false,
        }
    }

    /// Timer rebuilt from received state, for a participant that joined late.
    ///
    /// Uses the transmitted `sessionEndTime` and `roundEndTime` epochs as-is.
    /// Returns `None` when the state carries no epochs yet, or when the
    /// transmitted `roundDuration` does not fit in milliseconds.
    pub fn from_state(state: &StateMap) -> Option<Self> {
        let session_end_ms = state.get("sessionEndTime").and_then(Value::as_u64)?;
        let round_end_ms = state.get("roundEndTime").and_then(Value::as_u64)?;
        let round_duration_ms = state
            .get("roundDuration")
            .and_then(Value::as_u64)?
            .checked_mul(1000)?;
        let total_rounds = state
            .get("totalRounds")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
            .max(1);
        let round_num = state
            .get("roundNum")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
            .max(1);

        Some(Self {
            round_num,
            round_end_ms,
            session_end_ms,
            round_duration_ms,
            total_rounds,
            finished: false,
        })
    }

    pub fn round_num(&self) -> u32 {
        self.round_num.min(self.total_rounds)
    }

    pub fn round_end_ms(&self) -> u64 {
        self.round_end_ms
    }

    pub fn session_end_ms(&self) -> u64 {
        self.session_end_ms
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn remaining_round_sec(&self, now_ms: u64) -> u64 {
        ceil_secs(self.round_end_ms.saturating_sub(now_ms))
    }

    pub fn remaining_session_sec(&self, now_ms: u64) -> u64 {
        ceil_secs(self.session_end_ms.saturating_sub(now_ms))
    }

    /// Adopts epochs pushed by the leader without rewinding the local round
    pub fn sync_from_state(&mut self, state: &StateMap) {
        if let Some(other) = RoundTimer::from_state(state) {
            if other.round_num >= self.round_num {
                self.round_num = other.round_num;
                self.round_end_ms = other.round_end_ms;
            }
            self.session_end_ms = other.session_end_ms;
        }
    }

    /// Compares `now_ms` against the tracked epochs.
    ///
    /// Session end short-circuits: when it has been reached only
    /// `SessionEnded` is reported, never a trailing round advance.
    pub fn poll(&mut self, now_ms: u64) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        if now_ms >= self.session_end_ms {
            self.finished = true;
            events.push(TimerEvent::SessionEnded {
                last_round: self.round_num(),
            });
            return events;
        }

        while now_ms >= self.round_end_ms && self.round_num < self.total_rounds {
            events.push(TimerEvent::RoundEnded(self.round_num));
            self.round_num += 1;
            self.round_end_ms = self.round_end_ms.saturating_add(self.round_duration_ms.max(1));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_start() {
        assert_eq!(aligned_start(1_000), 1_000);
        assert_eq!(aligned_start(1_001), 2_000);
        assert_eq!(aligned_start(1_999), 2_000);
    }

    #[test]
    fn test_epochs_from_configuration() {
        let clock = RoundClock::new(10_000, 60, 3);
        assert_eq!(clock.session_end_ms(), 10_000 + 180_000);
        assert_eq!(clock.round_end_ms(1), 70_000);
        assert_eq!(clock.round_end_ms(2), 130_000);
    }

    #[test]
    fn test_reading_mid_round() {
        let clock = RoundClock::new(10_000, 60, 3);
        let reading = clock.reading(10_000 + 61_500);

        assert_eq!(reading.round_num, 2);
        assert_eq!(reading.remaining_round_sec, 59);
        assert_eq!(reading.remaining_session_sec, 119);
        assert!(!reading.session_ended);
    }

    #[test]
    fn test_reading_before_start() {
        let clock = RoundClock::new(10_000, 60, 3);
        let reading = clock.reading(9_400);

        assert_eq!(reading.round_num, 1);
        assert_eq!(reading.remaining_round_sec, 60);
        assert_eq!(reading.remaining_session_sec, 180);
    }

    #[test]
    fn test_session_end_takes_precedence_at_boundary() {
        let clock = RoundClock::new(0, 30, 2);
        let reading = clock.reading(60_000);

        assert!(reading.session_ended);
        assert_eq!(reading.round_num, 2);
        assert_eq!(reading.remaining_round_sec, 0);
        assert_eq!(reading.remaining_session_sec, 0);
    }

    #[test]
    fn test_independent_readings_agree() {
        let a = RoundClock::new(1_700_000_000_000, 45, 5);
        let b = RoundClock::new(1_700_000_000_000, 45, 5);

        for offset in (0..240_000).step_by(7_333) {
            let now = 1_700_000_000_000 + offset;
            assert_eq!(a.reading(now), b.reading(now));
        }
    }

    #[test]
    fn test_timer_reports_each_round_once() {
        let clock = RoundClock::new(0, 10, 3);
        let mut timer = RoundTimer::from_clock(&clock);

        assert!(timer.poll(9_999).is_empty());
        assert_eq!(timer.poll(10_000), vec![TimerEvent::RoundEnded(1)]);
        assert!(timer.poll(10_250).is_empty());
        assert_eq!(timer.round_num(), 2);
        assert_eq!(timer.remaining_round_sec(10_250), 10);
    }

    #[test]
    fn test_timer_catches_up_after_stall() {
        let clock = RoundClock::new(0, 10, 4);
        let mut timer = RoundTimer::from_clock(&clock);

        assert_eq!(
            timer.poll(25_000),
            vec![TimerEvent::RoundEnded(1), TimerEvent::RoundEnded(2)]
        );
        assert_eq!(timer.round_num(), 3);
    }

    #[test]
    fn test_timer_session_end_short_circuits_round_advance() {
        let clock = RoundClock::new(0, 10, 2);
        let mut timer = RoundTimer::from_clock(&clock);

        assert_eq!(timer.poll(10_000), vec![TimerEvent::RoundEnded(1)]);
        assert_eq!(
            timer.poll(20_000),
            vec![TimerEvent::SessionEnded { last_round: 2 }]
        );
        assert!(timer.is_finished());
        assert!(timer.poll(30_000).is_empty());
    }

    #[test]
    fn test_late_join_uses_transmitted_epochs() {
        let clock = RoundClock::new(5_000, 20, 3);
        let mut state = clock.epoch_fields();
        state.insert("roundNum".into(), Value::from(2));
        state.insert("roundEndTime".into(), Value::from(clock.round_end_ms(2)));

        let timer = RoundTimer::from_state(&state).unwrap();
        assert_eq!(timer.round_num(), 2);
        assert_eq!(timer.round_end_ms(), 45_000);
        assert_eq!(timer.session_end_ms(), 65_000);
        assert_eq!(timer.remaining_session_sec(40_000), 25);
    }

    #[test]
    fn test_timer_from_state_without_epochs() {
        assert!(RoundTimer::from_state(&StateMap::new()).is_none());
    }

    #[test]
    fn test_from_state_rejects_overflowing_duration() {
        let state = match serde_json::json!({
            "sessionEndTime": 10_000,
            "roundEndTime": 5_000,
            "roundDuration": u64::MAX / 10,
            "totalRounds": 2,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        assert!(RoundTimer::from_state(&state).is_none());
    }

    #[test]
    fn test_out_of_range_round_falls_back_to_first() {
        let mut state = RoundClock::new(0, 10, 3).epoch_fields();
        state.insert("roundNum".into(), Value::from(4_294_967_299u64));
        state.insert("totalRounds".into(), Value::from(4_294_967_299u64));

        let timer = RoundTimer::from_state(&state).unwrap();
        assert_eq!(timer.round_num(), 1);
    }

    #[test]
    fn test_clock_saturates_on_huge_duration() {
        let clock = RoundClock::new(1_000, u64::MAX / 10, 3);
        assert_eq!(clock.round_end_ms(1), u64::MAX);
        assert_eq!(clock.session_end_ms(), u64::MAX);

        let reading = clock.reading(2_000);
        assert_eq!(reading.round_num, 1);
        assert!(!reading.session_ended);

        let mut timer = RoundTimer::from_clock(&clock);
        assert!(timer.poll(u64::MAX - 1).is_empty());
    }

    #[test]
    fn test_sync_never_rewinds_round() {
        let clock = RoundClock::new(0, 10, 3);
        let mut timer = RoundTimer::from_clock(&clock);
        timer.poll(10_000);

        let stale = clock.epoch_fields();
        timer.sync_from_state(&stale);
        assert_eq!(timer.round_num(), 2);
        assert_eq!(timer.round_end_ms(), 20_000);
    }
}
