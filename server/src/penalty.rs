//! Team-wide penalty for a missed reflection deadline.
//!
//! Every participant detects round expiry on its own clock, so the same
//! round is usually reported missing several times. Only the first report
//! for a round removes an item; later ones are audit-only. Callers must run
//! this under the session's mutual exclusion for the check-then-set to hold.

use crate::session::Session;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Number, Value};
use shared::StateMap;

/// What a missed-reflection report did to the session
#[derive(Debug, Clone, PartialEq)]
pub enum PenaltyOutcome {
    /// First report for the round
    Applied {
        round: u32,
        /// Item removed, or `None` if nothing had a positive count
        item_code: Option<String>,
        /// Inventory after the deduction
        inventory: StateMap,
    },
    /// The round was already penalized
    AlreadyApplied { round: u32 },
}

fn is_positive(count: &Value) -> bool {
    count.as_f64().is_some_and(|f| f > 0.0)
}

/// `count` minus exactly one, keeping integer counts integral
fn minus_one(count: &Value) -> Value {
    if let Some(n) = count.as_i64() {
        return Value::from(n - 1);
    }
    if let Some(n) = count.as_u64() {
        return Value::from(n - 1);
    }
    count
        .as_f64()
        .and_then(|f| Number::from_f64(f - 1.0))
        .map_or_else(|| count.clone(), Value::Number)
}

/// Applies at most one penalty per round to `session`.
///
/// The removed item is drawn uniformly from the inventory codes with a
/// strictly positive count. The round is marked penalized even when no
/// item could be removed.
pub fn apply_missed_reflection<R: Rng + ?Sized>(
    session: &mut Session,
    round: u32,
    rng: &mut R,
) -> PenaltyOutcome {
    if session.is_penalized(round) {
        return PenaltyOutcome::AlreadyApplied { round };
    }

    let mut inventory = match session.state.get("inventory") {
        Some(Value::Object(map)) => map.clone(),
        _ => StateMap::new(),
    };

    let candidates: Vec<String> = inventory
        .iter()
        .filter(|(_, count)| is_positive(count))
        .map(|(code, _)| code.clone())
        .collect();

    let item_code = candidates.choose(rng).cloned();
    if let Some(code) = &item_code {
        if let Some(count) = inventory.get_mut(code) {
            *count = minus_one(count);
        }
    }

    session.penalty_applied_for_round.insert(round, true);
    session
        .state
        .insert("inventory".into(), Value::Object(inventory.clone()));

    PenaltyOutcome::Applied {
        round,
        item_code,
        inventory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn session_with_inventory(inventory: Value) -> Session {
        let mut session = Session::new("S1");
        session.state.insert("inventory".into(), inventory);
        session.state.insert("roundNum".into(), json!(3));
        session
    }

    #[test]
    fn test_only_positive_item_is_removed() {
        let mut session = session_with_inventory(json!({"A": 1, "W": 0, "S": 0, "C": 0}));
        let mut rng = StdRng::seed_from_u64(7);

        let outcome = apply_missed_reflection(&mut session, 3, &mut rng);
        match outcome {
            PenaltyOutcome::Applied {
                round,
                item_code,
                inventory,
            } => {
                assert_eq!(round, 3);
                assert_eq!(item_code.as_deref(), Some("A"));
                assert_eq!(Value::Object(inventory), json!({"A": 0, "W": 0, "S": 0, "C": 0}));
            }
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert!(session.is_penalized(3));
        assert_eq!(session.state["inventory"]["A"], json!(0));
    }

    #[test]
    fn test_repeated_reports_apply_once() {
        let mut session = session_with_inventory(json!({"A": 3, "W": 3}));
        let mut rng = StdRng::seed_from_u64(1);

        let first = apply_missed_reflection(&mut session, 2, &mut rng);
        assert!(matches!(first, PenaltyOutcome::Applied { .. }));

        for _ in 0..5 {
            let again = apply_missed_reflection(&mut session, 2, &mut rng);
            assert_eq!(again, PenaltyOutcome::AlreadyApplied { round: 2 });
        }

        let inventory = &session.state["inventory"];
        let total = inventory["A"].as_i64().unwrap() + inventory["W"].as_i64().unwrap();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_empty_inventory_still_marks_round() {
        let mut session = session_with_inventory(json!({"A": 0, "W": 0}));
        let mut rng = StdRng::seed_from_u64(3);

        let outcome = apply_missed_reflection(&mut session, 1, &mut rng);
        match outcome {
            PenaltyOutcome::Applied { item_code, .. } => assert!(item_code.is_none()),
            other => panic!("Unexpected outcome: {:?}", other),
        }
        assert!(session.is_penalized(1));
        assert_eq!(session.state["inventory"], json!({"A": 0, "W": 0}));
    }

    #[test]
    fn test_missing_inventory_is_treated_as_empty() {
        let mut session = Session::new("S1");
        let mut rng = StdRng::seed_from_u64(3);

        let outcome = apply_missed_reflection(&mut session, 4, &mut rng);
        assert!(matches!(
            outcome,
            PenaltyOutcome::Applied { item_code: None, .. }
        ));
        assert!(session.is_penalized(4));
    }

    #[test]
    fn test_fractional_count_loses_exactly_one() {
        let mut session = session_with_inventory(json!({"A": 1.5, "W": 0}));
        let mut rng = StdRng::seed_from_u64(2);

        let outcome = apply_missed_reflection(&mut session, 1, &mut rng);
        assert!(matches!(
            outcome,
            PenaltyOutcome::Applied { item_code: Some(ref code), .. } if code == "A"
        ));
        assert_eq!(session.state["inventory"]["A"], json!(0.5));
        assert_eq!(session.state["inventory"]["W"], json!(0));
    }

    #[test]
    fn test_count_below_one_is_still_a_candidate() {
        let mut session = session_with_inventory(json!({"S": 0.5, "C": -2}));
        let mut rng = StdRng::seed_from_u64(4);

        let outcome = apply_missed_reflection(&mut session, 2, &mut rng);
        assert!(matches!(
            outcome,
            PenaltyOutcome::Applied { item_code: Some(ref code), .. } if code == "S"
        ));
        assert_eq!(session.state["inventory"]["S"], json!(-0.5));
        assert_eq!(session.state["inventory"]["C"], json!(-2));
    }

    #[test]
    fn test_rounds_are_independent() {
        let mut session = session_with_inventory(json!({"S": 2}));
        let mut rng = StdRng::seed_from_u64(5);

        apply_missed_reflection(&mut session, 1, &mut rng);
        apply_missed_reflection(&mut session, 2, &mut rng);

        assert_eq!(session.state["inventory"]["S"], json!(0));
        assert!(session.is_penalized(1));
        assert!(session.is_penalized(2));
    }

    #[test]
    fn test_selection_covers_every_positive_code() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = std::collections::BTreeSet::new();

        for round in 0..200 {
            let mut session = session_with_inventory(json!({"A": 1, "W": 1, "S": 0, "C": 1}));
            if let PenaltyOutcome::Applied {
                item_code: Some(code),
                ..
            } = apply_missed_reflection(&mut session, round, &mut rng)
            {
                seen.insert(code);
            }
        }

        assert_eq!(
            seen.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "C".to_string(), "W".to_string()]
        );
    }
}
