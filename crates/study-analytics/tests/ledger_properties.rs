//! Property-Based Tests for the additive aggregate ledger
//!
//! Tests the following invariants:
//! - Idempotence: re-sending a (user, day, client, sequence) changes nothing
//! - Commutativity: deltas from independent clients merge in any order
//! - Totals: time spent equals the sum of applied deltas

use proptest::prelude::*;

use study_analytics::{
    ActivityCounts, ActivityKind, AggregateLedger, ApplyDeltaRequest, DailyAggregate,
};

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_kind() -> impl Strategy<Value = ActivityKind> {
    prop_oneof![
        Just(ActivityKind::PageView),
        Just(ActivityKind::AiInteraction),
        Just(ActivityKind::QuestionAttempt),
        Just(ActivityKind::QuestionCorrect),
        Just(ActivityKind::LessonCompleted),
        Just(ActivityKind::MockExamTaken),
    ]
}

fn arb_counts() -> impl Strategy<Value = ActivityCounts> {
    prop::collection::vec((arb_kind(), 0u32..20), 0..6)
        .prop_map(|pairs| pairs.into_iter().collect())
}

fn arb_delta(client: &'static str, sequence: u64) -> impl Strategy<Value = ApplyDeltaRequest> {
    (0u64..3600, arb_counts(), 0u32..3).prop_map(move |(seconds, counts, sessions)| {
        ApplyDeltaRequest {
            user_id: "user-1".to_string(),
            client_id: client.to_string(),
            date: "2026-03-14".to_string(),
            sequence,
            delta_seconds: seconds,
            delta_counts: counts,
            delta_sessions: sessions,
        }
    })
}

fn final_aggregate(ledger: &AggregateLedger) -> DailyAggregate {
    ledger
        .get("user-1", "2026-03-14")
        .cloned()
        .expect("row should exist")
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_replay_is_idempotent(delta in arb_delta("tab-a", 1)) {
        let mut once = AggregateLedger::new();
        once.apply(&delta).unwrap();

        let mut twice = AggregateLedger::new();
        twice.apply(&delta).unwrap();
        let replay = twice.apply(&delta).unwrap();

        prop_assert!(!replay.applied);
        prop_assert_eq!(final_aggregate(&once), final_aggregate(&twice));
    }

    #[test]
    fn prop_cross_client_merge_commutes(
        a in arb_delta("tab-a", 1),
        b in arb_delta("tab-b", 1),
    ) {
        let mut ab = AggregateLedger::new();
        ab.apply(&a).unwrap();
        ab.apply(&b).unwrap();

        let mut ba = AggregateLedger::new();
        ba.apply(&b).unwrap();
        ba.apply(&a).unwrap();

        prop_assert_eq!(final_aggregate(&ab), final_aggregate(&ba));
    }

    #[test]
    fn prop_time_spent_is_sum_of_applied(seconds in prop::collection::vec(0u64..3600, 1..20)) {
        let mut ledger = AggregateLedger::new();
        for (i, secs) in seconds.iter().enumerate() {
            let req = ApplyDeltaRequest {
                user_id: "user-1".to_string(),
                client_id: "tab-a".to_string(),
                date: "2026-03-14".to_string(),
                sequence: i as u64 + 1,
                delta_seconds: *secs,
                delta_counts: ActivityCounts::new(),
                delta_sessions: 0,
            };
            prop_assert!(ledger.apply(&req).unwrap().applied);
        }

        let expected: u64 = seconds.iter().sum();
        prop_assert_eq!(final_aggregate(&ledger).total_time_spent, expected as i64);
    }

    #[test]
    fn prop_score_stays_in_range(a in arb_delta("tab-a", 1), b in arb_delta("tab-a", 2)) {
        let mut ledger = AggregateLedger::new();
        ledger.apply(&a).unwrap();
        ledger.apply(&b).unwrap();
        let agg = final_aggregate(&ledger);
        prop_assert!(agg.productivity_score >= 0.0);
        prop_assert!(agg.productivity_score <= 100.0);
    }
}
