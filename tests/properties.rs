//! Property-based tests for quorum addressing and condition bookkeeping.

use automq_operator::conditions::{Condition, ConditionStatus, Conditions};
use automq_operator::quorum::controller_voters;
use proptest::prelude::*;

/// Namespaces as accepted by the API server.
fn namespace() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

fn status() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

proptest! {
    #[test]
    fn voters_are_complete_and_ordered(replicas in 1..64i32, ns in namespace()) {
        let voters = controller_voters(replicas, &ns);
        prop_assert_eq!(voters.len(), replicas as usize);

        for (index, voter) in voters.iter().enumerate() {
            let expected = format!("{}@automq-controller-{}.{}.svc:9093", index, index, &ns);
            prop_assert_eq!(voter, &expected);
        }

        let ids: Vec<i32> = voters
            .iter()
            .map(|v| v.split('@').next().unwrap().parse().unwrap())
            .collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn voters_are_deterministic(replicas in 0..32i32, ns in namespace()) {
        prop_assert_eq!(controller_voters(replicas, &ns), controller_voters(replicas, &ns));
    }

    #[test]
    fn one_condition_per_type(updates in prop::collection::vec((0..4usize, status()), 1..40)) {
        let types = ["A", "B", "C", "D"];
        let mut conditions = Conditions::new();
        for (i, (t, s)) in updates.iter().enumerate() {
            let now = format!("2024-01-01T00:00:{:02}Z", i);
            conditions.set_at(Condition::new(types[*t], *s, "Reason", ""), &now);
        }

        let mut seen: Vec<&str> = conditions.iter().map(|c| c.r#type.as_str()).collect();
        let len = seen.len();
        seen.sort();
        seen.dedup();
        prop_assert_eq!(seen.len(), len);

        // Last write wins for the status of every type
        for t in 0..types.len() {
            if let Some((_, s)) = updates.iter().rev().find(|(ut, _)| *ut == t) {
                prop_assert_eq!(conditions.get(types[t]).unwrap().status, *s);
            }
        }
    }
}
