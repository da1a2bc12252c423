//! Property tests for the fan-out and pruning invariants.

use changefeed::{ChangeInput, ChangeSearch, Logic, MemoryMeta, Meta, SqlMeta};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Register(u8),
    Unregister(u8),
    Upsert(u8, u8),
    AckAll(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Register),
        (0u8..4).prop_map(Op::Unregister),
        (0u8..3, 0u8..4).prop_map(|(d, v)| Op::Upsert(d, v)),
        (0u8..4).prop_map(Op::AckAll),
    ]
}

fn registration(n: u8) -> String {
    format!("r{}", n)
}

/// Apply ops, checking that a registration only ever sees changes created
/// after it (most recently) registered and that stored changes are exactly
/// those still pending somewhere or never fanned out.
fn check_ops(meta: Arc<dyn Meta>, ops: &[Op]) -> Result<(), TestCaseError> {
    let logic = Logic::new(meta);
    // Change ids each registration is allowed to see
    let mut visible: Vec<Option<HashSet<String>>> = vec![None; 4];

    for op in ops {
        match op {
            Op::Register(r) => {
                logic.registration_upsert(&registration(*r)).unwrap();
                visible[*r as usize].get_or_insert_with(HashSet::new);
            }
            Op::Unregister(r) => {
                let result = logic.registration_delete(&registration(*r));
                prop_assert_eq!(result.is_ok(), visible[*r as usize].is_some());
                visible[*r as usize] = None;
            }
            Op::Upsert(d, v) => {
                let input = ChangeInput::new(format!("d{}", d)).with_version(*v as i64);
                if let Ok(change) = logic.change_upsert(input) {
                    for seen in visible.iter_mut().flatten() {
                        seen.insert(change.id.clone());
                    }
                }
            }
            Op::AckAll(r) => {
                let name = registration(*r);
                match logic.registration_changes_read(&name) {
                    Ok(pending) => {
                        let ids: Vec<String> = pending.into_iter().map(|c| c.id).collect();
                        logic.registration_change_acknowledge(&name, &ids).unwrap();
                        // Idempotent
                        logic.registration_change_acknowledge(&name, &ids).unwrap();
                    }
                    Err(e) => {
                        prop_assert!(e.is_not_found());
                    }
                }
            }
        }

        for (r, allowed) in visible.iter().enumerate() {
            if let Some(allowed) = allowed {
                let pending = logic.meta().registration_changes_read(&registration(r as u8)).unwrap();
                for id in pending {
                    prop_assert!(allowed.contains(&id));
                }
            }
        }
    }

    // Every pending id still resolves to a stored change
    for r in 0..4u8 {
        if let Ok(pending) = logic.meta().registration_changes_read(&registration(r)) {
            for id in pending {
                prop_assert!(logic.change_read(&id).is_ok());
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_memory_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        check_ops(Arc::new(MemoryMeta::new()), &ops)?;
    }

    #[test]
    fn prop_sql_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        check_ops(Arc::new(SqlMeta::in_memory().unwrap()), &ops)?;
    }

    #[test]
    fn prop_conflict_dedup(data_id in "[a-z]{1,8}", action in "[a-z]{1,6}", version in 0i64..1000) {
        let meta = MemoryMeta::new();
        let input = ChangeInput::new(data_id).with_action(action).with_version(version);

        meta.change_create(input.clone()).unwrap();
        let err = meta.change_create(input).unwrap_err();
        prop_assert!(err.is_conflict());
        prop_assert_eq!(meta.changes_read(&ChangeSearch::default()).unwrap().len(), 1);
    }

    #[test]
    fn prop_second_acknowledge_prunes_nothing(registrations in 1usize..5) {
        let meta = MemoryMeta::new();
        for r in 0..registrations {
            meta.registration_upsert(&format!("r{}", r)).unwrap();
        }
        let change = meta.change_create(ChangeInput::new("d1")).unwrap();
        meta.registration_change_upsert(&change.id).unwrap();
        let ids = vec![change.id.clone()];

        for r in 0..registrations {
            let name = format!("r{}", r);
            let first = meta.registration_change_acknowledge(&name, &ids).unwrap();
            let second = meta.registration_change_acknowledge(&name, &ids).unwrap();

            prop_assert!(second.is_empty());
            if r + 1 == registrations {
                prop_assert_eq!(first, ids.clone());
            } else {
                prop_assert!(first.is_empty());
            }
        }
    }
}
