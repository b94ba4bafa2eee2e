//! Routing invariants over generated destinations and tables

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smsc::registry::OperatorRegistry;
use smsc::routing::Router;
use smsc_core::{OperatorId, OperatorRecord, OperatorStatus, RoutingRule, TransportBinding};
use std::collections::HashSet;
use std::sync::Arc;

fn registry(ids: &[&str]) -> Arc<OperatorRegistry> {
    Arc::new(
        OperatorRegistry::with_operators(
            10,
            ids.iter().map(|id| OperatorRecord {
                id: OperatorId::new(*id),
                name: id.to_string(),
                priority: 1,
                weight: 100,
                max_tps: 10,
                status: OperatorStatus::Active,
                transport: TransportBinding::None,
            }),
        )
        .unwrap(),
    )
}

fn rule(id: String, pattern: String, operator: &str, priority: u32) -> RoutingRule {
    RoutingRule {
        id,
        pattern,
        operator_id: OperatorId::new(operator),
        priority,
        weight: None,
    }
}

const OPERATORS: [&str; 4] = ["a", "b", "c", "d"];

prop_compose! {
    fn table()(entries in prop::collection::vec(("[0-9]{1,5}", 0usize..4, 1u32..5), 0..12))
        -> Vec<RoutingRule>
    {
        entries
            .into_iter()
            .enumerate()
            .map(|(n, (prefix, op, priority))| {
                rule(format!("r{n}"), format!("{prefix}*"), OPERATORS[op], priority)
            })
            .collect()
    }
}

proptest! {
    #[test]
    fn test_wildcard_always_resolves(
        rules in table(),
        destination in "\\+?[0-9]{0,15}",
        disabled in prop::collection::vec(any::<bool>(), 4),
        seed in any::<u64>(),
    ) {
        let registry = registry(&OPERATORS);
        let mut rules = rules;
        rules.push(rule("fallback".to_string(), "*".to_string(), "d", 9));
        let router = Router::with_rules(registry.clone(), rules, None).unwrap();
        for (id, off) in OPERATORS.iter().zip(disabled) {
            if off {
                registry.set_status(&OperatorId::new(*id), OperatorStatus::Disabled).unwrap();
            }
        }

        let candidates = router
            .resolve_with_rng(&destination, &mut StdRng::seed_from_u64(seed))
            .unwrap();
        prop_assert!(!candidates.is_empty());
        let unique: HashSet<_> = candidates.iter().collect();
        prop_assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_longest_prefix_ranks_first(
        short in "[0-9]{1,4}",
        extension in "[0-9]{1,4}",
        tail in "[0-9]{0,6}",
        short_priority in 1u32..5,
        long_priority in 1u32..5,
    ) {
        let router = Router::with_rules(
            registry(&["a", "b"]),
            vec![
                rule("short".to_string(), short.clone(), "a", short_priority),
                rule("long".to_string(), format!("{short}{extension}*"), "b", long_priority),
            ],
            None,
        )
        .unwrap();

        let destination = format!("{short}{extension}{tail}");
        let candidates = router.resolve(&destination).unwrap();
        prop_assert_eq!(candidates, vec![OperatorId::new("b"), OperatorId::new("a")]);
    }

    #[test]
    fn test_unmatched_destination_without_wildcard_fails(
        prefix in "[1-9][0-9]{0,3}",
        tail in "[0-9]{0,8}",
    ) {
        let router = Router::with_rules(
            registry(&["a"]),
            vec![rule("only".to_string(), format!("{prefix}*"), "a", 1)],
            None,
        )
        .unwrap();
        let destination = format!("0{tail}");
        prop_assert!(router.resolve(&destination).is_err());
    }
}
