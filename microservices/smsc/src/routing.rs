//! Routing engine: destination number to a ranked list of operators
//!
//! Rules are compiled into an immutable [`RuleSet`] that is swapped as a
//! whole on every mutation. A resolution clones the current `Arc` and works
//! on that snapshot, so rule changes never affect a resolution in progress.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use smsc_core::{OperatorId, RoutingRule};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::RoutingError;
use crate::registry::OperatorRegistry;

/// Id given to the rule synthesised from `routing.default_route`
pub const DEFAULT_ROUTE_ID: &str = "default-route";

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RoutingRule,
    /// Digits the destination must start with; empty for the wildcard
    prefix: String,
}

impl CompiledRule {
    fn is_wildcard(&self) -> bool {
        self.prefix.is_empty()
    }
}

/// Split a pattern into its digit prefix. `"1555"` and `"1555*"` are the
/// same prefix rule; `"*"` is the wildcard.
pub fn parse_pattern(pattern: &str) -> Result<String, RoutingError> {
    let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
    if pattern.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RoutingError::InvalidPattern(pattern.to_string()));
    }
    Ok(prefix.to_string())
}

/// Immutable compiled rule table
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: Vec<RoutingRule>) -> Result<Self, RoutingError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if !seen.insert(rule.id.clone()) {
                return Err(RoutingError::DuplicateRule(rule.id));
            }
            let prefix = parse_pattern(&rule.pattern)?;
            compiled.push(CompiledRule { rule, prefix });
        }
        Ok(Self { rules: compiled })
    }

    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    pub fn has_wildcard(&self) -> bool {
        self.rules.iter().any(CompiledRule::is_wildcard)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

struct Candidate<'a> {
    rule: &'a CompiledRule,
    weight: u32,
}

impl Candidate<'_> {
    fn rank(&self) -> (bool, std::cmp::Reverse<usize>, u32, std::cmp::Reverse<u32>) {
        (
            self.rule.is_wildcard(),
            std::cmp::Reverse(self.rule.prefix.len()),
            self.rule.rule.priority,
            std::cmp::Reverse(self.weight),
        )
    }
}

/// Resolves destinations against the current rule snapshot and live
/// operator state
pub struct Router {
    rules: RwLock<Arc<RuleSet>>,
    registry: Arc<OperatorRegistry>,
}

impl Router {
    pub fn new(registry: Arc<OperatorRegistry>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::default())),
            registry,
        }
    }

    /// Build with an initial table. A `default_route` adds a lowest-priority
    /// wildcard unless the table already has one.
    pub fn with_rules(
        registry: Arc<OperatorRegistry>,
        mut rules: Vec<RoutingRule>,
        default_route: Option<&OperatorId>,
    ) -> Result<Self, RoutingError> {
        if let Some(operator) = default_route {
            let has_wildcard = rules.iter().any(|r| r.pattern == "*");
            if !has_wildcard {
                rules.push(RoutingRule {
                    id: DEFAULT_ROUTE_ID.to_string(),
                    pattern: "*".to_string(),
                    operator_id: operator.clone(),
                    priority: u32::MAX,
                    weight: None,
                });
            }
        }
        let router = Self::new(registry);
        router.replace(rules)?;
        Ok(router)
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    pub fn resolve(&self, destination: &str) -> Result<Vec<OperatorId>, RoutingError> {
        self.resolve_with_rng(destination, &mut rand::thread_rng())
    }

    /// Ranked candidates for `destination`.
    ///
    /// Longest prefix first, then rule priority ascending, then weight
    /// descending; equal ranks are shuffled. Disabled or saturated operators
    /// are skipped. Wildcard operators always come last, and are returned even
    /// when nothing is eligible.
    pub fn resolve_with_rng<R: Rng + ?Sized>(
        &self,
        destination: &str,
        rng: &mut R,
    ) -> Result<Vec<OperatorId>, RoutingError> {
        let rules = self.snapshot();
        let number = destination.trim_start_matches('+');

        let mut candidates: Vec<Candidate<'_>> = rules
            .rules
            .iter()
            .filter(|c| number.starts_with(c.prefix.as_str()))
            .map(|rule| Candidate {
                rule,
                weight: rule.rule.weight.unwrap_or_else(|| {
                    self.registry
                        .get(&rule.rule.operator_id)
                        .map(|e| e.record().weight)
                        .unwrap_or(0)
                }),
            })
            .collect();
        candidates.sort_by_key(Candidate::rank);

        let mut start = 0;
        while start < candidates.len() {
            let rank = candidates[start].rank();
            let end = start
                + candidates[start..]
                    .iter()
                    .take_while(|c| c.rank() == rank)
                    .count();
            candidates[start..end].shuffle(rng);
            start = end;
        }

        let mut seen = HashSet::new();
        let mut ranked = Vec::new();
        let mut fallback: Vec<OperatorId> = Vec::new();
        for candidate in &candidates {
            let id = &candidate.rule.rule.operator_id;
            if candidate.rule.is_wildcard() && !fallback.contains(id) {
                fallback.push(id.clone());
            }
            if seen.insert(id.clone()) && self.registry.is_eligible(id) {
                ranked.push(id.clone());
            }
        }

        if ranked.is_empty() {
            if fallback.is_empty() {
                debug!(destination, "No eligible operator");
                return Err(RoutingError::NoMatch(destination.to_string()));
            }
            debug!(destination, "Every candidate saturated, using default route");
            return Ok(fallback);
        }
        Ok(ranked)
    }

    fn swap(&self, rules: Vec<RoutingRule>) -> Result<(), RoutingError> {
        let compiled = RuleSet::compile(rules)?;
        *self.rules.write() = Arc::new(compiled);
        Ok(())
    }

    fn check_operator(&self, rule: &RoutingRule) -> Result<(), RoutingError> {
        if !self.registry.contains(&rule.operator_id) {
            return Err(RoutingError::UnknownOperator(rule.operator_id.clone()));
        }
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<RoutingRule> {
        self.snapshot().rules()
    }

    /// Replace the whole table
    pub fn replace(&self, rules: Vec<RoutingRule>) -> Result<(), RoutingError> {
        for rule in &rules {
            self.check_operator(rule)?;
        }
        let count = rules.len();
        self.swap(rules)?;
        info!(rules = count, "Routing table loaded");
        Ok(())
    }

    pub fn add_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        self.check_operator(&rule)?;
        let mut rules = self.list_rules();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(RoutingError::DuplicateRule(rule.id));
        }
        info!(rule = %rule.id, pattern = %rule.pattern, operator = %rule.operator_id, "Rule added");
        rules.push(rule);
        self.swap(rules)
    }

    pub fn update_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        self.check_operator(&rule)?;
        let mut rules = self.list_rules();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| RoutingError::UnknownRule(rule.id.clone()))?;
        info!(rule = %rule.id, pattern = %rule.pattern, "Rule updated");
        *slot = rule;
        self.swap(rules)
    }

    pub fn remove_rule(&self, id: &str) -> Result<RoutingRule, RoutingError> {
        let mut rules = self.list_rules();
        let position = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RoutingError::UnknownRule(id.to_string()))?;
        let removed = rules.remove(position);
        self.swap(rules)?;
        info!(rule = %id, "Rule removed");
        Ok(removed)
    }

    /// Rules that point at `operator`
    pub fn rules_for(&self, operator: &OperatorId) -> Vec<RoutingRule> {
        self.list_rules()
            .into_iter()
            .filter(|r| &r.operator_id == operator)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use smsc_core::{OperatorRecord, OperatorStatus, TransportBinding};

    fn operator(id: &str, weight: u32) -> OperatorRecord {
        OperatorRecord {
            id: OperatorId::new(id),
            name: id.to_string(),
            priority: 1,
            weight,
            max_tps: 10,
            status: OperatorStatus::Active,
            transport: TransportBinding::None,
        }
    }

    fn rule(id: &str, pattern: &str, operator: &str, priority: u32) -> RoutingRule {
        RoutingRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            operator_id: OperatorId::new(operator),
            priority,
            weight: None,
        }
    }

    fn router(ops: &[(&str, u32)], rules: Vec<RoutingRule>) -> Router {
        let registry = Arc::new(
            OperatorRegistry::with_operators(0, ops.iter().map(|(id, w)| operator(id, *w)))
                .unwrap(),
        );
        Router::with_rules(registry, rules, None).unwrap()
    }

    fn ids(list: Vec<OperatorId>) -> Vec<String> {
        list.into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(parse_pattern("1555*").unwrap(), "1555");
        assert_eq!(parse_pattern("1555").unwrap(), "1555");
        assert_eq!(parse_pattern("*").unwrap(), "");
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("15*5").is_err());
        assert!(parse_pattern("+1").is_err());
    }

    #[test]
    fn test_prefix_then_wildcard() {
        let router = router(
            &[("a", 100), ("b", 100)],
            vec![rule("r1", "1555*", "a", 1), rule("r2", "*", "b", 1)],
        );
        assert_eq!(ids(router.resolve("15551234").unwrap()), vec!["a", "b"]);
        assert_eq!(ids(router.resolve("4420").unwrap()), vec!["b"]);
    }

    #[test]
    fn test_longest_prefix_beats_priority() {
        let router = router(
            &[("a", 100), ("b", 100)],
            vec![rule("r1", "1*", "a", 1), rule("r2", "1555*", "b", 9)],
        );
        assert_eq!(ids(router.resolve("15551234").unwrap()), vec!["b", "a"]);
    }

    #[test]
    fn test_priority_then_weight() {
        let router = router(
            &[("a", 10), ("b", 50), ("c", 90)],
            vec![
                rule("r1", "44*", "a", 1),
                rule("r2", "44*", "b", 2),
                rule("r3", "44*", "c", 2),
            ],
        );
        assert_eq!(ids(router.resolve("4412").unwrap()), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_no_match_without_wildcard() {
        let router = router(&[("a", 1)], vec![rule("r1", "1*", "a", 1)]);
        assert_eq!(
            router.resolve("44"),
            Err(RoutingError::NoMatch("44".to_string()))
        );
    }

    #[test]
    fn test_skips_ineligible_and_fails_open() {
        let router = router(
            &[("a", 100), ("b", 100)],
            vec![rule("r1", "1*", "a", 1), rule("r2", "*", "b", 1)],
        );
        let a = router.registry.get(&OperatorId::new("a")).unwrap();
        for _ in 0..10 {
            a.enqueued();
        }
        assert_eq!(ids(router.resolve("1555").unwrap()), vec!["b"]);

        router
            .registry
            .set_status(&OperatorId::new("b"), OperatorStatus::Disabled)
            .unwrap();
        assert_eq!(ids(router.resolve("1555").unwrap()), vec!["b"]);
    }

    #[test]
    fn test_operator_listed_once() {
        let router = router(
            &[("a", 100), ("b", 100)],
            vec![
                rule("r1", "15*", "a", 1),
                rule("r2", "1*", "b", 1),
                rule("r3", "*", "a", 1),
            ],
        );
        assert_eq!(ids(router.resolve("1555").unwrap()), vec!["a", "b"]);
    }

    #[test]
    fn test_ties_are_shuffled() {
        let router = router(
            &[("a", 100), ("b", 100)],
            vec![rule("r1", "1*", "a", 1), rule("r2", "1*", "b", 1)],
        );
        let mut rng = StdRng::seed_from_u64(7);
        let mut firsts = HashSet::new();
        for _ in 0..64 {
            let list = router.resolve_with_rng("1", &mut rng).unwrap();
            assert_eq!(list.len(), 2);
            firsts.insert(list[0].clone());
        }
        assert_eq!(firsts.len(), 2);
    }

    #[test]
    fn test_mutations() {
        let router = router(&[("a", 100), ("b", 100)], vec![rule("r1", "1*", "a", 1)]);
        assert_eq!(
            router.add_rule(rule("r1", "2*", "b", 1)),
            Err(RoutingError::DuplicateRule("r1".to_string()))
        );
        assert_eq!(
            router.add_rule(rule("r2", "2*", "zz", 1)),
            Err(RoutingError::UnknownOperator(OperatorId::new("zz")))
        );
        assert!(matches!(
            router.add_rule(rule("r2", "2x", "b", 1)),
            Err(RoutingError::InvalidPattern(_))
        ));

        router.add_rule(rule("r2", "2*", "b", 1)).unwrap();
        assert_eq!(ids(router.resolve("2").unwrap()), vec!["b"]);

        router.update_rule(rule("r2", "2*", "a", 1)).unwrap();
        assert_eq!(ids(router.resolve("2").unwrap()), vec!["a"]);

        router.remove_rule("r2").unwrap();
        assert!(router.resolve("2").is_err());
        assert_eq!(
            router.remove_rule("r2"),
            Err(RoutingError::UnknownRule("r2".to_string()))
        );
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let router = router(&[("a", 100)], vec![rule("r1", "1*", "a", 1)]);
        let before = router.snapshot();
        router.remove_rule("r1").unwrap();
        assert_eq!(before.len(), 1);
        assert!(router.snapshot().is_empty());
    }

    #[test]
    fn test_default_route() {
        let registry = Arc::new(
            OperatorRegistry::with_operators(0, vec![operator("a", 1), operator("d", 1)]).unwrap(),
        );
        let router = Router::with_rules(
            registry,
            vec![rule("r1", "1*", "a", 1)],
            Some(&OperatorId::new("d")),
        )
        .unwrap();
        assert_eq!(ids(router.resolve("1").unwrap()), vec!["a", "d"]);
        assert_eq!(ids(router.resolve("9").unwrap()), vec!["d"]);
        assert!(router.snapshot().has_wildcard());
    }
}
