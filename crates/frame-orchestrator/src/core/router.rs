//! Routing decisions (spec §4.5): pick the least-loaded capable, healthy
//! processor and reserve a slot on it, retrying against the next-best
//! candidate when a reservation race loses.

use std::collections::HashSet;
use std::sync::Arc;

use frame_proto::RoutingReason;

use super::registry::{ProcessorSnapshot, Registry};

pub struct Router {
    registry: Arc<Registry>,
    max_attempts: u32,
}

pub struct RouteOutcome {
    pub chosen: Option<ProcessorSnapshot>,
    pub reason: RoutingReason,
    pub attempts: u32,
}

impl Router {
    pub fn new(registry: Arc<Registry>, max_attempts: u32) -> Self {
        Self { registry, max_attempts: max_attempts.max(1) }
    }

    /// Picks a processor for `required_capabilities`, reserving a slot on it
    /// before returning. The reservation is the caller's to release.
    pub fn route(&self, required_capabilities: &HashSet<String>) -> RouteOutcome {
        let mut candidates = self.registry.select_candidates(required_capabilities);

        if candidates.is_empty() {
            let reason = if !self.registry.any_capable(required_capabilities) {
                RoutingReason::NoCapabilityMatch
            } else if !self.registry.any_healthy_capable(required_capabilities) {
                RoutingReason::AllUnhealthy
            } else {
                // Healthy capable processors exist but `select_candidates`
                // already excluded them for being at declared capacity.
                RoutingReason::AllBusy
            };
            return RouteOutcome { chosen: None, reason, attempts: 0 };
        }

        let mut attempts = 0;
        while attempts < self.max_attempts && !candidates.is_empty() {
            attempts += 1;
            let best_idx = best_candidate_index(&candidates);
            let best = candidates.remove(best_idx);

            if self.registry.try_reserve(&best.processor_id, best.declared_capacity) {
                return RouteOutcome { chosen: Some(best), reason: RoutingReason::Routed, attempts };
            }
            // Lost the race (another dispatch filled it, or it hit capacity
            // since the snapshot); move on to the next-best candidate.
        }

        RouteOutcome { chosen: None, reason: RoutingReason::AllBusy, attempts }
    }
}

/// Lowest load ratio wins; ties break by earliest registration, then by
/// processor id for full determinism (spec §4.5).
fn best_candidate_index(candidates: &[ProcessorSnapshot]) -> usize {
    let mut best = 0;
    for (idx, candidate) in candidates.iter().enumerate().skip(1) {
        let current = &candidates[best];
        let better = match candidate.load_ratio().partial_cmp(&current.load_ratio()) {
            Some(std::cmp::Ordering::Less) => true,
            Some(std::cmp::Ordering::Equal) => {
                (candidate.registered_at, &candidate.processor_id)
                    < (current.registered_at, &current.processor_id)
            }
            _ => false,
        };
        if better {
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::DispatchOutcome;

    fn caps(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn routes_to_least_loaded_candidate() {
        let registry = Arc::new(Registry::new());
        registry.register("busy", caps(&["detect"]), 4, "t".into());
        registry.register("idle", caps(&["detect"]), 4, "t".into());
        assert!(registry.try_reserve("busy", 4));
        assert!(registry.try_reserve("busy", 4));

        let router = Router::new(registry.clone(), 4);
        let outcome = router.route(&caps(&["detect"]));

        assert_eq!(outcome.reason, RoutingReason::Routed);
        assert_eq!(outcome.chosen.unwrap().processor_id, "idle");
    }

    #[test]
    fn no_capability_match_when_nobody_declares_it() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", caps(&["detect"]), 4, "t".into());
        let router = Router::new(registry, 4);

        let outcome = router.route(&caps(&["classify"]));
        assert_eq!(outcome.reason, RoutingReason::NoCapabilityMatch);
        assert!(outcome.chosen.is_none());
    }

    #[test]
    fn all_busy_when_every_capable_processor_is_full() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", caps(&["detect"]), 1, "t".into());
        assert!(registry.try_reserve("p1", 1));

        let router = Router::new(registry, 4);
        let outcome = router.route(&caps(&["detect"]));
        assert_eq!(outcome.reason, RoutingReason::AllBusy);
    }

    #[test]
    fn tie_break_prefers_earlier_registration_then_processor_id() {
        let registry = Arc::new(Registry::new());
        registry.register("zeta", caps(&["detect"]), 4, "t".into());
        registry.register("alpha", caps(&["detect"]), 4, "t".into());

        let router = Router::new(registry.clone(), 4);
        let outcome = router.route(&caps(&["detect"]));
        assert_eq!(outcome.chosen.unwrap().processor_id, "zeta");
        registry.release("zeta", DispatchOutcome::Success);
    }
}
