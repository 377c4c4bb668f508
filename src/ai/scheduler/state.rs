//! Admission planning.
//!
//! A pure function over a view of the queue and the current occupancy, so the
//! concurrency and token invariants can be checked without a runtime.

/// Scheduler limits applied on every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_concurrent: usize,
    pub max_concurrent_interactive: usize,
    pub max_outstanding_tokens: u64,
    pub max_batch_size: usize,
    /// Provider accepts combined calls
    pub batching: bool,
}

/// What is already in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Occupancy {
    pub active: usize,
    pub active_interactive: usize,
    pub outstanding_tokens: u64,
}

impl Occupancy {
    fn fits(&self, tokens: u64, limits: &Limits) -> bool {
        self.outstanding_tokens
            .checked_add(tokens)
            .is_some_and(|total| total <= limits.max_outstanding_tokens)
    }
}

/// Queue entry as seen by the planner, in queue order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    pub interactive: bool,
    /// Model name when the item may join a combined call
    pub batch_key: Option<&'a str>,
    pub tokens: u64,
}

/// Result of one pass: groups of queue indices to start (one call each) and
/// indices skipped because the token budget could not take them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionPlan {
    pub groups: Vec<Vec<usize>>,
    pub deferred: Vec<usize>,
}

impl AdmissionPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.deferred.is_empty()
    }

    pub fn admitted(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Choose what to start. Interactive work goes first; background work only
/// takes global slots left over, and is held back while an interactive item
/// that could ever fit is waiting on the token budget.
pub fn plan_admissions(queue: &[Slot<'_>], occupancy: Occupancy, limits: &Limits) -> AdmissionPlan {
    let mut occ = occupancy;
    let mut plan = AdmissionPlan::default();
    let mut taken = vec![false; queue.len()];
    let mut interactive_starved = false;

    for (i, slot) in queue.iter().enumerate().filter(|(_, s)| s.interactive) {
        if occ.active >= limits.max_concurrent
            || occ.active_interactive >= limits.max_concurrent_interactive
        {
            break;
        }
        if !occ.fits(slot.tokens, limits) {
            plan.deferred.push(i);
            if slot.tokens <= limits.max_outstanding_tokens {
                interactive_starved = true;
            }
            continue;
        }
        taken[i] = true;
        occ.active += 1;
        occ.active_interactive += 1;
        occ.outstanding_tokens += slot.tokens;
        plan.groups.push(vec![i]);
    }

    if interactive_starved {
        return plan;
    }

    for i in 0..queue.len() {
        let slot = &queue[i];
        if slot.interactive || taken[i] {
            continue;
        }
        if occ.active >= limits.max_concurrent {
            break;
        }
        if !occ.fits(slot.tokens, limits) {
            plan.deferred.push(i);
            continue;
        }

        taken[i] = true;
        let mut group = vec![i];
        let mut cost = slot.tokens;

        if let (true, Some(key)) = (limits.batching, slot.batch_key) {
            for j in (i + 1)..queue.len() {
                if group.len() >= limits.max_batch_size {
                    break;
                }
                let peer = &queue[j];
                if taken[j] || peer.interactive || peer.batch_key != Some(key) {
                    continue;
                }
                let with_peer = cost.saturating_add(peer.tokens);
                if !occ.fits(with_peer, limits) {
                    continue;
                }
                taken[j] = true;
                cost = with_peer;
                group.push(j);
            }
        }

        occ.active += 1;
        occ.outstanding_tokens += cost;
        plan.groups.push(group);
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits() -> Limits {
        Limits {
            max_concurrent: 3,
            max_concurrent_interactive: 2,
            max_outstanding_tokens: 100_000,
            max_batch_size: 16,
            batching: true,
        }
    }

    fn bg(tokens: u64) -> Slot<'static> {
        Slot {
            interactive: false,
            batch_key: Some("m"),
            tokens,
        }
    }

    fn fg(tokens: u64) -> Slot<'static> {
        Slot {
            interactive: true,
            batch_key: None,
            tokens,
        }
    }

    #[test]
    fn test_interactive_first_then_background() {
        let queue = [bg(10), fg(10), fg(10), fg(10)];
        let plan = plan_admissions(&queue, Occupancy::default(), &limits());
        // Two interactive (cap), then one background group in the spare slot
        assert_eq!(plan.groups, vec![vec![1], vec![2], vec![0]]);
    }

    #[test]
    fn test_background_batches_same_model() {
        let mut queue: Vec<Slot> = (0..10).map(|_| bg(100)).collect();
        queue.push(Slot {
            interactive: false,
            batch_key: Some("other"),
            tokens: 100,
        });
        let plan = plan_admissions(&queue, Occupancy::default(), &limits());
        assert_eq!(plan.groups[0], (0..10).collect::<Vec<_>>());
        assert_eq!(plan.groups[1], vec![10]);
    }

    #[test]
    fn test_batch_size_cap() {
        let queue: Vec<Slot> = (0..20).map(|_| bg(1)).collect();
        let plan = plan_admissions(&queue, Occupancy::default(), &limits());
        assert_eq!(plan.groups[0].len(), 16);
        assert_eq!(plan.groups[1].len(), 4);
    }

    #[test]
    fn test_no_batching_when_disabled() {
        let queue: Vec<Slot> = (0..5).map(|_| bg(1)).collect();
        let plan = plan_admissions(
            &queue,
            Occupancy::default(),
            &Limits {
                batching: false,
                ..limits()
            },
        );
        assert_eq!(plan.groups, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_oversized_request_deferred() {
        let queue = [bg(150_000), bg(10)];
        let plan = plan_admissions(&queue, Occupancy::default(), &limits());
        assert_eq!(plan.deferred, vec![0]);
        assert_eq!(plan.groups, vec![vec![1]]);
    }

    #[test]
    fn test_starved_interactive_holds_back_background() {
        let occupancy = Occupancy {
            active: 1,
            active_interactive: 0,
            outstanding_tokens: 90_000,
        };
        let queue = [fg(20_000), bg(5_000)];
        let plan = plan_admissions(&queue, occupancy, &limits());
        assert_eq!(plan.deferred, vec![0]);
        assert!(plan.groups.is_empty());
    }

    fn arb_slot() -> impl Strategy<Value = (bool, bool, u64)> {
        (any::<bool>(), any::<bool>(), 0u64..60_000)
    }

    proptest! {
        #[test]
        fn prop_plan_respects_limits(
            raw in prop::collection::vec(arb_slot(), 0..40),
            active in 0usize..4,
            active_interactive in 0usize..3,
            outstanding in 0u64..120_000,
        ) {
            let limits = limits();
            let active_interactive = active_interactive.min(active);
            let queue: Vec<Slot> = raw
                .iter()
                .map(|(interactive, batchable, tokens)| Slot {
                    interactive: *interactive,
                    batch_key: (*batchable && !*interactive).then_some("m"),
                    tokens: *tokens,
                })
                .collect();
            let occupancy = Occupancy { active, active_interactive, outstanding_tokens: outstanding };
            let plan = plan_admissions(&queue, occupancy, &limits);

            let new_interactive = plan.groups.iter().filter(|g| queue[g[0]].interactive).count();
            let added_tokens: u64 = plan.groups.iter().flatten().map(|&i| queue[i].tokens).sum();

            prop_assert!(active + plan.groups.len() <= limits.max_concurrent.max(active));
            prop_assert!(
                active_interactive + new_interactive
                    <= limits.max_concurrent_interactive.max(active_interactive)
            );
            if !plan.groups.is_empty() {
                prop_assert!(outstanding + added_tokens <= limits.max_outstanding_tokens);
            }

            let mut seen = vec![false; queue.len()];
            for &i in plan.groups.iter().flatten().chain(plan.deferred.iter()) {
                prop_assert!(!seen[i], "index {} planned twice", i);
                seen[i] = true;
            }
            for group in &plan.groups {
                prop_assert!(group.len() <= limits.max_batch_size);
                if group.len() > 1 {
                    prop_assert!(group.iter().all(|&i| queue[i].batch_key == Some("m")));
                }
            }
        }
    }
}
