//! Choosing which eligible items to start this pass. Pure: no I/O.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{Status, WorkItem};

pub struct PlanInput<'a> {
    /// Eligible items in board order.
    pub eligible: &'a [WorkItem],
    /// Items that already have a local record of any status.
    pub tracked: &'a BTreeSet<u64>,
    pub limits: &'a BTreeMap<String, usize>,
    /// Active assignments per worker class.
    pub active: &'a BTreeMap<String, usize>,
    /// Classes that cannot start workers right now.
    pub unavailable: &'a BTreeSet<String>,
    pub default_provider: &'a str,
    /// An exclusive assignment is active: nothing else may start.
    pub exclusive_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planned {
    pub item_id: u64,
    pub provider: String,
}

/// Worker class an item will run on, if it is one we know.
pub fn provider_for<'a>(
    item: &'a WorkItem,
    default_provider: &'a str,
    limits: &BTreeMap<String, usize>,
) -> Option<&'a str> {
    let provider = item.provider.as_deref().unwrap_or(default_provider);
    limits.contains_key(provider).then_some(provider)
}

/// Fill free capacity per class in board order.
///
/// The first startable exclusive item jumps the queue and is the only
/// assignment of the pass. If its class has no room, nothing starts, so
/// other items cannot keep it waiting.
pub fn plan_assignments(input: &PlanInput<'_>) -> Vec<Planned> {
    if input.exclusive_active {
        return Vec::new();
    }

    let mut free: BTreeMap<&str, usize> = input
        .limits
        .iter()
        .map(|(p, limit)| {
            let used = input.active.get(p).copied().unwrap_or(0);
            (p.as_str(), limit.saturating_sub(used))
        })
        .collect();

    let candidates: Vec<(&WorkItem, &str)> = input
        .eligible
        .iter()
        .filter(|i| i.status == Status::Ready)
        .filter(|i| i.claimed_by.is_none())
        .filter(|i| !input.tracked.contains(&i.id))
        .filter_map(|i| {
            let provider = provider_for(i, input.default_provider, input.limits)?;
            (!input.unavailable.contains(provider)).then_some((i, provider))
        })
        .collect();

    if let Some((item, provider)) = candidates.iter().find(|(i, _)| i.exclusive) {
        return if free.get(provider).copied().unwrap_or(0) > 0 {
            vec![Planned {
                item_id: item.id,
                provider: (*provider).to_string(),
            }]
        } else {
            Vec::new()
        };
    }

    let mut planned = Vec::new();
    for (item, provider) in candidates {
        if let Some(slots) = free.get_mut(provider) {
            if *slots > 0 {
                *slots -= 1;
                planned.push(Planned {
                    item_id: item.id,
                    provider: provider.to_string(),
                });
            }
        }
    }
    planned
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        eligible: Vec<WorkItem>,
        tracked: BTreeSet<u64>,
        limits: BTreeMap<String, usize>,
        active: BTreeMap<String, usize>,
        unavailable: BTreeSet<String>,
        exclusive_active: bool,
    }

    impl Fixture {
        fn new(limit: usize) -> Self {
            Self {
                eligible: Vec::new(),
                tracked: BTreeSet::new(),
                limits: BTreeMap::from([("claude".to_string(), limit)]),
                active: BTreeMap::new(),
                unavailable: BTreeSet::new(),
                exclusive_active: false,
            }
        }

        fn item(mut self, id: u64) -> Self {
            self.eligible.push(WorkItem::new(id, "t", Status::Ready));
            self
        }

        fn exclusive(mut self, id: u64) -> Self {
            let mut item = WorkItem::new(id, "t", Status::Ready);
            item.exclusive = true;
            self.eligible.push(item);
            self
        }

        fn plan(&self) -> Vec<u64> {
            plan_assignments(&PlanInput {
                eligible: &self.eligible,
                tracked: &self.tracked,
                limits: &self.limits,
                active: &self.active,
                unavailable: &self.unavailable,
                default_provider: "claude",
                exclusive_active: self.exclusive_active,
            })
            .into_iter()
            .map(|p| p.item_id)
            .collect()
        }
    }

    #[test]
    fn fills_free_capacity_in_board_order() {
        let mut f = Fixture::new(3).item(5).item(2).item(9).item(1);
        f.active.insert("claude".into(), 1);
        assert_eq!(f.plan(), vec![5, 2]);
    }

    #[test]
    fn no_capacity_no_assignments() {
        let mut f = Fixture::new(2).item(1);
        f.active.insert("claude".into(), 2);
        assert!(f.plan().is_empty());
    }

    #[test]
    fn skips_claimed_tracked_and_non_ready_items() {
        let mut f = Fixture::new(5).item(1).item(2).item(3);
        f.eligible[0].claimed_by = Some("someone".into());
        f.tracked.insert(2);
        f.eligible.push(WorkItem::new(4, "t", Status::InProgress));
        assert_eq!(f.plan(), vec![3]);
    }

    #[test]
    fn per_class_limits() {
        let mut f = Fixture::new(1).item(1).item(2).item(3);
        f.limits.insert("codex".into(), 1);
        f.eligible[1].provider = Some("codex".into());
        f.eligible[2].provider = Some("codex".into());
        assert_eq!(f.plan(), vec![1, 2]);
    }

    #[test]
    fn unknown_and_unavailable_classes_are_skipped() {
        let mut f = Fixture::new(5).item(1).item(2);
        f.eligible[0].provider = Some("gemini".into());
        assert_eq!(f.plan(), vec![2]);
        f.unavailable.insert("claude".into());
        assert!(f.plan().is_empty());
    }

    #[test]
    fn exclusive_item_jumps_queue_and_runs_alone() {
        let f = Fixture::new(3).item(1).item(2).exclusive(3).exclusive(4);
        assert_eq!(f.plan(), vec![3]);
    }

    #[test]
    fn exclusive_item_without_room_blocks_everything() {
        let mut f = Fixture::new(2).item(1).exclusive(2);
        f.active.insert("claude".into(), 2);
        assert!(f.plan().is_empty());
    }

    #[test]
    fn active_exclusive_suspends_assignment() {
        let mut f = Fixture::new(3).item(1).exclusive(2);
        f.exclusive_active = true;
        assert!(f.plan().is_empty());
    }
}
