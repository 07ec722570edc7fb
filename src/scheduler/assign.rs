use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, info_span, warn};

use super::plan::{PlanInput, plan_assignments};
use super::{Scheduler, TickReport};
use crate::model::{Assignment, Status, WorkItem};
use crate::triage::Classification;

/// Triage items classified per pass. Each one is an agent run.
const TRIAGE_BATCH: usize = 5;

impl Scheduler {
    /// Start workers for Ready items while capacity allows.
    pub(super) fn assign(&mut self, report: &mut TickReport) {
        let _span = info_span!("assign").entered();

        let eligible = match self.parts.source.fetch_eligible(&[Status::Ready]) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not list ready items, no new work this pass");
                report.errors += 1;
                return;
            }
        };

        let exclusive_active = self.ledger.active().iter().any(|a| a.exclusive);
        if exclusive_active {
            debug!("exclusive assignment active, not assigning");
        }
        let tracked: BTreeSet<u64> = self.ledger.all().map(|a| a.item_id).collect();
        let active: BTreeMap<String, usize> = self
            .settings
            .limits
            .keys()
            .map(|p| (p.clone(), self.ledger.count_active(p)))
            .collect();
        let unavailable: BTreeSet<String> = self
            .settings
            .limits
            .keys()
            .filter(|p| !self.parts.supervisor.is_available(p))
            .cloned()
            .collect();

        let planned = plan_assignments(&PlanInput {
            eligible: &eligible,
            tracked: &tracked,
            limits: &self.settings.limits,
            active: &active,
            unavailable: &unavailable,
            default_provider: &self.settings.default_provider,
            exclusive_active,
        });

        for plan in planned {
            let Some(item) = eligible.iter().find(|i| i.id == plan.item_id) else {
                continue;
            };
            match self.start_assignment(item, &plan.provider) {
                Ok(()) => report.assigned.push(item.id),
                Err(e) => {
                    warn!(item = item.id, provider = %plan.provider, error = format!("{e:#}"), "assignment failed, will retry");
                    report.errors += 1;
                }
            }
        }
    }

    /// Record the assignment, then start its worker. A failed start rolls
    /// the record back so the item is eligible again next pass.
    fn start_assignment(&mut self, item: &WorkItem, provider: &str) -> anyhow::Result<()> {
        self.ledger.insert(Assignment::new(item, provider))?;
        if let Err(e) = self.launch(item.id, Some(item)) {
            if let Err(rollback) = self.ledger.remove(item.id) {
                warn!(item = item.id, error = %rollback, "failed to roll back assignment");
            }
            return Err(e);
        }
        info!(
            item = item.id,
            provider,
            exclusive = item.exclusive,
            title = %item.title,
            "assigned"
        );
        Ok(())
    }

    /// Move triage items to Ready or Needs Info.
    pub(super) fn triage(&mut self, report: &mut TickReport) {
        if !self.settings.triage {
            return;
        }
        let Some(classifier) = self.parts.classifier.as_mut() else {
            return;
        };
        let _span = info_span!("triage").entered();

        let items = match self.parts.source.fetch_eligible(&[Status::NeedsTriage]) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not list triage items");
                report.errors += 1;
                return;
            }
        };

        for item in items.iter().take(TRIAGE_BATCH) {
            let classification = match classifier.classify(item) {
                Ok(c) => c,
                Err(e) => {
                    warn!(item = item.id, error = format!("{e:#}"), "classification failed");
                    report.errors += 1;
                    continue;
                }
            };
            let source = self.parts.source.as_mut();
            let result = match &classification {
                Classification::Ready => source.set_status(item.id, Status::Ready),
                Classification::NeedsInfo(question) => source
                    .comment(item.id, question)
                    .and_then(|()| source.set_status(item.id, Status::NeedsInfo)),
            };
            match result {
                Ok(()) => {
                    info!(item = item.id, ?classification, "triaged");
                    report.triaged.push(item.id);
                }
                Err(e) => {
                    warn!(item = item.id, error = %e, "failed to record triage result");
                    report.errors += 1;
                }
            }
        }
    }
}
