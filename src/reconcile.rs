//! Bringing the local ledger and the board back into agreement.
//!
//! Three passes, in order:
//!
//! 1. Every local record is checked against the board. Active records whose
//!    item left the active state are withdrawn; unsynced ones are
//!    republished. Finished records are dropped once a human moves the item.
//! 2. Active items on the board claimed by a token we do not know are
//!    adopted when capacity allows, otherwise released back to Ready.
//! 3. Claims left on items that are back in a pre-assignment state are
//!    cleared.
//!
//! Running it twice in a row with nothing else happening mutates nothing
//! the second time.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::error::SourceError;
use crate::ledger::Ledger;
use crate::model::{Assignment, AssignmentStatus, Status, WorkItem, WorkSession};
use crate::scheduler::publish;
use crate::source::WorkItemSource;
use crate::worker::WorkerSupervisor;

/// Board statuses read in passes 2 and 3.
const SCANNED: [Status; 4] = [
    Status::NeedsTriage,
    Status::NeedsInfo,
    Status::Ready,
    Status::InProgress,
];

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Local records dropped because the board moved on.
    pub withdrawn: Vec<u64>,
    /// Finished records dropped because a human moved the item.
    pub requeued: Vec<u64>,
    /// Records whose status or claim was written again.
    pub republished: Vec<u64>,
    /// Records rebuilt from an unknown claim.
    pub reconstructed: Vec<u64>,
    /// Unknown claims released for lack of capacity.
    pub released: Vec<u64>,
    /// Claims cleared from pre-assignment items.
    pub stale_cleared: Vec<u64>,
    pub errors: usize,
}

impl ReconcileReport {
    pub fn mutations(&self) -> usize {
        self.withdrawn.len()
            + self.requeued.len()
            + self.republished.len()
            + self.reconstructed.len()
            + self.released.len()
            + self.stale_cleared.len()
    }
}

pub struct Reconciler<'a> {
    ledger: &'a mut Ledger,
    source: &'a mut dyn WorkItemSource,
    supervisor: &'a mut dyn WorkerSupervisor,
    limits: &'a BTreeMap<String, usize>,
    default_provider: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a mut Ledger,
        source: &'a mut dyn WorkItemSource,
        supervisor: &'a mut dyn WorkerSupervisor,
        limits: &'a BTreeMap<String, usize>,
        default_provider: &'a str,
    ) -> Self {
        Self {
            ledger,
            source,
            supervisor,
            limits,
            default_provider,
        }
    }

    pub fn run(mut self) -> ReconcileReport {
        let _span = info_span!("reconcile").entered();
        let mut report = ReconcileReport::default();

        self.check_local(&mut report);
        match self.source.fetch_eligible(&SCANNED) {
            Ok(items) => {
                self.adopt_or_release(&items, &mut report);
                self.clear_stale(&items, &mut report);
            }
            Err(e) => {
                warn!(error = %e, "could not list board items, skipping claim checks");
                report.errors += 1;
            }
        }

        if report.mutations() > 0 || report.errors > 0 {
            info!(
                withdrawn = report.withdrawn.len(),
                requeued = report.requeued.len(),
                republished = report.republished.len(),
                reconstructed = report.reconstructed.len(),
                released = report.released.len(),
                stale_cleared = report.stale_cleared.len(),
                errors = report.errors,
                "reconciled"
            );
        }
        report
    }

    fn check_local(&mut self, report: &mut ReconcileReport) {
        let records: Vec<Assignment> = self.ledger.all().cloned().collect();
        for record in records {
            let id = record.item_id;
            // Unsynced finished records are retried by the hand-off step.
            if !record.status.is_active() && !record.remote_synced {
                continue;
            }
            let remote = match self.source.fetch_by_id(id) {
                Ok(item) => Some(item),
                Err(SourceError::NotFound(_)) => None,
                Err(e) => {
                    warn!(item = id, error = %e, "could not read item");
                    report.errors += 1;
                    continue;
                }
            };
            let result = if record.status.is_active() {
                self.check_active(&record, remote.as_ref(), report)
            } else {
                self.check_finished(&record, remote.as_ref(), report)
            };
            if let Err(e) = result {
                warn!(item = id, error = format!("{e:#}"), "reconcile step failed");
                report.errors += 1;
            }
        }
    }

    fn check_active(
        &mut self,
        record: &Assignment,
        remote: Option<&WorkItem>,
        report: &mut ReconcileReport,
    ) -> anyhow::Result<()> {
        let id = record.item_id;
        match remote {
            Some(item) if item.status.is_active() => {
                if !record.remote_synced || item.claimed_by.as_deref() != record.published_claim() {
                    publish(self.ledger, self.source, id)?;
                    report.republished.push(id);
                }
            }
            // The first publish never landed; the board still shows the
            // item waiting.
            Some(item) if !record.remote_synced && item.status.is_pre_assignment() => {
                publish(self.ledger, self.source, id)?;
                report.republished.push(id);
            }
            _ => {
                withdraw(self.ledger, self.source, self.supervisor, record, remote)?;
                report.withdrawn.push(id);
            }
        }
        Ok(())
    }

    fn check_finished(
        &mut self,
        record: &Assignment,
        remote: Option<&WorkItem>,
        report: &mut ReconcileReport,
    ) -> anyhow::Result<()> {
        if remote.is_some_and(|i| i.status == record.status.remote_status()) {
            return Ok(());
        }
        self.ledger.remove(record.item_id)?;
        info!(item = record.item_id, status = %record.status, "finished record dropped, item moved");
        report.requeued.push(record.item_id);
        Ok(())
    }

    fn adopt_or_release(&mut self, items: &[WorkItem], report: &mut ReconcileReport) {
        for item in items.iter().filter(|i| i.status.is_active()) {
            // Unclaimed active items may be owned by a human.
            let Some(token) = item.claimed_by.as_deref() else {
                continue;
            };
            if self.ledger.find_by_token(token).is_some() {
                continue;
            }
            // Pass 1 already republished our own active records. A finished
            // record under a foreign claim means someone else took the item.
            if self.ledger.contains(item.id) {
                continue;
            }
            let result = if self.has_capacity(item) {
                self.reconstruct(item, token).map(|()| report.reconstructed.push(item.id))
            } else {
                self.release(item).map(|()| report.released.push(item.id))
            };
            if let Err(e) = result {
                warn!(item = item.id, error = format!("{e:#}"), "could not settle unknown claim");
                report.errors += 1;
            }
        }
    }

    fn provider_for(&self, item: &WorkItem) -> String {
        item.provider
            .as_deref()
            .filter(|p| self.limits.contains_key(*p))
            .unwrap_or(self.default_provider)
            .to_string()
    }

    fn has_capacity(&self, item: &WorkItem) -> bool {
        let provider = self.provider_for(item);
        let limit = self.limits.get(&provider).copied().unwrap_or(0);
        self.ledger.count_active(&provider) < limit
    }

    /// Adopt a claimed item we lost track of. The worker is unknown, so the
    /// next supervision pass treats it as exited.
    fn reconstruct(&mut self, item: &WorkItem, token: &str) -> anyhow::Result<()> {
        let provider = self.provider_for(item);
        let mut record = Assignment::new(item, &provider);
        record.status = AssignmentStatus::InProgress;
        record.instance_token = Some(token.to_string());
        record.remote_synced = true;
        record.sessions.push(WorkSession {
            instance_token: Some(token.to_string()),
            started_at: Utc::now(),
            ended_at: None,
            summary: None,
        });
        self.ledger.insert(record)?;
        info!(item = item.id, token, provider = %provider, "reconstructed assignment from claim");
        Ok(())
    }

    fn release(&mut self, item: &WorkItem) -> anyhow::Result<()> {
        self.source.set_status(item.id, Status::Ready)?;
        self.source.set_claim(item.id, None)?;
        info!(item = item.id, "released unknown claim, no capacity");
        Ok(())
    }

    fn clear_stale(&mut self, items: &[WorkItem], report: &mut ReconcileReport) {
        for item in items.iter().filter(|i| i.status.is_pre_assignment()) {
            if item.claimed_by.is_none() {
                continue;
            }
            match self.source.set_claim(item.id, None) {
                Ok(()) => {
                    info!(item = item.id, "cleared stale claim");
                    report.stale_cleared.push(item.id);
                }
                Err(e) => {
                    warn!(item = item.id, error = %e, "failed to clear stale claim");
                    report.errors += 1;
                }
            }
        }
    }
}

/// The board no longer wants this item worked on by us: stop the worker
/// and forget the record. The record goes even when the claim cannot be
/// cleared, so nothing restarts a worker on an item a human closed.
pub(crate) fn withdraw(
    ledger: &mut Ledger,
    source: &mut dyn WorkItemSource,
    supervisor: &mut dyn WorkerSupervisor,
    record: &Assignment,
    remote: Option<&WorkItem>,
) -> anyhow::Result<()> {
    let id = record.item_id;
    let token = record.instance_token.as_deref();
    if let Some(token) = token {
        if let Err(e) = supervisor.stop(token, record.pid) {
            warn!(item = id, token, error = %e, "failed to stop withdrawn worker");
        }
    }
    ledger.remove(id)?;
    info!(
        item = id,
        remote = remote.map_or("missing", |i| i.status.as_str()),
        "withdrawn"
    );

    let ours = token.is_some() && remote.is_some_and(|i| i.claimed_by.as_deref() == token);
    if ours {
        if let Err(e) = source.set_claim(id, None) {
            warn!(item = id, token = ?token, error = %e, "failed to clear claim on withdrawn item");
        }
    }
    Ok(())
}
