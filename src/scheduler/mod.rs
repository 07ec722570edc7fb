//! The control loop: supervise running workers, reconcile with the board,
//! triage and assign new work, then hand finished work off.

mod assign;
pub mod decision;
pub mod plan;
mod supervise;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::config::{Config, ConfigWatcher};
use crate::error::LedgerError;
use crate::ledger::{History, Ledger};
use crate::model::{Assignment, AssignmentStatus, Status};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::review::Reviewer;
use crate::source::WorkItemSource;
use crate::template::Prompts;
use crate::triage::Classifier;
use crate::worker::WorkerSupervisor;
use crate::worker::signal::SignalDetector;
use crate::workspace::WorkspaceProvider;

/// Sleep granularity while waiting for the next tick, so a stop request
/// is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// The hot-reloadable part of the config, plus project coordinates.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub repository: String,
    pub instance: String,
    pub base_branch: String,
    pub tick: Duration,
    pub reconcile_every: u64,
    pub assign_every: u64,
    pub max_resurrections: usize,
    pub default_provider: String,
    pub limits: BTreeMap<String, usize>,
    pub triage: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            repository: format!("{}/{}", config.project.owner, config.project.repo),
            instance: config.project.instance.clone(),
            base_branch: config.workspace.base_branch.clone(),
            tick: Duration::from_secs(config.scheduler.tick_secs),
            reconcile_every: config.scheduler.reconcile_every.max(1),
            assign_every: config.scheduler.assign_every.max(1),
            max_resurrections: config.scheduler.max_resurrections,
            default_provider: config.scheduler.default_provider.clone(),
            limits: config.limits(),
            triage: config.triage.enabled,
        }
    }
}

/// Everything the scheduler talks to.
pub struct Collaborators {
    pub source: Box<dyn WorkItemSource>,
    pub supervisor: Box<dyn WorkerSupervisor>,
    pub workspaces: Box<dyn WorkspaceProvider>,
    /// Without a reviewer, silent exits are always resurrected.
    pub reviewer: Option<Box<dyn Reviewer>>,
    pub classifier: Option<Box<dyn Classifier>>,
}

/// What one pass of the loop did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub supervised: usize,
    pub completed: Vec<u64>,
    pub blocked: Vec<u64>,
    pub failed: Vec<u64>,
    pub resurrected: Vec<u64>,
    pub abandoned: Vec<u64>,
    /// Dropped because the board moved the item on.
    pub withdrawn: Vec<u64>,
    pub assigned: Vec<u64>,
    pub triaged: Vec<u64>,
    pub archived: Vec<u64>,
    pub reconcile: Option<ReconcileReport>,
    pub errors: usize,
}

impl TickReport {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Whether anything changed.
    pub fn is_quiet(&self) -> bool {
        self.completed.is_empty()
            && self.blocked.is_empty()
            && self.failed.is_empty()
            && self.resurrected.is_empty()
            && self.abandoned.is_empty()
            && self.withdrawn.is_empty()
            && self.assigned.is_empty()
            && self.triaged.is_empty()
            && self.archived.is_empty()
            && self.reconcile.as_ref().is_none_or(|r| r.mutations() == 0)
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    ledger: Ledger,
    parts: Collaborators,
    detector: SignalDetector,
    prompts: Prompts,
    history: Option<History>,
    watcher: Option<ConfigWatcher>,
    ticks: u64,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        ledger: Ledger,
        parts: Collaborators,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            ledger,
            parts,
            detector: SignalDetector::default(),
            prompts: Prompts::new().context("loading prompt templates")?,
            history: None,
            watcher: None,
            ticks: 0,
        })
    }

    #[must_use]
    pub fn with_detector(mut self, detector: SignalDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Archive handed-off assignments here instead of dropping them.
    #[must_use]
    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    /// Reload limits and cadences when the config file changes.
    #[must_use]
    pub fn with_watcher(mut self, watcher: ConfigWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub const fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run until `stop` is set, then shut down.
    pub fn run(&mut self, stop: &AtomicBool) {
        info!(
            repository = %self.settings.repository,
            instance = %self.settings.instance,
            tick_secs = self.settings.tick.as_secs(),
            "scheduler started"
        );
        while !stop.load(Ordering::SeqCst) {
            let report = self.tick();
            if !report.is_quiet() {
                info!(
                    tick = report.tick,
                    assigned = report.assigned.len(),
                    completed = report.completed.len(),
                    resurrected = report.resurrected.len(),
                    errors = report.errors,
                    "tick finished"
                );
            }
            let deadline = Instant::now() + self.settings.tick;
            while !stop.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(SLEEP_SLICE.min(deadline - Instant::now()));
            }
        }
        self.shutdown();
    }

    /// One pass of the loop. Each step is isolated: a failure is logged and
    /// counted, and the remaining steps still run.
    ///
    /// The first pass reconciles before supervising so a stale ledger left
    /// by an earlier run is corrected before anything acts on it.
    pub fn tick(&mut self) -> TickReport {
        let n = self.ticks;
        self.ticks += 1;
        let _span = info_span!("tick", n).entered();

        self.reload_config();
        let mut report = TickReport::new(n);

        if n == 0 {
            report.reconcile = Some(self.reconcile());
        }
        self.supervise(&mut report);
        if n > 0 && n % self.settings.reconcile_every == 0 {
            report.reconcile = Some(self.reconcile());
        }
        if n % self.settings.assign_every == 0 {
            self.triage(&mut report);
            self.assign(&mut report);
        }
        self.hand_off(&mut report);

        if let Some(reconcile) = &report.reconcile {
            report.errors += reconcile.errors;
        }
        report
    }

    /// Bring the ledger and the board back into agreement.
    pub fn reconcile(&mut self) -> ReconcileReport {
        Reconciler::new(
            &mut self.ledger,
            self.parts.source.as_mut(),
            self.parts.supervisor.as_mut(),
            &self.settings.limits,
            &self.settings.default_provider,
        )
        .run()
    }

    /// Final hand-off pass, then stop every worker we still track. Records
    /// stay in the ledger so the next run resumes them.
    pub fn shutdown(&mut self) {
        info!("scheduler stopping");
        let mut report = TickReport::new(self.ticks);
        self.hand_off(&mut report);
        self.watcher = None;
        for record in self.ledger.active() {
            let Some(token) = record.instance_token.as_deref() else {
                continue;
            };
            if let Err(e) = self.parts.supervisor.stop(token, record.pid) {
                warn!(item = record.item_id, token, error = %e, "failed to stop worker");
            }
        }
    }

    /// Drop an assignment on request: stop its worker, forget it, clear the
    /// claim and optionally put the item back in Ready.
    pub fn unassign(&mut self, item_id: u64, requeue: bool) -> anyhow::Result<Assignment> {
        let record = self
            .ledger
            .get(item_id)
            .cloned()
            .ok_or(LedgerError::NotFound(item_id))?;
        if let Some(token) = record.instance_token.as_deref() {
            self.parts.supervisor.stop(token, record.pid)?;
        }
        let record = self.ledger.remove(item_id)?;
        let source = self.parts.source.as_mut();
        if let Err(e) = source.set_claim(item_id, None) {
            warn!(item = item_id, error = %e, "failed to clear claim");
        }
        if requeue {
            if let Err(e) = source.set_status(item_id, Status::Ready) {
                warn!(item = item_id, error = %e, "failed to requeue item");
            }
        }
        info!(item = item_id, requeue, "unassigned");
        Ok(record)
    }

    /// Retry unsynced terminal records, then archive synced dev-complete
    /// ones. Blocked and failed records stay until a human moves the item.
    fn hand_off(&mut self, report: &mut TickReport) {
        let finished: Vec<u64> = self
            .ledger
            .all()
            .filter(|a| !a.status.is_active())
            .map(|a| a.item_id)
            .collect();
        for id in finished {
            let synced = self.ledger.get(id).is_some_and(|a| a.remote_synced);
            if !synced {
                if let Err(e) = publish(&mut self.ledger, self.parts.source.as_mut(), id) {
                    warn!(item = id, error = %e, "hand-off not published, will retry");
                    report.errors += 1;
                    continue;
                }
            }
            if self
                .ledger
                .get(id)
                .is_some_and(|a| a.status == AssignmentStatus::DevComplete)
            {
                match self.archive(id) {
                    Ok(()) => report.archived.push(id),
                    Err(e) => {
                        warn!(item = id, error = %e, "failed to archive assignment");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    fn archive(&mut self, id: u64) -> anyhow::Result<()> {
        if let (Some(history), Some(record)) = (&self.history, self.ledger.get(id)) {
            history.append(record)?;
        }
        self.ledger.remove(id)?;
        debug!(item = id, "archived");
        Ok(())
    }

    fn reload_config(&mut self) {
        let Some(config) = self.watcher.as_mut().and_then(ConfigWatcher::poll) else {
            return;
        };
        let mut settings = SchedulerSettings::from_config(&config);
        if settings.repository != self.settings.repository {
            warn!("project coordinates changed; restart to apply");
            settings.repository.clone_from(&self.settings.repository);
        }
        for provider in settings.limits.keys() {
            if !self.settings.limits.contains_key(provider) {
                warn!(provider = %provider, "new worker class needs a restart before it can start workers");
            }
        }
        self.settings = settings;
        self.detector = SignalDetector::new(&config.signals.extra_completion_patterns);
    }
}

/// Write a record's status and claim to the board and mark it synced.
pub(crate) fn publish(
    ledger: &mut Ledger,
    source: &mut dyn WorkItemSource,
    item_id: u64,
) -> anyhow::Result<()> {
    let record = ledger
        .get(item_id)
        .ok_or(LedgerError::NotFound(item_id))?;
    let status = record.status.remote_status();
    let claim = record.published_claim().map(str::to_string);
    source.set_status(item_id, status)?;
    source.set_claim(item_id, claim.as_deref())?;
    ledger.update(item_id, |a| a.remote_synced = true)?;
    debug!(item = item_id, status = %status, claim = claim.as_deref().unwrap_or(""), "published");
    Ok(())
}
