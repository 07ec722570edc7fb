use anyhow::Context;
use tracing::{info, info_span, warn};

use super::decision::{Action, decide};
use super::{Scheduler, TickReport, publish};
use crate::error::{LedgerError, SourceError};
use crate::model::{Assignment, AssignmentStatus, WorkItem};
use crate::reconcile::withdraw;
use crate::review::ReviewRequest;
use crate::template::WorkerContext;
use crate::worker::StartRequest;
use crate::worker::signal::extract_summary;

/// How a supervised assignment left the active states.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Blocked,
    Failed,
}

impl Scheduler {
    /// Check every active assignment and act on what its worker says.
    pub(super) fn supervise(&mut self, report: &mut TickReport) {
        for id in self.ledger.active_ids() {
            report.supervised += 1;
            let _span = info_span!("supervise", item = id).entered();
            if let Err(e) = self.supervise_one(id, report) {
                warn!(item = id, error = format!("{e:#}"), "supervision failed");
                report.errors += 1;
            }
        }
    }

    fn supervise_one(&mut self, id: u64, report: &mut TickReport) -> anyhow::Result<()> {
        let record = self
            .ledger
            .get(id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?;
        if !record.status.is_active() {
            return Ok(());
        }

        // No worker yet: an earlier start failed after the record was kept.
        let Some(token) = record.instance_token.clone() else {
            self.launch(id, None)?;
            report.resurrected.push(id);
            return Ok(());
        };

        let probe = self.parts.supervisor.probe(&token, record.pid);
        let output = self.parts.supervisor.output(&token);
        let signal = self.detector.detect(&output, record.coordinator);
        let action = decide(probe.is_running, &signal);
        if action != Action::Wait {
            info!(item = id, token = %token, running = probe.is_running, ?signal, ?action, "worker decision");
        }

        if probe.is_running && action != Action::Wait {
            if let Err(e) = self.parts.supervisor.stop(&token, record.pid) {
                warn!(item = id, token = %token, error = %e, "failed to stop finished worker");
            }
        }

        let summary = extract_summary(&output);
        match action {
            Action::Wait => {
                if !record.remote_synced {
                    self.republish_or_withdraw(&record, report)?;
                }
            }
            Action::Complete { result } => {
                self.finish(id, Outcome::Completed, result, summary)?;
                report.completed.push(id);
            }
            Action::Block { reason } => {
                self.finish(id, Outcome::Blocked, Some(reason), summary)?;
                report.blocked.push(id);
            }
            Action::Fail { reason } => {
                self.finish(id, Outcome::Failed, Some(reason), summary)?;
                report.failed.push(id);
            }
            Action::ReviewThenDecide => self.review_then_decide(id, summary, report)?,
        }
        Ok(())
    }

    /// An earlier publish failed. Republish only while the board still
    /// shows the item waiting or in progress; any other status was set by a
    /// human and wins.
    fn republish_or_withdraw(
        &mut self,
        record: &Assignment,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let id = record.item_id;
        let remote = match self.parts.source.fetch_by_id(id) {
            Ok(item) => Some(item),
            Err(SourceError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match &remote {
            Some(item) if item.status.is_active() || item.status.is_pre_assignment() => {
                publish(&mut self.ledger, self.parts.source.as_mut(), id)
            }
            _ => {
                withdraw(
                    &mut self.ledger,
                    self.parts.source.as_mut(),
                    self.parts.supervisor.as_mut(),
                    record,
                    remote.as_ref(),
                )?;
                report.withdrawn.push(id);
                Ok(())
            }
        }
    }

    /// Close the assignment, publish the terminal status with the claim
    /// cleared, and tell humans on the item.
    fn finish(
        &mut self,
        id: u64,
        outcome: Outcome,
        detail: Option<String>,
        summary: Option<String>,
    ) -> anyhow::Result<()> {
        let status = match outcome {
            Outcome::Completed => AssignmentStatus::DevComplete,
            Outcome::Blocked => AssignmentStatus::Blocked,
            Outcome::Failed => AssignmentStatus::Failed,
        };
        self.ledger.update(id, |a| {
            a.end_session(summary);
            a.continuation.clear();
            a.finish(status, detail.clone());
        })?;
        info!(item = id, status = %status, detail = detail.as_deref().unwrap_or(""), "assignment finished");

        if let Err(e) = publish(&mut self.ledger, self.parts.source.as_mut(), id) {
            warn!(item = id, error = %e, "status not published, will retry");
        }
        let instance = &self.settings.instance;
        let note = match (outcome, detail.as_deref()) {
            (Outcome::Completed, Some(result)) => {
                format!("**{instance}**: work is ready for review ({result}).")
            }
            (Outcome::Completed, None) => format!("**{instance}**: work is ready for review."),
            (Outcome::Blocked, reason) => format!(
                "**{instance}**: worker is blocked: {}",
                reason.unwrap_or("no reason given")
            ),
            (Outcome::Failed, reason) => format!(
                "**{instance}**: worker failed: {}",
                reason.unwrap_or("no reason given")
            ),
        };
        self.note(id, &note);
        Ok(())
    }

    /// The worker exited without saying whether it finished. A passing
    /// review completes the item; anything else restarts it.
    fn review_then_decide(
        &mut self,
        id: u64,
        summary: Option<String>,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let record = self
            .ledger
            .get(id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?;

        let verdict = match self.parts.reviewer.as_mut() {
            None => None,
            Some(reviewer) => {
                let body = match self.parts.source.fetch_by_id(id) {
                    Ok(item) => item.body,
                    Err(_) => String::new(),
                };
                let workdir = self.parts.workspaces.path_for(&record.branch);
                let request = ReviewRequest {
                    item_id: id,
                    title: &record.title,
                    body: &body,
                    branch: &record.branch,
                    workdir: &workdir,
                };
                match reviewer.review(&request) {
                    Ok(verdict) => Some(verdict),
                    Err(e) => {
                        warn!(item = id, error = format!("{e:#}"), "review gave no verdict");
                        None
                    }
                }
            }
        };

        match verdict {
            Some(v) if v.passed => {
                self.finish(id, Outcome::Completed, Some("review passed".into()), summary)?;
                report.completed.push(id);
            }
            verdict => {
                let remaining = verdict.map(|v| v.remaining_work).unwrap_or_default();
                self.resurrect(id, summary, remaining, report)?;
            }
        }
        Ok(())
    }

    /// Start a fresh worker on the same branch, carrying the history
    /// forward. Gives up once the budget is spent.
    fn resurrect(
        &mut self,
        id: u64,
        summary: Option<String>,
        remaining: Vec<String>,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let resurrections = self
            .ledger
            .get(id)
            .ok_or(LedgerError::NotFound(id))?
            .resurrections();
        self.ledger.update(id, |a| {
            a.end_session(summary);
            a.continuation = remaining;
            a.instance_token = None;
            a.pid = None;
            a.remote_synced = false;
        })?;

        if resurrections >= self.settings.max_resurrections {
            return self.abandon(id, report);
        }
        self.launch(id, None)?;
        info!(item = id, attempt = resurrections + 2, "worker resurrected");
        report.resurrected.push(id);
        Ok(())
    }

    /// Out of attempts: hand the item to humans as blocked. The record stays
    /// until the board shows it, so a failed write is retried by hand-off.
    fn abandon(&mut self, id: u64, report: &mut TickReport) -> anyhow::Result<()> {
        let runs = self
            .ledger
            .get(id)
            .ok_or(LedgerError::NotFound(id))?
            .sessions
            .len();
        self.ledger.update(id, |a| {
            a.finish(
                AssignmentStatus::Blocked,
                Some(format!("gave up after {runs} worker runs")),
            );
        })?;
        warn!(item = id, sessions = runs, "giving up on assignment");
        if let Err(e) = publish(&mut self.ledger, self.parts.source.as_mut(), id) {
            warn!(item = id, error = %e, "status not published, will retry");
        }
        let note = format!(
            "**{}**: giving up after {runs} worker runs without a result. Moving to blocked.",
            self.settings.instance,
        );
        self.note(id, &note);
        report.abandoned.push(id);
        Ok(())
    }

    /// Prepare the workspace, render the prompt and start a worker for an
    /// existing record, then publish the new claim.
    pub(super) fn launch(&mut self, id: u64, item: Option<&WorkItem>) -> anyhow::Result<()> {
        let record = self
            .ledger
            .get(id)
            .cloned()
            .ok_or(LedgerError::NotFound(id))?;
        if !self.parts.supervisor.is_available(&record.provider) {
            anyhow::bail!("worker class {} is unavailable", record.provider);
        }

        let body = match item {
            Some(item) => item.body.clone(),
            None => match self.parts.source.fetch_by_id(id) {
                Ok(item) if item.status.is_active() || item.status.is_pre_assignment() => item.body,
                Ok(item) => anyhow::bail!("#{id} moved to {} on the board, not restarting", item.status),
                Err(SourceError::NotFound(_)) => anyhow::bail!("#{id} is gone from the board"),
                Err(e) => {
                    warn!(item = id, error = %e, "could not read item body");
                    String::new()
                }
            },
        };
        let workdir = self
            .parts
            .workspaces
            .prepare(id, &record.branch)
            .with_context(|| format!("preparing workspace for #{id}"))?;
        let prompt = self.prompts.worker(&WorkerContext {
            repository: &self.settings.repository,
            item_id: id,
            title: &record.title,
            body: &body,
            branch: &record.branch,
            base_branch: &self.settings.base_branch,
            coordinator: record.coordinator,
            attempt: record.sessions.len() + 1,
            summaries: record.summaries(),
            remaining: &record.continuation,
        })?;
        let started = self.parts.supervisor.start(&StartRequest {
            provider: &record.provider,
            item_id: id,
            prompt: &prompt,
            workdir: &workdir,
        })?;
        self.ledger.update(id, |a| {
            a.begin_session(&started.token, started.pid);
            a.continuation.clear();
        })?;
        info!(item = id, token = %started.token, attempt = record.sessions.len() + 1, "session started");

        if let Err(e) = publish(&mut self.ledger, self.parts.source.as_mut(), id) {
            warn!(item = id, error = %e, "claim not published, will retry");
        }
        Ok(())
    }

    /// Comment on the item. Failures only cost the note.
    pub(super) fn note(&mut self, id: u64, body: &str) {
        if let Err(e) = self.parts.source.comment(id, body) {
            warn!(item = id, error = %e, "failed to comment");
        }
    }
}
