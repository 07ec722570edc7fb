use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, ProjectArgs, display_path};
use crate::model::Assignment;
use crate::worker::probe::process_state;

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub repository: String,
    pub instance: String,
    pub ledger: String,
    pub capacity: BTreeMap<String, Capacity>,
    pub assignments: Vec<AssignmentRow>,
}

#[derive(Debug, Serialize)]
pub struct Capacity {
    pub active: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct AssignmentRow {
    pub item: u64,
    pub title: String,
    pub status: String,
    pub provider: String,
    pub branch: String,
    pub token: Option<String>,
    pub pid: Option<u32>,
    /// Whether the recorded pid is alive. None when there is no pid.
    pub alive: Option<bool>,
    pub sessions: usize,
    pub synced: bool,
    pub assigned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl AssignmentRow {
    fn from_record(record: &Assignment) -> Self {
        Self {
            item: record.item_id,
            title: record.title.clone(),
            status: record.status.to_string(),
            provider: record.provider.clone(),
            branch: record.branch.clone(),
            token: record.instance_token.clone(),
            pid: record.pid,
            alive: record.pid.map(|pid| process_state(pid).is_alive()),
            sessions: record.sessions.len(),
            synced: record.remote_synced,
            assigned_at: record.assigned_at,
            outcome: record.outcome.clone(),
        }
    }
}

impl StatusArgs {
    /// Reads only the local ledger; never talks to the board.
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.load()?;
        let ledger = project.open_ledger()?;
        let config = &project.config;

        let capacity = config
            .limits()
            .into_iter()
            .map(|(provider, limit)| {
                let active = ledger.count_active(&provider);
                (provider, Capacity { active, limit })
            })
            .collect();
        let report = StatusReport {
            repository: format!("{}/{}", config.project.owner, config.project.repo),
            instance: config.project.instance.clone(),
            ledger: display_path(&project.root, &config.ledger_path(&project.root)),
            capacity,
            assignments: ledger.all().map(AssignmentRow::from_record).collect(),
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => Self::print_pretty(&report),
            OutputFormat::Text => Self::print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }

    fn print_pretty(report: &StatusReport) {
        println!("=== foreman: {} ({}) ===\n", report.repository, report.instance);
        println!("Capacity:");
        for (provider, c) in &report.capacity {
            println!("  {provider}: {}/{}", c.active, c.limit);
        }
        if report.assignments.is_empty() {
            println!("\nNo assignments.");
            return;
        }
        println!("\nAssignments:");
        for row in &report.assignments {
            let liveness = match row.alive {
                Some(true) => "running",
                Some(false) => "exited",
                None => "no process",
            };
            println!(
                "  #{:<6} {:<13} {:<8} {:<10} {}",
                row.item, row.status, row.provider, liveness, row.title
            );
            if let Some(outcome) = &row.outcome {
                println!("          {outcome}");
            }
        }
    }

    fn print_text(report: &StatusReport) {
        println!(
            "foreman-status  repository={}  instance={}  ledger={}",
            report.repository, report.instance, report.ledger
        );
        for (provider, c) in &report.capacity {
            println!("capacity  provider={provider}  active={}  limit={}", c.active, c.limit);
        }
        for row in &report.assignments {
            println!(
                "assignment  item={}  status={}  provider={}  token={}  pid={}  sessions={}  synced={}",
                row.item,
                row.status,
                row.provider,
                row.token.as_deref().unwrap_or("-"),
                row.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                row.sessions,
                row.synced
            );
        }
    }
}
