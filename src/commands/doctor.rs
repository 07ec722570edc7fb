use std::path::Path;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, ProjectArgs, display_path};
use crate::config::Config;
use crate::error::ExitError;
use crate::ledger::Ledger;
use crate::source::github::GithubApi;
use crate::subprocess::Tool;
use crate::worker::ProcessSupervisor;

#[derive(Debug, Args)]
pub struct DoctorArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub config: String,
    pub repository: String,
    pub project_number: u64,
    pub tools: Vec<ToolStatus>,
    pub issues: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub purpose: String,
    pub version: Option<String>,
    pub present: bool,
}

fn check_tool(name: &str, purpose: &str) -> ToolStatus {
    let version = Tool::new(name)
        .arg("--version")
        .run()
        .ok()
        .filter(|out| out.success())
        .map(|out| out.stdout.lines().next().unwrap_or_default().trim().to_string());
    ToolStatus {
        name: name.to_string(),
        purpose: purpose.to_string(),
        present: version.is_some(),
        version,
    }
}

/// Binaries the configured features need, with what each is for.
fn required_tools(config: &Config) -> Vec<(String, String)> {
    let mut tools = vec![("git".to_string(), "worktrees".to_string())];
    for (name, provider) in &config.providers {
        let binary = provider.command.clone().unwrap_or_else(|| name.clone());
        tools.push((binary, format!("{name} workers")));
    }
    if config.review.enabled {
        tools.push((config.review.command.clone(), "review".to_string()));
    }
    if config.triage.enabled {
        tools.push((config.triage.command.clone(), "triage".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    tools.retain(|(binary, _)| seen.insert(binary.clone()));
    tools
}

fn check_state(config: &Config, root: &Path, issues: &mut Vec<String>) {
    let dir = config.state_dir(root);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        issues.push(format!("state directory {} is not writable: {e}", dir.display()));
        return;
    }
    if let Err(e) = Ledger::open(&config.ledger_path(root)) {
        issues.push(format!("{e:#}"));
    }
}

impl DoctorArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.load()?;
        let config = &project.config;

        let mut report = DoctorReport {
            config: display_path(&project.root, &project.config_path),
            repository: format!("{}/{}", config.project.owner, config.project.repo),
            project_number: config.project.project_number,
            tools: Vec::new(),
            issues: Vec::new(),
        };

        for (binary, purpose) in required_tools(config) {
            let status = check_tool(&binary, &purpose);
            if !status.present {
                report.issues.push(format!("tool not found: {binary} (needed for {purpose})"));
            }
            report.tools.push(status);
        }
        if let Err(e) = ProcessSupervisor::from_config(config, &config.log_dir(&project.root)) {
            report.issues.push(e.to_string());
        }
        if let Err(e) = GithubApi::from_env() {
            report.issues.push(e.to_string());
        }
        check_state(config, &project.root, &mut report.issues);

        match OutputFormat::resolve(self.format) {
            OutputFormat::Pretty => Self::print_pretty(&report),
            OutputFormat::Text => Self::print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }

        if !report.issues.is_empty() {
            return Err(ExitError::Other(format!("{} issue(s) found", report.issues.len())).into());
        }
        Ok(())
    }

    fn print_pretty(report: &DoctorReport) {
        println!("=== foreman doctor ===\n");
        println!("Config:  {}", report.config);
        println!("Project: {} (board #{})", report.repository, report.project_number);
        println!("\nTools:");
        for tool in &report.tools {
            match &tool.version {
                Some(v) => println!("  ✓ {} ({}): {v}", tool.name, tool.purpose),
                None => println!("  ✗ {} ({}): NOT FOUND", tool.name, tool.purpose),
            }
        }
        if report.issues.is_empty() {
            println!("\n✓ No issues found");
        } else {
            println!("\nIssues ({}):", report.issues.len());
            for issue in &report.issues {
                println!("  • {issue}");
            }
        }
    }

    fn print_text(report: &DoctorReport) {
        println!(
            "foreman-doctor  config={}  repository={}  project={}",
            report.config, report.repository, report.project_number
        );
        for tool in &report.tools {
            let status = tool
                .version
                .as_deref()
                .map_or_else(|| "missing".to_string(), |v| format!("ok  {v}"));
            println!("tool  {}  {}  {status}", tool.name, tool.purpose);
        }
        for issue in &report.issues {
            println!("issue  {issue}");
        }
    }
}
