pub mod doctor;
pub mod init;
pub mod reconcile;
pub mod run;
pub mod schema;
pub mod status;
pub mod unassign;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;

use crate::config::{CONFIG_TOML, Config, ConfigWatcher, find_config};
use crate::error::ExitError;
use crate::ledger::{History, Ledger};
use crate::review::{AgentReviewer, Reviewer};
use crate::scheduler::{Collaborators, Scheduler, SchedulerSettings};
use crate::source::github::{GithubApi, ProjectBoard};
use crate::triage::{AgentClassifier, Classifier};
use crate::worker::ProcessSupervisor;
use crate::worker::signal::SignalDetector;
use crate::workspace::GitWorktrees;

/// Where the project lives and which config to use.
#[derive(Debug, Clone, Args)]
pub struct ProjectArgs {
    /// Project root directory (default: current directory)
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Config file (default: .foreman.toml in the project root, then the user config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, plain text when piped.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// A project root with its loaded config.
pub struct Project {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub config: Config,
}

impl ProjectArgs {
    pub fn root(&self) -> anyhow::Result<PathBuf> {
        match &self.project_root {
            Some(p) => Ok(p.clone()),
            None => std::env::current_dir().context("could not determine current directory"),
        }
    }

    pub fn load(&self) -> anyhow::Result<Project> {
        let root = self.root()?;
        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => find_config(&root).ok_or_else(|| {
                ExitError::Config(format!(
                    "no {CONFIG_TOML} found in {} (run `foreman init`)",
                    root.display()
                ))
            })?,
        };
        let config = Config::load(&config_path)?;
        Ok(Project {
            root,
            config_path,
            config,
        })
    }
}

impl Project {
    pub fn open_ledger(&self) -> anyhow::Result<Ledger> {
        Ledger::open(&self.config.ledger_path(&self.root))
    }

    /// Wire the scheduler to the real board, worker processes, agents and
    /// worktrees. Unsupported worker classes fail here, before any network
    /// access.
    pub fn scheduler(&self) -> anyhow::Result<Scheduler> {
        let config = &self.config;
        let mut supervisor = ProcessSupervisor::from_config(config, &config.log_dir(&self.root))?;
        supervisor.preflight();
        let ledger = self.open_ledger()?;

        let board = ProjectBoard::new(GithubApi::from_env()?, config);
        let reviewer: Option<Box<dyn Reviewer>> = if config.review.enabled {
            Some(Box::new(AgentReviewer::from_config(config)?))
        } else {
            None
        };
        let classifier: Option<Box<dyn Classifier>> = if config.triage.enabled {
            Some(Box::new(AgentClassifier::from_config(config)?))
        } else {
            None
        };

        let parts = Collaborators {
            source: Box::new(board),
            supervisor: Box::new(supervisor),
            workspaces: Box::new(GitWorktrees::from_config(config, &self.root)),
            reviewer,
            classifier,
        };
        Ok(
            Scheduler::new(SchedulerSettings::from_config(config), ledger, parts)?
                .with_detector(SignalDetector::new(&config.signals.extra_completion_patterns))
                .with_history(History::new(&config.history_path(&self.root)))
                .with_watcher(ConfigWatcher::new(&self.config_path)),
        )
    }
}

/// `path` relative to `root` for display, or as-is when outside it.
pub fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
