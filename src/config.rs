use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::model::Status;

/// Config file name, looked up at the project root.
pub const CONFIG_TOML: &str = ".foreman.toml";

/// Find the config file for a project.
///
/// Looks for `.foreman.toml` in `dir`, then for the per-user
/// `<config dir>/foreman/config.toml`. Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let local = dir.join(CONFIG_TOML);
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("foreman").join("config.toml");
    user.exists().then_some(user)
}

/// Top-level .foreman.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub status_map: StatusMapConfig,
    #[serde(default)]
    pub fields: FieldsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
}

/// Which board this instance works from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    /// User or organization owning both the repository and the project.
    pub owner: String,
    pub repo: String,
    pub project_number: u64,
    /// Name of this orchestrator instance, used in comments.
    #[serde(default = "default_instance")]
    pub instance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    /// Seconds between control-loop ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Run a full reconciliation every N ticks (and on the first one).
    #[serde(default = "default_reconcile_every")]
    pub reconcile_every: u64,
    /// Look for new work every N ticks.
    #[serde(default = "default_assign_every")]
    pub assign_every: u64,
    /// Restarts allowed per assignment before it is handed back to a human.
    #[serde(default = "default_max_resurrections")]
    pub max_resurrections: usize,
    /// Worker class used when an item does not request one.
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            reconcile_every: default_reconcile_every(),
            assign_every: default_assign_every(),
            max_resurrections: default_max_resurrections(),
            default_provider: default_provider(),
        }
    }
}

/// One worker class.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProviderConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Override the worker binary.
    #[serde(default)]
    pub command: Option<String>,
    /// Extra arguments appended to the worker command line.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            command: None,
            args: Vec::new(),
            model: None,
        }
    }
}

/// Board option names for each internal status. The first name is used when
/// writing; any of them is accepted when reading (case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusMapConfig {
    #[serde(default = "default_needs_triage")]
    pub needs_triage: Vec<String>,
    #[serde(default = "default_needs_info")]
    pub needs_info: Vec<String>,
    #[serde(default = "default_ready")]
    pub ready: Vec<String>,
    #[serde(default = "default_in_progress")]
    pub in_progress: Vec<String>,
    #[serde(default = "default_dev_complete")]
    pub dev_complete: Vec<String>,
    #[serde(default = "default_merge_review")]
    pub merge_review: Vec<String>,
    #[serde(default = "default_stage_ready")]
    pub stage_ready: Vec<String>,
    #[serde(default = "default_blocked")]
    pub blocked: Vec<String>,
    #[serde(default = "default_failed")]
    pub failed: Vec<String>,
    #[serde(default = "default_done")]
    pub done: Vec<String>,
}

impl StatusMapConfig {
    pub fn labels(&self, status: Status) -> &[String] {
        match status {
            Status::NeedsTriage => &self.needs_triage,
            Status::NeedsInfo => &self.needs_info,
            Status::Ready => &self.ready,
            Status::InProgress => &self.in_progress,
            Status::DevComplete => &self.dev_complete,
            Status::MergeReview => &self.merge_review,
            Status::StageReady => &self.stage_ready,
            Status::Blocked => &self.blocked,
            Status::Failed => &self.failed,
            Status::Done => &self.done,
        }
    }
}

impl Default for StatusMapConfig {
    fn default() -> Self {
        Self {
            needs_triage: default_needs_triage(),
            needs_info: default_needs_info(),
            ready: default_ready(),
            in_progress: default_in_progress(),
            dev_complete: default_dev_complete(),
            merge_review: default_merge_review(),
            stage_ready: default_stage_ready(),
            blocked: default_blocked(),
            failed: default_failed(),
            done: default_done(),
        }
    }
}

/// Names of the board fields and labels foreman reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldsConfig {
    #[serde(default = "default_status_field")]
    pub status: String,
    /// Text field holding the worker-instance token of the current claim.
    #[serde(default = "default_claim_field")]
    pub claimed_by: String,
    /// Single-select field naming the worker class an item asks for.
    #[serde(default = "default_provider_field")]
    pub provider: String,
    #[serde(default = "default_exclusive_label")]
    pub exclusive_label: String,
    #[serde(default = "default_coordinator_label")]
    pub coordinator_label: String,
}

impl Default for FieldsConfig {
    fn default() -> Self {
        Self {
            status: default_status_field(),
            claimed_by: default_claim_field(),
            provider: default_provider_field(),
            exclusive_label: default_exclusive_label(),
            coordinator_label: default_coordinator_label(),
        }
    }
}

/// Reviewer consulted when a worker exits without saying it is done.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_900")]
    pub timeout: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_agent_command(),
            args: default_agent_args(),
            timeout: default_timeout_900(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_300")]
    pub timeout: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_agent_command(),
            args: default_agent_args(),
            timeout: default_timeout_300(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceConfig {
    /// Directory holding one git worktree per assignment, relative to the project root.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            base_branch: default_base_branch(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct StateConfig {
    /// Ledger, history and worker logs. Defaults to `.foreman` under the project root.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SignalsConfig {
    /// Additional regexes treated as "the worker says it finished".
    #[serde(default)]
    pub extra_completion_patterns: Vec<String>,
}

fn default_instance() -> String { "foreman".into() }
fn default_tick_secs() -> u64 { 30 }
fn default_reconcile_every() -> u64 { 10 }
fn default_assign_every() -> u64 { 2 }
fn default_max_resurrections() -> usize { 5 }
fn default_provider() -> String { "claude".into() }
fn default_max_concurrent() -> usize { 2 }
fn default_providers() -> BTreeMap<String, ProviderConfig> {
    BTreeMap::from([(default_provider(), ProviderConfig::default())])
}
fn default_needs_triage() -> Vec<String> { vec!["Triage".into()] }
fn default_needs_info() -> Vec<String> { vec!["Needs Info".into()] }
fn default_ready() -> Vec<String> { vec!["Ready".into(), "Todo".into()] }
fn default_in_progress() -> Vec<String> { vec!["In Progress".into()] }
fn default_dev_complete() -> Vec<String> { vec!["Dev Complete".into()] }
fn default_merge_review() -> Vec<String> { vec!["Merge Review".into()] }
fn default_stage_ready() -> Vec<String> { vec!["Stage Ready".into()] }
fn default_blocked() -> Vec<String> { vec!["Blocked".into()] }
fn default_failed() -> Vec<String> { vec!["Failed".into()] }
fn default_done() -> Vec<String> { vec!["Done".into()] }
fn default_status_field() -> String { "Status".into() }
fn default_claim_field() -> String { "Claimed By".into() }
fn default_provider_field() -> String { "Agent".into() }
fn default_exclusive_label() -> String { "block-all".into() }
fn default_coordinator_label() -> String { "coordinator".into() }
fn default_true() -> bool { true }
fn default_agent_command() -> String { "claude".into() }
fn default_agent_args() -> Vec<String> { vec!["-p".into()] }
fn default_timeout_300() -> u64 { 300 }
fn default_timeout_900() -> u64 { 900 }
fn default_workspace_root() -> String { "../worktrees".into() }
fn default_base_branch() -> String { "main".into() }

impl Config {
    /// A config with defaults everywhere except the project coordinates.
    pub fn new(owner: &str, repo: &str, project_number: u64) -> Self {
        Self {
            project: ProjectConfig {
                owner: owner.to_string(),
                repo: repo.to_string(),
                project_number,
                instance: default_instance(),
            },
            scheduler: SchedulerConfig::default(),
            providers: default_providers(),
            status_map: StatusMapConfig::default(),
            fields: FieldsConfig::default(),
            review: ReviewConfig::default(),
            triage: TriageConfig::default(),
            workspace: WorkspaceConfig::default(),
            state: StateConfig::default(),
            signals: SignalsConfig::default(),
        }
    }

    /// Load and validate config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::parse_toml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Reject configs the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.project_number == 0 {
            return Err(ExitError::Config("project.project_number must be set".into()).into());
        }
        if !self.providers.contains_key(&self.scheduler.default_provider) {
            return Err(ExitError::Config(format!(
                "scheduler.default_provider {:?} has no [providers.{}] section",
                self.scheduler.default_provider, self.scheduler.default_provider
            ))
            .into());
        }
        if self.scheduler.tick_secs == 0
            || self.scheduler.reconcile_every == 0
            || self.scheduler.assign_every == 0
        {
            return Err(ExitError::Config("scheduler cadences must be at least 1".into()).into());
        }
        for status in Status::ALL {
            if self.status_map.labels(status).is_empty() {
                return Err(ExitError::Config(format!(
                    "status_map.{} needs at least one board option name",
                    status.as_str().replace('-', "_")
                ))
                .into());
            }
        }
        for pattern in &self.signals.extra_completion_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ExitError::Config(format!("invalid completion pattern {pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# foreman configuration\n# Print the full schema with `foreman schema`\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(|item| item.as_table_mut()) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "scheduler", "\n# Control loop cadence\n");
        set_table_comment(
            &mut doc,
            "providers",
            "\n# Worker classes and their concurrency limits\n",
        );
        set_table_comment(
            &mut doc,
            "status_map",
            "\n# Board option names per status (first name is written)\n",
        );
        set_table_comment(&mut doc, "fields", "\n# Board field and label names\n");
        set_table_comment(
            &mut doc,
            "review",
            "\n# Reviewer run when a worker exits without a completion marker\n",
        );
        set_table_comment(&mut doc, "triage", "\n# Classify Triage items before assignment\n");

        Ok(doc.to_string())
    }

    /// Concurrency limit per worker class.
    pub fn limits(&self) -> BTreeMap<String, usize> {
        self.providers
            .iter()
            .map(|(name, p)| (name.clone(), p.max_concurrent))
            .collect()
    }

    /// Directory holding the ledger, history and worker logs.
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        self.state
            .dir
            .as_ref()
            .map_or_else(|| root.join(".foreman"), |dir| root.join(dir))
    }

    pub fn ledger_path(&self, root: &Path) -> PathBuf {
        self.state_dir(root).join("ledger.json")
    }

    pub fn history_path(&self, root: &Path) -> PathBuf {
        self.state_dir(root).join("history.jsonl")
    }

    /// Worker stdout and stderr, one file per instance token.
    pub fn log_dir(&self, root: &Path) -> PathBuf {
        self.state_dir(root).join("logs")
    }

    /// Directory under which worktrees are created.
    pub fn workspace_root(&self, root: &Path) -> PathBuf {
        root.join(&self.workspace.root)
    }
}

/// Polls the config file's mtime so limits and cadences can change while
/// the loop is running.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            modified: mtime(path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new config if the file changed since the last poll and
    /// still parses. A broken edit is logged and the running config kept.
    pub fn poll(&mut self) -> Option<Config> {
        let current = mtime(&self.path);
        if current.is_none() || current == self.modified {
            return None;
        }
        self.modified = current;
        match Config::load(&self.path) {
            Ok(config) => {
                tracing::info!(path = %self.path.display(), "config reloaded");
                Some(config)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring config change");
                None
            }
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
