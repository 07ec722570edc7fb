//! Work items as the board sees them and assignments as foreman records them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote status of a work item, after mapping board option names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    NeedsTriage,
    NeedsInfo,
    Ready,
    InProgress,
    DevComplete,
    MergeReview,
    StageReady,
    Blocked,
    Failed,
    Done,
}

impl Status {
    pub const ALL: [Self; 10] = [
        Self::NeedsTriage,
        Self::NeedsInfo,
        Self::Ready,
        Self::InProgress,
        Self::DevComplete,
        Self::MergeReview,
        Self::StageReady,
        Self::Blocked,
        Self::Failed,
        Self::Done,
    ];

    /// Statuses in which an item must never carry a claim.
    pub const PRE_ASSIGNMENT: [Self; 3] = [Self::NeedsTriage, Self::NeedsInfo, Self::Ready];

    pub const fn is_active(self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub const fn is_pre_assignment(self) -> bool {
        matches!(self, Self::NeedsTriage | Self::NeedsInfo | Self::Ready)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NeedsTriage => "needs-triage",
            Self::NeedsInfo => "needs-info",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::DevComplete => "dev-complete",
            Self::MergeReview => "merge-review",
            Self::StageReady => "stage-ready",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded project field value. Sources turn whatever their transport
/// returns into one of these before anything else looks at it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    SingleSelect { option_id: String, name: String },
    Number(f64),
    Iteration {
        iteration_id: String,
        title: String,
        start_date: Option<String>,
    },
}

impl FieldValue {
    /// The human-readable value, if the field has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::SingleSelect { name, .. } => Some(name),
            Self::Iteration { title, .. } => Some(title),
            Self::Number(_) => None,
        }
    }
}

/// A unit of work on the board.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub status: Status,
    /// Worker-instance token of whoever holds the advisory lock.
    pub claimed_by: Option<String>,
    pub labels: Vec<String>,
    /// Worker class the item asks for, if any.
    pub provider: Option<String>,
    /// Runs alone: nothing else is assigned while it is active.
    pub exclusive: bool,
    /// Coordinates other work; a created pull request counts as completion.
    pub coordinator: bool,
    /// Source-specific handle for the item's board entry.
    pub project_item: Option<String>,
}

impl WorkItem {
    pub fn new(id: u64, title: &str, status: Status) -> Self {
        Self {
            id,
            title: title.to_string(),
            body: String::new(),
            status,
            claimed_by: None,
            labels: Vec::new(),
            provider: None,
            exclusive: false,
            coordinator: false,
            project_item: None,
        }
    }
}

/// Lifecycle of an assignment in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    DevComplete,
    Blocked,
    Failed,
    MergeReview,
    StageReady,
    Merged,
}

impl AssignmentStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Board status that mirrors this one.
    pub const fn remote_status(self) -> Status {
        match self {
            Self::Assigned | Self::InProgress => Status::InProgress,
            Self::DevComplete => Status::DevComplete,
            Self::Blocked => Status::Blocked,
            Self::Failed => Status::Failed,
            Self::MergeReview => Status::MergeReview,
            Self::StageReady => Status::StageReady,
            Self::Merged => Status::Done,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in-progress",
            Self::DevComplete => "dev-complete",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::MergeReview => "merge-review",
            Self::StageReady => "stage-ready",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worker run against an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSession {
    pub instance_token: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// "This instance is responsible for work item N."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub item_id: u64,
    pub title: String,
    pub provider: String,
    pub branch: String,
    #[serde(default)]
    pub instance_token: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub sessions: Vec<WorkSession>,
    pub assigned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub project_item: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub coordinator: bool,
    /// Board status and claim currently reflect this record.
    #[serde(default)]
    pub remote_synced: bool,
    /// Remaining-work notes for the next worker run.
    #[serde(default)]
    pub continuation: Vec<String>,
    /// Reason or result reference recorded when the assignment left the active states.
    #[serde(default)]
    pub outcome: Option<String>,
}

impl Assignment {
    pub fn new(item: &WorkItem, provider: &str) -> Self {
        let now = Utc::now();
        Self {
            item_id: item.id,
            title: item.title.clone(),
            provider: provider.to_string(),
            branch: branch_name(item.id, &item.title),
            instance_token: None,
            pid: None,
            status: AssignmentStatus::Assigned,
            sessions: Vec::new(),
            assigned_at: now,
            last_activity: now,
            completed_at: None,
            project_item: item.project_item.clone(),
            exclusive: item.exclusive,
            coordinator: item.coordinator,
            remote_synced: false,
            continuation: Vec::new(),
            outcome: None,
        }
    }

    /// How many times a worker was restarted for this assignment.
    pub fn resurrections(&self) -> usize {
        self.sessions.len().saturating_sub(1)
    }

    /// Record a freshly started worker and move to in-progress.
    pub fn begin_session(&mut self, token: &str, pid: Option<u32>) {
        let now = Utc::now();
        self.instance_token = Some(token.to_string());
        self.pid = pid;
        self.status = AssignmentStatus::InProgress;
        self.last_activity = now;
        self.remote_synced = false;
        self.sessions.push(WorkSession {
            instance_token: Some(token.to_string()),
            started_at: now,
            ended_at: None,
            summary: None,
        });
    }

    /// Close the open session, if any. Earlier sessions are never touched.
    pub fn end_session(&mut self, summary: Option<String>) {
        let now = Utc::now();
        self.last_activity = now;
        if let Some(session) = self.sessions.last_mut().filter(|s| s.ended_at.is_none()) {
            session.ended_at = Some(now);
            session.summary = summary;
        }
    }

    /// Leave the active states for good.
    pub fn finish(&mut self, status: AssignmentStatus, outcome: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.outcome = outcome;
        self.completed_at = Some(now);
        self.last_activity = now;
        self.remote_synced = false;
        self.pid = None;
    }

    /// Claim token the board should show for this record.
    pub fn published_claim(&self) -> Option<&str> {
        if self.status.is_active() {
            self.instance_token.as_deref()
        } else {
            None
        }
    }

    pub fn summaries(&self) -> Vec<&str> {
        self.sessions
            .iter()
            .filter_map(|s| s.summary.as_deref())
            .collect()
    }
}

/// Branch (and worktree directory) name for an item: `issue-<id>-<slug>`.
pub fn branch_name(id: u64, title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("issue-{id}")
    } else {
        format!("issue-{id}-{slug}")
    }
}
