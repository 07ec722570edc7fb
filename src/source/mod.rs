//! The remote system of record for work items.

pub mod github;

use std::collections::HashSet;

use crate::config::StatusMapConfig;
use crate::error::SourceError;
use crate::model::{Status, WorkItem};

/// Fetches and updates work items. Implementations page through results
/// themselves; callers always see a complete, de-duplicated list in the
/// source's own priority order.
pub trait WorkItemSource {
    fn fetch_eligible(&mut self, statuses: &[Status]) -> Result<Vec<WorkItem>, SourceError>;

    fn fetch_by_id(&mut self, id: u64) -> Result<WorkItem, SourceError>;

    fn set_status(&mut self, id: u64, status: Status) -> Result<(), SourceError>;

    /// Set (`Some`) or clear (`None`) the claim token.
    fn set_claim(&mut self, id: u64, token: Option<&str>) -> Result<(), SourceError>;

    fn get_claim(&mut self, id: u64) -> Result<Option<String>, SourceError>;

    /// Leave a note on the item for humans.
    fn comment(&mut self, id: u64, body: &str) -> Result<(), SourceError>;
}

/// Two-way mapping between internal statuses and board option names.
#[derive(Debug, Clone)]
pub struct StatusMap {
    entries: Vec<(Status, Vec<String>)>,
}

impl StatusMap {
    pub fn from_config(config: &StatusMapConfig) -> Self {
        let entries = Status::ALL
            .iter()
            .map(|&s| (s, config.labels(s).to_vec()))
            .collect();
        Self { entries }
    }

    /// Internal status for a board option name. Unknown names map to None.
    pub fn parse(&self, label: &str) -> Option<Status> {
        let label = label.trim();
        self.entries
            .iter()
            .find(|(_, labels)| labels.iter().any(|l| l.eq_ignore_ascii_case(label)))
            .map(|(status, _)| *status)
    }

    /// Board option name written for `status`.
    pub fn label(&self, status: Status) -> Option<&str> {
        self.entries
            .iter()
            .find(|(s, _)| *s == status)
            .and_then(|(_, labels)| labels.first())
            .map(String::as_str)
    }
}

impl Default for StatusMap {
    fn default() -> Self {
        Self::from_config(&StatusMapConfig::default())
    }
}

/// Keep the first occurrence of each id, preserving order.
pub fn dedup_items(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.id)).collect()
}
