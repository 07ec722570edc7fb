use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::model::Assignment;

const LEDGER_VERSION: u32 = 1;

/// On-disk shape of `ledger.json`.
#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    assignments: Vec<Assignment>,
}

/// Durable record of the assignments this instance is responsible for,
/// keyed by work-item id.
///
/// Every mutation is validated against the record invariants and written
/// through to disk before it returns.
#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    records: BTreeMap<u64, Assignment>,
}

impl Ledger {
    /// Open the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let records = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            load_records(path, &contents)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            records,
        })
    }

    /// A ledger that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, item_id: u64) -> Option<&Assignment> {
        self.records.get(&item_id)
    }

    pub fn contains(&self, item_id: u64) -> bool {
        self.records.contains_key(&item_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by work-item id.
    pub fn all(&self) -> impl Iterator<Item = &Assignment> {
        self.records.values()
    }

    /// Records in an active state (assigned or in-progress).
    pub fn active(&self) -> Vec<&Assignment> {
        self.records
            .values()
            .filter(|a| a.status.is_active())
            .collect()
    }

    pub fn active_ids(&self) -> Vec<u64> {
        self.active().iter().map(|a| a.item_id).collect()
    }

    pub fn count_active(&self, provider: &str) -> usize {
        self.records
            .values()
            .filter(|a| a.status.is_active() && a.provider == provider)
            .count()
    }

    pub fn find_by_token(&self, token: &str) -> Option<&Assignment> {
        self.records
            .values()
            .find(|a| a.instance_token.as_deref() == Some(token))
    }

    /// Add a new record. Rejects a second record for the same item and a
    /// token already held by another record.
    pub fn insert(&mut self, assignment: Assignment) -> anyhow::Result<()> {
        if self.records.contains_key(&assignment.item_id) {
            return Err(LedgerError::DuplicateItem(assignment.item_id).into());
        }
        self.check_token(&assignment)?;
        self.records.insert(assignment.item_id, assignment);
        self.persist()
    }

    /// Apply `f` to a copy of the record, validate it, then store it.
    pub fn update<F>(&mut self, item_id: u64, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Assignment),
    {
        let mut updated = self
            .records
            .get(&item_id)
            .cloned()
            .ok_or(LedgerError::NotFound(item_id))?;
        f(&mut updated);
        updated.item_id = item_id;
        self.check_token(&updated)?;
        self.records.insert(item_id, updated);
        self.persist()
    }

    /// Delete a record, returning it.
    pub fn remove(&mut self, item_id: u64) -> anyhow::Result<Assignment> {
        let removed = self
            .records
            .remove(&item_id)
            .ok_or(LedgerError::NotFound(item_id))?;
        self.persist()?;
        Ok(removed)
    }

    fn check_token(&self, candidate: &Assignment) -> Result<(), LedgerError> {
        let Some(token) = candidate.instance_token.as_deref() else {
            return Ok(());
        };
        match self.records.values().find(|a| {
            a.item_id != candidate.item_id && a.instance_token.as_deref() == Some(token)
        }) {
            Some(owner) => Err(LedgerError::DuplicateToken {
                token: token.to_string(),
                owner: owner.item_id,
            }),
            None => Ok(()),
        }
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = LedgerFile {
            version: LEDGER_VERSION,
            assignments: self.records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file).context("serializing ledger")?;

        // Write to a sibling temp file and rename over the ledger so a crash
        // mid-write never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

fn load_records(path: &Path, contents: &str) -> anyhow::Result<BTreeMap<u64, Assignment>> {
    let corrupt = |detail: String| LedgerError::Corrupt {
        path: path.display().to_string(),
        detail,
    };
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: LedgerFile = serde_json::from_str(contents).map_err(|e| corrupt(e.to_string()))?;
    if file.version > LEDGER_VERSION {
        return Err(corrupt(format!("unsupported ledger version {}", file.version)).into());
    }

    let mut records = BTreeMap::new();
    let mut tokens = BTreeMap::new();
    for assignment in file.assignments {
        if let Some(token) = assignment.instance_token.clone() {
            if let Some(owner) = tokens.insert(token.clone(), assignment.item_id) {
                return Err(corrupt(format!(
                    "token {token} held by #{owner} and #{}",
                    assignment.item_id
                ))
                .into());
            }
        }
        let id = assignment.item_id;
        if records.insert(id, assignment).is_some() {
            return Err(corrupt(format!("two records for #{id}")).into());
        }
    }
    Ok(records)
}

/// Append-only log of assignments handed off downstream, one JSON object per line.
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn append(&self, assignment: &Assignment) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(assignment).context("serializing history entry")?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .with_context(|| format!("appending to {}", self.path.display()))
    }

    /// Most recent entries last. Lines that fail to parse are skipped.
    pub fn read_all(&self) -> anyhow::Result<Vec<Assignment>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
