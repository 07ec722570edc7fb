//! In-memory collaborators for scheduler and reconciler tests. Each fake is
//! a cheap handle over shared state so a test can keep one copy to drive and
//! inspect while the scheduler owns another.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crate::error::SourceError;
use crate::ledger::Ledger;
use crate::model::{Status, WorkItem};
use crate::review::{ReviewRequest, ReviewVerdict, Reviewer};
use crate::scheduler::{Collaborators, Scheduler, SchedulerSettings};
use crate::source::WorkItemSource;
use crate::triage::{Classification, Classifier};
use crate::worker::{StartRequest, StartedWorker, WorkerProbe, WorkerSupervisor};
use crate::workspace::WorkspaceProvider;

#[derive(Default)]
pub struct Board {
    pub items: Vec<WorkItem>,
    pub comments: Vec<(u64, String)>,
    /// Status and claim writes that reached the board.
    pub writes: usize,
    pub fail_listing: bool,
    pub fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MemorySource(pub Rc<RefCell<Board>>);

impl MemorySource {
    pub fn add(&self, item: WorkItem) {
        self.0.borrow_mut().items.push(item);
    }

    pub fn ready(&self, id: u64) {
        self.add(WorkItem::new(id, &format!("Item {id}"), Status::Ready));
    }

    pub fn item(&self, id: u64) -> WorkItem {
        self.0
            .borrow()
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("no item {id}"))
    }

    pub fn status(&self, id: u64) -> Status {
        self.item(id).status
    }

    pub fn claim(&self, id: u64) -> Option<String> {
        self.item(id).claimed_by
    }

    /// A human edit; not counted as a write.
    pub fn edit(&self, id: u64, f: impl FnOnce(&mut WorkItem)) {
        let mut board = self.0.borrow_mut();
        let item = board
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .unwrap_or_else(|| panic!("no item {id}"));
        f(item);
    }

    pub fn writes(&self) -> usize {
        self.0.borrow().writes
    }

    pub fn comments_on(&self, id: u64) -> Vec<String> {
        self.0
            .borrow()
            .comments
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn write(&self, id: u64, f: impl FnOnce(&mut WorkItem)) -> Result<(), SourceError> {
        let mut board = self.0.borrow_mut();
        if board.fail_writes {
            return Err(SourceError::Transport {
                endpoint: "memory".into(),
                detail: "writes disabled".into(),
            });
        }
        let item = board
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(SourceError::NotFound(id))?;
        f(item);
        board.writes += 1;
        Ok(())
    }
}

impl WorkItemSource for MemorySource {
    fn fetch_eligible(&mut self, statuses: &[Status]) -> Result<Vec<WorkItem>, SourceError> {
        let board = self.0.borrow();
        if board.fail_listing {
            return Err(SourceError::Transport {
                endpoint: "memory".into(),
                detail: "listing disabled".into(),
            });
        }
        Ok(board
            .items
            .iter()
            .filter(|i| statuses.contains(&i.status))
            .cloned()
            .collect())
    }

    fn fetch_by_id(&mut self, id: u64) -> Result<WorkItem, SourceError> {
        self.0
            .borrow()
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or(SourceError::NotFound(id))
    }

    fn set_status(&mut self, id: u64, status: Status) -> Result<(), SourceError> {
        self.write(id, |i| i.status = status)
    }

    fn set_claim(&mut self, id: u64, token: Option<&str>) -> Result<(), SourceError> {
        self.write(id, |i| i.claimed_by = token.map(str::to_string))
    }

    fn get_claim(&mut self, id: u64) -> Result<Option<String>, SourceError> {
        Ok(self.fetch_by_id(id)?.claimed_by)
    }

    fn comment(&mut self, id: u64, body: &str) -> Result<(), SourceError> {
        self.0.borrow_mut().comments.push((id, body.to_string()));
        Ok(())
    }
}

pub struct FakeWorker {
    pub item_id: u64,
    pub provider: String,
    pub prompt: String,
    pub running: bool,
    pub output: String,
}

#[derive(Default)]
pub struct Workers {
    pub workers: BTreeMap<String, FakeWorker>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unavailable: BTreeSet<String>,
    pub fail_start: bool,
}

#[derive(Clone, Default)]
pub struct FakeSupervisor(pub Rc<RefCell<Workers>>);

impl FakeSupervisor {
    /// Latest token started for `item_id`.
    pub fn token_for(&self, item_id: u64) -> String {
        self.0
            .borrow()
            .started
            .iter()
            .rev()
            .find(|t| self.0.borrow().workers[*t].item_id == item_id)
            .cloned()
            .unwrap_or_else(|| panic!("no worker for {item_id}"))
    }

    pub fn prompt_for(&self, item_id: u64) -> String {
        let token = self.token_for(item_id);
        self.0.borrow().workers[&token].prompt.clone()
    }

    /// Make the latest worker for `item_id` exit after printing `output`.
    pub fn exit(&self, item_id: u64, output: &str) {
        self.print(item_id, output);
        let token = self.token_for(item_id);
        if let Some(w) = self.0.borrow_mut().workers.get_mut(&token) {
            w.running = false;
        }
    }

    /// Append output while the worker keeps running.
    pub fn print(&self, item_id: u64, output: &str) {
        let token = self.token_for(item_id);
        if let Some(w) = self.0.borrow_mut().workers.get_mut(&token) {
            w.output.push_str(output);
        }
    }

    pub fn running(&self) -> Vec<u64> {
        self.0
            .borrow()
            .workers
            .values()
            .filter(|w| w.running)
            .map(|w| w.item_id)
            .collect()
    }

    pub fn started_count(&self) -> usize {
        self.0.borrow().started.len()
    }
}

impl WorkerSupervisor for FakeSupervisor {
    fn start(&mut self, request: &StartRequest<'_>) -> anyhow::Result<StartedWorker> {
        let mut state = self.0.borrow_mut();
        if state.fail_start {
            anyhow::bail!("start disabled");
        }
        let token = format!("fake-{}-{}", request.item_id, state.started.len());
        state.workers.insert(
            token.clone(),
            FakeWorker {
                item_id: request.item_id,
                provider: request.provider.to_string(),
                prompt: request.prompt.to_string(),
                running: true,
                output: String::new(),
            },
        );
        state.started.push(token.clone());
        Ok(StartedWorker { token, pid: None })
    }

    fn stop(&mut self, token: &str, _pid: Option<u32>) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        if let Some(w) = state.workers.get_mut(token) {
            w.running = false;
        }
        state.stopped.push(token.to_string());
        Ok(())
    }

    fn probe(&mut self, token: &str, pid: Option<u32>) -> WorkerProbe {
        WorkerProbe {
            is_running: self.0.borrow().workers.get(token).is_some_and(|w| w.running),
            pid,
        }
    }

    fn output(&self, token: &str) -> String {
        self.0
            .borrow()
            .workers
            .get(token)
            .map(|w| w.output.clone())
            .unwrap_or_default()
    }

    fn is_available(&self, provider: &str) -> bool {
        !self.0.borrow().unavailable.contains(provider)
    }
}

/// Hands out queued verdicts; `None` in the queue stands for a reviewer error.
#[derive(Clone, Default)]
pub struct ScriptedReviewer(pub Rc<RefCell<VecDeque<Option<ReviewVerdict>>>>);

impl ScriptedReviewer {
    pub fn pass(&self) {
        self.0.borrow_mut().push_back(Some(ReviewVerdict {
            passed: true,
            remaining_work: Vec::new(),
        }));
    }

    pub fn fail(&self, remaining: &[&str]) {
        self.0.borrow_mut().push_back(Some(ReviewVerdict {
            passed: false,
            remaining_work: remaining.iter().map(ToString::to_string).collect(),
        }));
    }

    pub fn error(&self) {
        self.0.borrow_mut().push_back(None);
    }
}

impl Reviewer for ScriptedReviewer {
    fn review(&mut self, _request: &ReviewRequest<'_>) -> anyhow::Result<ReviewVerdict> {
        self.0
            .borrow_mut()
            .pop_front()
            .flatten()
            .ok_or_else(|| anyhow::anyhow!("reviewer unavailable"))
    }
}

#[derive(Clone, Default)]
pub struct FakeClassifier(pub Rc<RefCell<BTreeMap<u64, Classification>>>);

impl Classifier for FakeClassifier {
    fn classify(&mut self, item: &WorkItem) -> anyhow::Result<Classification> {
        self.0
            .borrow()
            .get(&item.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no classification for {}", item.id))
    }
}

#[derive(Clone, Default)]
pub struct FakeWorkspaces(pub Rc<RefCell<Vec<String>>>);

impl WorkspaceProvider for FakeWorkspaces {
    fn path_for(&self, branch: &str) -> PathBuf {
        PathBuf::from("/work").join(branch)
    }

    fn prepare(&mut self, _item_id: u64, branch: &str) -> anyhow::Result<PathBuf> {
        self.0.borrow_mut().push(branch.to_string());
        Ok(self.path_for(branch))
    }
}

pub fn settings(limit: usize) -> SchedulerSettings {
    SchedulerSettings {
        repository: "acme/widgets".into(),
        instance: "foreman".into(),
        base_branch: "main".into(),
        tick: Duration::ZERO,
        reconcile_every: 1000,
        assign_every: 1,
        max_resurrections: 5,
        default_provider: "claude".into(),
        limits: BTreeMap::from([("claude".to_string(), limit)]),
        triage: true,
    }
}

/// A scheduler over fresh fakes, plus handles to them.
pub struct Harness {
    pub scheduler: Scheduler,
    pub board: MemorySource,
    pub workers: FakeSupervisor,
    pub reviewer: ScriptedReviewer,
    pub classifier: FakeClassifier,
}

impl Harness {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self::build(settings, true)
    }

    pub fn without_reviewer(settings: SchedulerSettings) -> Self {
        Self::build(settings, false)
    }

    fn build(settings: SchedulerSettings, with_reviewer: bool) -> Self {
        let board = MemorySource::default();
        let workers = FakeSupervisor::default();
        let reviewer = ScriptedReviewer::default();
        let classifier = FakeClassifier::default();
        let parts = Collaborators {
            source: Box::new(board.clone()),
            supervisor: Box::new(workers.clone()),
            workspaces: Box::new(FakeWorkspaces::default()),
            reviewer: with_reviewer.then(|| Box::new(reviewer.clone()) as Box<dyn Reviewer>),
            classifier: Some(Box::new(classifier.clone())),
        };
        let scheduler = Scheduler::new(settings, Ledger::in_memory(), parts)
            .unwrap_or_else(|e| panic!("scheduler: {e}"));
        Self {
            scheduler,
            board,
            workers,
            reviewer,
            classifier,
        }
    }
}
