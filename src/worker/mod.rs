//! Starting, supervising and stopping worker processes.

pub mod claude;
pub mod probe;
pub mod signal;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::config::Config;
use crate::error::ExitError;
use crate::subprocess::Tool;

use claude::ClaudeWorker;

/// What to start, and where.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    pub provider: &'a str,
    pub item_id: u64,
    pub prompt: &'a str,
    pub workdir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedWorker {
    pub token: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProbe {
    pub is_running: bool,
    pub pid: Option<u32>,
}

/// Starts workers and answers questions about them by instance token.
pub trait WorkerSupervisor {
    /// Start a worker. Every call mints a new token, even for an item that
    /// had workers before.
    fn start(&mut self, request: &StartRequest<'_>) -> anyhow::Result<StartedWorker>;

    /// Ask the worker to exit. A worker that is already gone is not an error.
    fn stop(&mut self, token: &str, pid: Option<u32>) -> anyhow::Result<()>;

    /// Is the worker still running? `pid` is used for workers this process
    /// did not start itself.
    fn probe(&mut self, token: &str, pid: Option<u32>) -> WorkerProbe;

    /// Everything the worker has written so far.
    fn output(&self, token: &str) -> String;

    /// Whether workers of this class can be started at all.
    fn is_available(&self, provider: &str) -> bool;
}

/// A kind of worker: knows its binary and how to build its command line.
pub trait WorkerClass {
    fn name(&self) -> &str;
    fn binary(&self) -> &str;
    fn command(&self, prompt: &str, workdir: &Path) -> Command;
}

struct LiveWorker {
    child: Child,
    provider: String,
    item_id: u64,
}

/// Workers started by this process, keyed by instance token.
#[derive(Default)]
pub struct WorkerRegistry {
    live: HashMap<String, LiveWorker>,
}

impl WorkerRegistry {
    fn register(&mut self, token: &str, child: Child, provider: &str, item_id: u64) {
        self.live.insert(
            token.to_string(),
            LiveWorker {
                child,
                provider: provider.to_string(),
                item_id,
            },
        );
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.live.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Runs workers as detached OS processes, each in its own process group,
/// with stdout and stderr going to `<log dir>/<token>.log`.
pub struct ProcessSupervisor {
    classes: BTreeMap<String, Box<dyn WorkerClass>>,
    unavailable: BTreeSet<String>,
    registry: WorkerRegistry,
    log_dir: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            classes: BTreeMap::new(),
            unavailable: BTreeSet::new(),
            registry: WorkerRegistry::default(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// One worker class per `[providers.*]` entry. Unknown classes are a
    /// config error so they fail at startup, not at assignment time.
    pub fn from_config(config: &Config, log_dir: &Path) -> anyhow::Result<Self> {
        let mut supervisor = Self::new(log_dir);
        for (name, provider) in &config.providers {
            let class: Box<dyn WorkerClass> = match name.as_str() {
                ClaudeWorker::NAME => Box::new(ClaudeWorker::from_config(provider)),
                other => {
                    return Err(ExitError::Config(format!(
                        "unsupported worker provider: {other} (supported: {})",
                        ClaudeWorker::NAME
                    ))
                    .into());
                }
            };
            supervisor.add_class(class);
        }
        Ok(supervisor)
    }

    pub fn add_class(&mut self, class: Box<dyn WorkerClass>) {
        self.classes.insert(class.name().to_string(), class);
    }

    /// Check every class's binary once. Missing binaries are warned about
    /// and their class is marked unavailable.
    pub fn preflight(&mut self) -> Vec<String> {
        let mut missing = Vec::new();
        for (name, class) in &self.classes {
            match Tool::new(class.binary())
                .arg("--version")
                .timeout(Duration::from_secs(15))
                .run()
            {
                Err(e)
                    if matches!(
                        e.downcast_ref::<ExitError>(),
                        Some(ExitError::ToolNotFound { .. })
                    ) =>
                {
                    tracing::warn!(
                        provider = %name,
                        binary = class.binary(),
                        "worker binary not found, provider disabled"
                    );
                    missing.push(name.clone());
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "worker binary check failed");
                }
                Ok(_) => {}
            }
        }
        self.unavailable.extend(missing.iter().cloned());
        missing
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn log_path(&self, token: &str) -> PathBuf {
        self.log_dir.join(format!("{token}.log"))
    }
}

impl WorkerSupervisor for ProcessSupervisor {
    fn start(&mut self, request: &StartRequest<'_>) -> anyhow::Result<StartedWorker> {
        if !self.is_available(request.provider) {
            anyhow::bail!("worker provider {} is not available", request.provider);
        }
        let class = self
            .classes
            .get(request.provider)
            .with_context(|| format!("unknown worker provider {}", request.provider))?;

        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("creating {}", self.log_dir.display()))?;
        let token = mint_token(request.provider, request.item_id);
        let log_path = self.log_dir.join(format!("{token}.log"));
        let log = File::create(&log_path)
            .with_context(|| format!("creating {}", log_path.display()))?;
        let log_err = log.try_clone().context("duplicating worker log handle")?;

        let mut cmd = class.command(request.prompt, request.workdir);
        cmd.stdin(Stdio::null()).stdout(log).stderr(log_err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| -> anyhow::Error {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExitError::ToolNotFound {
                    tool: class.binary().to_string(),
                }
                .into()
            } else {
                anyhow::Error::new(e).context(format!("spawning {}", class.binary()))
            }
        })?;
        let pid = child.id();
        tracing::info!(
            item = request.item_id,
            token = %token,
            pid,
            provider = request.provider,
            "worker started"
        );
        self.registry
            .register(&token, child, request.provider, request.item_id);
        Ok(StartedWorker {
            token,
            pid: Some(pid),
        })
    }

    fn stop(&mut self, token: &str, pid: Option<u32>) -> anyhow::Result<()> {
        if let Some(mut worker) = self.registry.live.remove(token) {
            if worker.child.try_wait().ok().flatten().is_none() {
                if let Err(e) = probe::terminate(worker.child.id()) {
                    tracing::debug!(token, error = %e, "SIGTERM failed, will kill");
                }
                let deadline = Instant::now() + Duration::from_secs(3);
                while worker.child.try_wait().ok().flatten().is_none() {
                    if Instant::now() >= deadline {
                        let _ = worker.child.kill();
                        let _ = worker.child.wait();
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
            tracing::info!(
                item = worker.item_id,
                token,
                provider = %worker.provider,
                "worker stopped"
            );
            return Ok(());
        }
        if let Some(pid) = pid {
            if probe::process_state(pid).is_alive() {
                probe::terminate(pid)
                    .with_context(|| format!("terminating worker {token} (pid {pid})"))?;
                tracing::info!(token, pid, "worker stopped");
            }
        }
        Ok(())
    }

    fn probe(&mut self, token: &str, pid: Option<u32>) -> WorkerProbe {
        if let Some(worker) = self.registry.live.get_mut(token) {
            let pid = Some(worker.child.id());
            return match worker.child.try_wait() {
                Ok(None) => WorkerProbe {
                    is_running: true,
                    pid,
                },
                Ok(Some(status)) => {
                    tracing::debug!(token, %status, "worker exited");
                    self.registry.live.remove(token);
                    WorkerProbe {
                        is_running: false,
                        pid,
                    }
                }
                Err(e) => {
                    tracing::warn!(token, error = %e, "could not poll worker");
                    WorkerProbe {
                        is_running: pid.is_some_and(|p| probe::process_state(p).is_alive()),
                        pid,
                    }
                }
            };
        }
        WorkerProbe {
            is_running: pid.is_some_and(|p| probe::process_state(p).is_alive()),
            pid,
        }
    }

    fn output(&self, token: &str) -> String {
        fs::read(self.log_path(token))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    fn is_available(&self, provider: &str) -> bool {
        self.classes.contains_key(provider) && !self.unavailable.contains(provider)
    }
}

/// `<provider>-<item>-<unix millis>-<random>`: unique even when two workers
/// for the same item start within the same millisecond.
fn mint_token(provider: &str, item_id: u64) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let nonce: u32 = rand::random();
    format!("{provider}-{item_id}-{millis}-{nonce:08x}")
}
