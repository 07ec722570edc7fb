//! Prompt rendering for workers, the reviewer and the triage classifier.

use minijinja::Environment;
use serde::Serialize;

const WORKER_TEMPLATE: &str = include_str!("templates/worker.md.jinja");
const CONTINUATION_TEMPLATE: &str = include_str!("templates/continuation.md.jinja");
const REVIEW_TEMPLATE: &str = include_str!("templates/review.md.jinja");
const TRIAGE_TEMPLATE: &str = include_str!("templates/triage.md.jinja");

/// Context for a worker prompt, first run or continuation.
#[derive(Debug, Serialize)]
pub struct WorkerContext<'a> {
    pub repository: &'a str,
    pub item_id: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub branch: &'a str,
    pub base_branch: &'a str,
    pub coordinator: bool,
    /// 1 for the first worker, incremented on every resurrection.
    pub attempt: usize,
    /// Summaries left by earlier sessions.
    pub summaries: Vec<&'a str>,
    /// Remaining-work notes from the reviewer.
    pub remaining: &'a [String],
}

impl WorkerContext<'_> {
    fn is_continuation(&self) -> bool {
        self.attempt > 1 || !self.remaining.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct ReviewContext<'a> {
    pub repository: &'a str,
    pub item_id: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub branch: &'a str,
    pub base_branch: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TriageContext<'a> {
    pub repository: &'a str,
    pub item_id: u64,
    pub title: &'a str,
    pub body: &'a str,
}

/// The embedded prompt templates, parsed once.
pub struct Prompts {
    env: Environment<'static>,
}

impl Prompts {
    pub fn new() -> anyhow::Result<Self> {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)?;
        env.add_template("continuation", CONTINUATION_TEMPLATE)?;
        env.add_template("review", REVIEW_TEMPLATE)?;
        env.add_template("triage", TRIAGE_TEMPLATE)?;
        Ok(Self { env })
    }

    /// First-run prompt, or the continuation prompt once an earlier worker
    /// has stopped without finishing.
    pub fn worker(&self, ctx: &WorkerContext<'_>) -> anyhow::Result<String> {
        let name = if ctx.is_continuation() {
            "continuation"
        } else {
            "worker"
        };
        self.render(name, ctx)
    }

    pub fn review(&self, ctx: &ReviewContext<'_>) -> anyhow::Result<String> {
        self.render("review", ctx)
    }

    pub fn triage(&self, ctx: &TriageContext<'_>) -> anyhow::Result<String> {
        self.render("triage", ctx)
    }

    fn render<S: Serialize>(&self, name: &str, ctx: &S) -> anyhow::Result<String> {
        let template = self.env.get_template(name)?;
        Ok(template.render(ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_ctx<'a>(attempt: usize, remaining: &'a [String]) -> WorkerContext<'a> {
        WorkerContext {
            repository: "acme/widgets",
            item_id: 42,
            title: "Add retry to uploads",
            body: "Uploads fail on flaky networks.",
            branch: "issue-42-add-retry-to-uploads",
            base_branch: "main",
            coordinator: false,
            attempt,
            summaries: vec!["added backoff helper"],
            remaining,
        }
    }

    #[test]
    fn first_run_uses_worker_prompt() {
        let prompts = Prompts::new().unwrap();
        let out = prompts.worker(&worker_ctx(1, &[])).unwrap();
        assert!(out.contains("issue #42 of acme/widgets"));
        assert!(out.contains("issue-42-add-retry-to-uploads"));
        assert!(out.contains("Closes #42"));
        assert!(out.contains("<promise>BLOCKED"));
        assert!(!out.contains("resuming"));
    }

    #[test]
    fn continuation_includes_notes_and_summaries() {
        let prompts = Prompts::new().unwrap();
        let remaining = vec!["tests for the retry limit".to_string()];
        let out = prompts.worker(&worker_ctx(2, &remaining)).unwrap();
        assert!(out.contains("resuming work on issue #42"));
        assert!(out.contains("attempt 2"));
        assert!(out.contains("- tests for the retry limit"));
        assert!(out.contains("- added backoff helper"));
    }

    #[test]
    fn coordinator_prompt_asks_for_pull_request() {
        let prompts = Prompts::new().unwrap();
        let mut ctx = worker_ctx(1, &[]);
        ctx.coordinator = true;
        let out = prompts.worker(&ctx).unwrap();
        assert!(out.contains("coordinates other work"));
    }

    #[test]
    fn review_and_triage_prompts_describe_answer_format() {
        let prompts = Prompts::new().unwrap();
        let review = prompts
            .review(&ReviewContext {
                repository: "acme/widgets",
                item_id: 7,
                title: "Fix login",
                body: "",
                branch: "issue-7-fix-login",
                base_branch: "main",
            })
            .unwrap();
        assert!(review.contains("<verdict>PASS</verdict>"));
        assert!(review.contains("gh pr list --head issue-7-fix-login"));

        let triage = prompts
            .triage(&TriageContext {
                repository: "acme/widgets",
                item_id: 8,
                title: "Make it faster",
                body: "",
            })
            .unwrap();
        assert!(triage.contains("(no description)"));
        assert!(triage.contains("<classification>NEEDS_INFO</classification>"));
    }
}
