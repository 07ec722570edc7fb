//! Deciding whether a worker that exited silently actually finished.

use std::path::Path;

use crate::agent::{AgentCommand, last_tag};
use crate::config::Config;
use crate::template::{Prompts, ReviewContext};

#[derive(Debug, Clone, Copy)]
pub struct ReviewRequest<'a> {
    pub item_id: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub branch: &'a str,
    pub workdir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub passed: bool,
    /// What a continuation worker should do next. Empty when passed.
    pub remaining_work: Vec<String>,
}

/// Judges a branch against its issue. Errors mean "no verdict", never "fail".
pub trait Reviewer {
    fn review(&mut self, request: &ReviewRequest<'_>) -> anyhow::Result<ReviewVerdict>;
}

/// Asks an agent CLI for a verdict in the item's worktree.
pub struct AgentReviewer {
    agent: AgentCommand,
    prompts: Prompts,
    repository: String,
    base_branch: String,
}

impl AgentReviewer {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            agent: AgentCommand::new(&config.review.command, &config.review.args, config.review.timeout),
            prompts: Prompts::new()?,
            repository: format!("{}/{}", config.project.owner, config.project.repo),
            base_branch: config.workspace.base_branch.clone(),
        })
    }
}

impl Reviewer for AgentReviewer {
    fn review(&mut self, request: &ReviewRequest<'_>) -> anyhow::Result<ReviewVerdict> {
        let prompt = self.prompts.review(&ReviewContext {
            repository: &self.repository,
            item_id: request.item_id,
            title: request.title,
            body: request.body,
            branch: request.branch,
            base_branch: &self.base_branch,
        })?;
        let output = self.agent.run(&prompt, Some(request.workdir))?;
        parse_verdict(&output)
    }
}

/// Read `<verdict>PASS|FAIL</verdict>` and the optional `<remaining>` list.
pub fn parse_verdict(output: &str) -> anyhow::Result<ReviewVerdict> {
    let verdict = last_tag(output, "verdict")
        .ok_or_else(|| anyhow::anyhow!("reviewer gave no <verdict>"))?;
    let passed = match verdict.to_ascii_uppercase().as_str() {
        "PASS" => true,
        "FAIL" => false,
        other => anyhow::bail!("reviewer verdict {other:?} is neither PASS nor FAIL"),
    };
    let remaining_work = if passed {
        Vec::new()
    } else {
        last_tag(output, "remaining")
            .map(|block| {
                block
                    .lines()
                    .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    Ok(ReviewVerdict {
        passed,
        remaining_work,
    })
}
