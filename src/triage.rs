//! Classifying items that arrive in the triage column.

use crate::agent::{AgentCommand, last_tag};
use crate::config::Config;
use crate::model::WorkItem;
use crate::template::{Prompts, TriageContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ready,
    /// Not workable yet; the question to ask the author.
    NeedsInfo(String),
}

pub trait Classifier {
    fn classify(&mut self, item: &WorkItem) -> anyhow::Result<Classification>;
}

pub struct AgentClassifier {
    agent: AgentCommand,
    prompts: Prompts,
    repository: String,
}

impl AgentClassifier {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            agent: AgentCommand::new(&config.triage.command, &config.triage.args, config.triage.timeout),
            prompts: Prompts::new()?,
            repository: format!("{}/{}", config.project.owner, config.project.repo),
        })
    }
}

impl Classifier for AgentClassifier {
    fn classify(&mut self, item: &WorkItem) -> anyhow::Result<Classification> {
        let prompt = self.prompts.triage(&TriageContext {
            repository: &self.repository,
            item_id: item.id,
            title: &item.title,
            body: &item.body,
        })?;
        let output = self.agent.run(&prompt, None)?;
        parse_classification(&output)
    }
}

pub fn parse_classification(output: &str) -> anyhow::Result<Classification> {
    let class = last_tag(output, "classification")
        .ok_or_else(|| anyhow::anyhow!("classifier gave no <classification>"))?;
    match class.to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
        "READY" => Ok(Classification::Ready),
        "NEEDS_INFO" => {
            let question = last_tag(output, "question")
                .filter(|q| !q.is_empty())
                .unwrap_or("Could you add more detail about what done looks like?");
            Ok(Classification::NeedsInfo(question.to_string()))
        }
        other => anyhow::bail!("unknown classification {other:?}"),
    }
}
