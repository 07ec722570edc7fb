use std::path::Path;
use std::process::Command;

use crate::config::ProviderConfig;

use super::WorkerClass;

/// Claude Code in headless mode, streaming JSON events to its log.
pub struct ClaudeWorker {
    binary: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl ClaudeWorker {
    pub const NAME: &'static str = "claude";

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            binary: config.command.clone().unwrap_or_else(|| Self::NAME.to_string()),
            model: config.model.clone(),
            extra_args: config.args.clone(),
        }
    }

    fn args<'a>(&'a self, prompt: &'a str) -> Vec<&'a str> {
        let mut args = vec![
            "--verbose",
            "--output-format",
            "stream-json",
            "--dangerously-skip-permissions",
        ];
        if let Some(model) = &self.model {
            args.push("--model");
            args.push(model);
        }
        args.extend(self.extra_args.iter().map(String::as_str));
        args.push("-p");
        args.push(prompt);
        args
    }
}

impl WorkerClass for ClaudeWorker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, prompt: &str, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(prompt)).current_dir(workdir);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_includes_model_and_prompt_last() {
        let worker = ClaudeWorker::from_config(&ProviderConfig {
            max_concurrent: 1,
            command: None,
            args: vec!["--max-turns".into(), "50".into()],
            model: Some("opus".into()),
        });
        let args = worker.args("fix #4");
        assert_eq!(args[args.len() - 2..], ["-p", "fix #4"]);
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(args.windows(2).any(|w| w == ["--max-turns", "50"]));
        assert_eq!(worker.binary(), "claude");
    }

    #[test]
    fn command_runs_in_workdir() {
        let worker = ClaudeWorker::from_config(&ProviderConfig {
            command: Some("/opt/bin/claude".into()),
            ..ProviderConfig::default()
        });
        let cmd = worker.command("hi", Path::new("/tmp/wt"));
        assert_eq!(cmd.get_program(), "/opt/bin/claude");
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp/wt")));
    }
}
