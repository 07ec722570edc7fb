use std::path::Path;
use std::time::Duration;

use crate::subprocess::Tool;

/// A one-shot agent invocation: `<program> <args...> <prompt>`, run to
/// completion with a timeout, stdout returned.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl AgentCommand {
    pub fn new(program: &str, args: &[String], timeout_secs: u64) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn run(&self, prompt: &str, workdir: Option<&Path>) -> anyhow::Result<String> {
        let mut tool = Tool::new(&self.program).timeout(self.timeout);
        for arg in &self.args {
            tool = tool.arg(arg);
        }
        tool = tool.arg(prompt);
        if let Some(dir) = workdir {
            tool = tool.current_dir(dir);
        }
        Ok(tool.run_ok()?.stdout)
    }
}

/// Text between the last `<tag>` and the `</tag>` after it.
pub fn last_tag<'a>(output: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = output.rfind(&open)? + open.len();
    let end = output[start..].find(&close)? + start;
    Some(output[start..end].trim())
}
