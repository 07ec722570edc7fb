use clap::Args;

use super::{OutputFormat, ProjectArgs};

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl ReconcileArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.load()?;
        let mut scheduler = project.scheduler()?;
        let report = scheduler.reconcile();

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Pretty | OutputFormat::Text => {
                let rows = [
                    ("withdrawn", &report.withdrawn),
                    ("requeued", &report.requeued),
                    ("republished", &report.republished),
                    ("reconstructed", &report.reconstructed),
                    ("released", &report.released),
                    ("stale-cleared", &report.stale_cleared),
                ];
                for (label, ids) in rows {
                    let ids: Vec<String> = ids.iter().map(|id| format!("#{id}")).collect();
                    println!("{label:<14} {}", if ids.is_empty() { "-".to_string() } else { ids.join(" ") });
                }
                println!("{:<14} {}", "errors", report.errors);
            }
        }

        if report.errors > 0 {
            return Err(crate::error::ExitError::Other(format!(
                "{} reconcile step(s) failed",
                report.errors
            ))
            .into());
        }
        Ok(())
    }
}
