use std::io::IsTerminal;

use clap::Args;

use super::ProjectArgs;
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct UnassignArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Work item (issue) number
    pub item: u64,
    /// Move the item back to Ready
    #[arg(long)]
    pub requeue: bool,
    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

impl UnassignArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.load()?;
        let ledger = project.open_ledger()?;
        let Some(record) = ledger.get(self.item) else {
            return Err(ExitError::Other(format!("no assignment for #{}", self.item)).into());
        };

        if !self.yes {
            if !std::io::stdin().is_terminal() {
                return Err(ExitError::Other("refusing to unassign without --yes".into()).into());
            }
            let prompt = format!(
                "Stop the worker for #{} ({}) and forget the assignment?",
                record.item_id, record.title
            );
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
        }
        drop(ledger);

        let mut scheduler = project.scheduler()?;
        let record = scheduler.unassign(self.item, self.requeue)?;
        println!(
            "Unassigned #{} ({}){}",
            record.item_id,
            record.status,
            if self.requeue { ", moved back to Ready" } else { "" }
        );
        Ok(())
    }
}
