use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;

use super::ProjectArgs;
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
    /// Run a single pass and exit. Workers keep running in the background.
    #[arg(long)]
    pub once: bool,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let project = self.project.load()?;
        let mut scheduler = project.scheduler()?;

        if self.once {
            let report = scheduler.tick();
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                // Second interrupt: give up on a clean shutdown.
                std::process::exit(130);
            }
            eprintln!("Received interrupt signal, stopping workers...");
        })
        .map_err(|e| ExitError::Other(format!("could not install signal handler: {e}")))?;

        scheduler.run(&stop);
        Ok(())
    }
}
