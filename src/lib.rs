//! foreman - assign project-board issues to supervised worker agents and
//! keep the board honest

pub mod agent;
pub mod commands;
pub mod config;
pub mod error;
pub mod ledger;
pub mod model;
pub mod reconcile;
pub mod review;
pub mod scheduler;
pub mod source;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod triage;
pub mod worker;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
