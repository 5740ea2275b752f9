//! Sync runs
//!
//! Ties admission, the fan-out executor, the fetch chain, escalation and
//! health recording into one scheduled run.

mod run;
mod terminal;

pub use run::{run_sync, ItemFailure, PlannedItem, RunSummary, SyncRun};
pub use terminal::{extract_terminal_at, parse_timestamp};
