//! Scheduling of per-item work within a run

mod fanout;

pub use fanout::{settle_all, ConcurrencyLimit};
