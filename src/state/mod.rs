//! State module for item sync progress
//!
//! # Components
//!
//! - `ItemState`: Where an item stands with respect to re-fetching
//! - `StalenessRecord`: What the store remembers about an item's syncs
//! - `admit_for_fetch`: The per-run admission decision

mod item_state;
mod staleness;

// Re-export main types
pub use item_state::ItemState;
pub use staleness::{admit_for_fetch, Admission, StalenessPolicy, StalenessRecord};
