/// Item lifecycle states used by re-fetch admission
///
/// `Unseen → Fresh → Stale → Rescrapable → Fresh`, with `Closed` absorbing.
use std::fmt;

/// Where an item stands with respect to re-fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// No record yet; the item has never been synced
    Unseen,

    /// Synced within the freshness window
    Fresh,

    /// Older than the freshness window, waiting out the cooldown
    Stale,

    /// Stale for longer than the cooldown; due for a re-fetch
    Rescrapable,

    /// The item's terminal time has passed; it is never fetched again
    Closed,
}

impl ItemState {
    /// Returns true if an item in this state should be fetched
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Unseen | Self::Rescrapable)
    }

    /// Returns true if the state can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unseen => "unseen",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Rescrapable => "rescrapable",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
