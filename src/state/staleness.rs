//! Staleness-driven re-fetch admission
//!
//! Decides, per item and per run, whether a fetch is worth making. Items
//! synced recently are left alone; older items are first marked stale and
//! only re-fetched once the stale mark itself has aged past a cooldown,
//! which spreads refresh load over several runs.

use super::ItemState;
use chrono::{DateTime, Duration, Utc};

/// What the store remembers about one item's sync history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessRecord {
    pub identifier: String,
    pub last_synced_at: DateTime<Utc>,
    pub is_marked_stale: bool,
    pub stale_marked_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
}

/// Admission windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub freshness_window: Duration,
    pub stale_cooldown: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            freshness_window: Duration::minutes(30),
            stale_cooldown: Duration::minutes(60),
        }
    }
}

/// The admission decision for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether the item should be fetched this run
    pub admit: bool,

    /// The state the item was found in
    pub state: ItemState,

    /// Human-readable explanation
    pub reason: &'static str,

    /// Whether the caller should persist a fresh stale mark
    pub mark_stale: bool,
}

impl Admission {
    fn new(state: ItemState, reason: &'static str) -> Self {
        Self {
            admit: state.is_admitted(),
            state,
            reason,
            mark_stale: false,
        }
    }
}

/// Decides whether an item should be fetched now
///
/// # Arguments
///
/// * `record` - The item's staleness record, or `None` if never synced
/// * `now` - The current time
/// * `policy` - Freshness window and stale cooldown
///
/// # Returns
///
/// The admission decision. When `mark_stale` is set the caller persists
/// `is_marked_stale = true, stale_marked_at = now`.
pub fn admit_for_fetch(
    record: Option<&StalenessRecord>,
    now: DateTime<Utc>,
    policy: &StalenessPolicy,
) -> Admission {
    let Some(record) = record else {
        return Admission::new(ItemState::Unseen, "never synced");
    };

    if record.terminal_at.is_some_and(|terminal| terminal < now) {
        return Admission::new(ItemState::Closed, "terminal time has passed");
    }

    if now - record.last_synced_at < policy.freshness_window {
        return Admission::new(ItemState::Fresh, "synced within freshness window");
    }

    if !record.is_marked_stale {
        return Admission {
            mark_stale: true,
            ..Admission::new(ItemState::Stale, "aged past freshness window; marking stale")
        };
    }

    match record.stale_marked_at {
        Some(marked_at) if now - marked_at < policy.stale_cooldown => {
            Admission::new(ItemState::Stale, "stale mark within cooldown")
        }
        Some(_) => Admission::new(ItemState::Rescrapable, "stale mark past cooldown"),
        None => Admission::new(ItemState::Rescrapable, "stale without mark time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(synced_minutes_ago: i64) -> StalenessRecord {
        StalenessRecord {
            identifier: "1001-5-LE24".to_string(),
            last_synced_at: now() - Duration::minutes(synced_minutes_ago),
            is_marked_stale: false,
            stale_marked_at: None,
            terminal_at: None,
        }
    }

    #[test]
    fn test_unseen_is_admitted() {
        let decision = admit_for_fetch(None, now(), &StalenessPolicy::default());
        assert!(decision.admit);
        assert_eq!(decision.state, ItemState::Unseen);
        assert!(!decision.mark_stale);
    }

    #[test]
    fn test_fresh_is_skipped() {
        let decision = admit_for_fetch(Some(&record(10)), now(), &StalenessPolicy::default());
        assert!(!decision.admit);
        assert_eq!(decision.state, ItemState::Fresh);
        assert!(!decision.mark_stale);
    }

    #[test]
    fn test_aged_unmarked_is_marked_not_admitted() {
        let decision = admit_for_fetch(Some(&record(45)), now(), &StalenessPolicy::default());
        assert!(!decision.admit);
        assert_eq!(decision.state, ItemState::Stale);
        assert!(decision.mark_stale);
    }

    #[test]
    fn test_stale_within_cooldown_is_skipped() {
        let record = StalenessRecord {
            is_marked_stale: true,
            stale_marked_at: Some(now() - Duration::minutes(20)),
            ..record(120)
        };
        let decision = admit_for_fetch(Some(&record), now(), &StalenessPolicy::default());
        assert!(!decision.admit);
        assert_eq!(decision.state, ItemState::Stale);
        assert!(!decision.mark_stale);
    }

    #[test]
    fn test_stale_past_cooldown_is_admitted() {
        let record = StalenessRecord {
            is_marked_stale: true,
            stale_marked_at: Some(now() - Duration::minutes(61)),
            ..record(120)
        };
        let decision = admit_for_fetch(Some(&record), now(), &StalenessPolicy::default());
        assert!(decision.admit);
        assert_eq!(decision.state, ItemState::Rescrapable);
    }

    #[test]
    fn test_stale_without_mark_time_is_admitted() {
        let record = StalenessRecord {
            is_marked_stale: true,
            stale_marked_at: None,
            ..record(120)
        };
        let decision = admit_for_fetch(Some(&record), now(), &StalenessPolicy::default());
        assert!(decision.admit);
        assert_eq!(decision.state, ItemState::Rescrapable);
    }

    #[test]
    fn test_closed_is_never_admitted() {
        let closed = StalenessRecord {
            terminal_at: Some(now() - Duration::minutes(1)),
            is_marked_stale: true,
            stale_marked_at: Some(now() - Duration::days(3)),
            ..record(5_000)
        };
        let decision = admit_for_fetch(Some(&closed), now(), &StalenessPolicy::default());
        assert!(!decision.admit);
        assert_eq!(decision.state, ItemState::Closed);
        assert!(!decision.mark_stale);
    }

    #[test]
    fn test_future_terminal_time_does_not_close() {
        let open = StalenessRecord {
            terminal_at: Some(now() + Duration::days(2)),
            ..record(10)
        };
        let decision = admit_for_fetch(Some(&open), now(), &StalenessPolicy::default());
        assert_eq!(decision.state, ItemState::Fresh);
    }

    #[test]
    fn test_full_cycle_two_runs() {
        let policy = StalenessPolicy::default();

        // First run: aged record gets marked
        let mut rec = record(45);
        let first = admit_for_fetch(Some(&rec), now(), &policy);
        assert!(first.mark_stale);
        rec.is_marked_stale = true;
        rec.stale_marked_at = Some(now());

        // Half an hour later: still cooling down
        let later = now() + Duration::minutes(30);
        assert!(!admit_for_fetch(Some(&rec), later, &policy).admit);

        // Past the cooldown: admitted
        let much_later = now() + Duration::minutes(60);
        let decision = admit_for_fetch(Some(&rec), much_later, &policy);
        assert!(decision.admit);
        assert_eq!(decision.state, ItemState::Rescrapable);
    }
}
