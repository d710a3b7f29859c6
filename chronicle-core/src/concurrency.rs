//! Optimistic concurrency.
//!
//! Writers remember the version they loaded and present it when saving. A
//! store rejects the whole save if the stored version moved in the meantime;
//! callers reload and re-run the behavior. Nothing here retries on its own.

use thiserror::Error;

/// Error indicating a concurrency conflict during save.
///
/// Returned when another writer committed events to the same aggregate after
/// the caller loaded it. Version `0` means "no committed events".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.expected, .actual))]
pub struct ConcurrencyConflict {
    /// The version the caller loaded.
    pub expected: u64,
    /// The version currently stored.
    pub actual: u64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(expected: &u64, actual: &u64) -> String {
    if *expected == 0 {
        format!(
            "concurrency conflict: expected new aggregate, found version {actual} (hint: another \
             process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict: expected version {expected}, found {actual} (hint: aggregate \
             was modified; reload and retry)"
        )
    }
}
