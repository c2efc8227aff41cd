//! Wall-clock arithmetic for running segments.
//!
//! A running segment is described by the instant it began (its anchor). The
//! committed part of a block lives in a base counter; the in-flight part is
//! always derived from `now - anchor` and never stored.

use chrono::{DateTime, Utc};

/// Whole seconds elapsed since `anchor`, optionally capped at `bounded_remaining`.
///
/// A clock that moved backwards yields 0, never a negative delta.
pub fn running_delta(
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
    bounded_remaining: Option<u64>,
) -> u64 {
    let elapsed_ms = now.signed_duration_since(anchor).num_milliseconds().max(0);
    let delta = (elapsed_ms / 1000) as u64;
    match bounded_remaining {
        Some(limit) => delta.min(limit),
        None => delta,
    }
}

/// Folds the running delta into `base`. Without an anchor this is a no-op, so
/// pause and stop can commit unconditionally without double counting.
pub fn commit(
    base: u64,
    anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    bounded_remaining: Option<u64>,
) -> u64 {
    match anchor {
        Some(anchor) => base.saturating_add(running_delta(anchor, now, bounded_remaining)),
        None => base,
    }
}

/// Remaining budget of a bounded block whose committed part is `base`.
pub fn remaining(duration: u64, base: u64) -> u64 {
    duration.saturating_sub(base)
}
