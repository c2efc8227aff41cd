use chrono::{DateTime, Utc};

use crate::timer::accumulator::running_delta;

use super::RemoteSnapshot;

/// Anchor for extrapolation: the store's timestamp when present, otherwise
/// the instant the observer received the record (sampled once by the caller).
pub fn anchor_time(remote: &RemoteSnapshot, received_at: DateTime<Utc>) -> DateTime<Utc> {
    remote.snapshot_at.unwrap_or(received_at)
}

/// Live display value of a remote session at `observer_now`.
pub fn live_seconds(
    remote: &RemoteSnapshot,
    anchor: DateTime<Utc>,
    observer_now: DateTime<Utc>,
) -> u64 {
    if remote.is_paused {
        return remote.display_seconds_snapshot;
    }
    let delta = running_delta(anchor, observer_now, None);
    if remote.counts_down() {
        remote.display_seconds_snapshot.saturating_sub(delta)
    } else {
        remote.display_seconds_snapshot.saturating_add(delta)
    }
}
