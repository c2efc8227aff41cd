use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::timer::Clock;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

use super::reconstruct::{anchor_time, live_seconds};
use super::{RemoteEvent, RemoteSnapshot, SharedRemoteStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    pub principal_id: String,
    pub display_name: String,
    pub session_label: String,
    pub phase: String,
    pub seconds: u64,
    pub counts_down: bool,
    pub is_paused: bool,
    /// No heartbeat for longer than the staleness window.
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct ObservedSession {
    record: RemoteSnapshot,
    anchor: DateTime<Utc>,
}

/// Observer-side view of every remote session. Applies store events
/// last-write-wins by `updated_at`; duplicates and stale reorderings are
/// ignored.
#[derive(Debug, Default)]
pub struct RemoteObserver {
    sessions: HashMap<String, ObservedSession>,
    deleted: HashMap<String, DateTime<Utc>>,
}

impl RemoteObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the event changed what this observer displays.
    pub fn apply(&mut self, event: RemoteEvent, received_at: DateTime<Utc>) -> bool {
        match event {
            RemoteEvent::Upserted { record } => self.apply_upsert(record, received_at),
            RemoteEvent::Deleted {
                principal_id,
                deleted_at,
            } => {
                let newest = self
                    .deleted
                    .get(&principal_id)
                    .map_or(deleted_at, |seen| (*seen).max(deleted_at));
                self.deleted.insert(principal_id.clone(), newest);

                match self.sessions.get(&principal_id) {
                    Some(existing) if existing.record.updated_at <= deleted_at => {
                        self.sessions.remove(&principal_id);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn apply_upsert(&mut self, record: RemoteSnapshot, received_at: DateTime<Utc>) -> bool {
        if let Some(deleted_at) = self.deleted.get(&record.principal_id) {
            if record.updated_at <= *deleted_at {
                return false;
            }
        }

        let mut anchor = None;
        if let Some(existing) = self.sessions.get(&record.principal_id) {
            if record.updated_at < existing.record.updated_at || record == existing.record {
                return false;
            }
            // Heartbeats carry the same value; the first receipt stays the anchor.
            if same_value(&existing.record, &record) {
                anchor = Some(existing.anchor);
            }
        }

        self.deleted.remove(&record.principal_id);
        let anchor = anchor.unwrap_or_else(|| anchor_time(&record, received_at));
        self.sessions
            .insert(record.principal_id.clone(), ObservedSession { record, anchor });
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn live(&self, now: DateTime<Utc>, stale_after: ChronoDuration) -> Vec<LiveSession> {
        let mut live: Vec<LiveSession> = self
            .sessions
            .values()
            .map(|observed| {
                let record = &observed.record;
                LiveSession {
                    principal_id: record.principal_id.clone(),
                    display_name: record.display_name.clone(),
                    session_label: record.session_label.clone(),
                    phase: record.phase.clone(),
                    seconds: live_seconds(record, observed.anchor, now),
                    counts_down: record.counts_down(),
                    is_paused: record.is_paused,
                    stale: now.signed_duration_since(record.heartbeat_at) > stale_after,
                }
            })
            .collect();
        live.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.principal_id.cmp(&b.principal_id))
        });
        live
    }
}

fn same_value(a: &RemoteSnapshot, b: &RemoteSnapshot) -> bool {
    a.display_seconds_snapshot == b.display_seconds_snapshot
        && a.snapshot_at == b.snapshot_at
        && a.is_paused == b.is_paused
}

#[derive(Debug, Clone, Copy)]
pub struct ObserverOptions {
    pub refresh_interval: Duration,
    pub stale_after: ChronoDuration,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            stale_after: ChronoDuration::seconds(90),
        }
    }
}

/// Watches the store and recomputes live values on its own cadence,
/// independent of how often publishers write.
pub fn spawn_observer(
    store: SharedRemoteStore,
    clock: Arc<dyn Clock>,
    options: ObserverOptions,
    cancel_token: CancellationToken,
) -> (JoinHandle<()>, watch::Receiver<Vec<LiveSession>>) {
    let (live_tx, live_rx) = watch::channel(Vec::new());

    let handle = tokio::spawn(async move {
        let mut events = store.subscribe();
        let mut observer = RemoteObserver::new();
        seed(&mut observer, &store, clock.as_ref()).await;

        let mut ticker = tokio::time::interval(options.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = live_tx.send(observer.live(clock.now(), options.stale_after));
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        let now = clock.now();
                        if observer.apply(event, now) {
                            let _ = live_tx.send(observer.live(now, options.stale_after));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log_warn!("observer lagged by {skipped} events; reloading");
                        observer = RemoteObserver::new();
                        seed(&mut observer, &store, clock.as_ref()).await;
                    }
                    Err(RecvError::Closed) => {
                        log_info!("remote event stream closed");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => {
                    log_info!("observer loop shutting down");
                    break;
                }
            }
        }
    });

    (handle, live_rx)
}

async fn seed(observer: &mut RemoteObserver, store: &SharedRemoteStore, clock: &dyn Clock) {
    match store.list().await {
        Ok(records) => {
            let now = clock.now();
            for record in records {
                observer.apply(RemoteEvent::Upserted { record }, now);
            }
        }
        Err(err) => log_warn!("failed to list remote sessions: {err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TimerType;
    use crate::timer::TimerMode;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).unwrap()
    }

    fn record(principal: &str, seconds: u64, updated_secs: i64) -> RemoteSnapshot {
        let at = t0() + ChronoDuration::seconds(updated_secs);
        RemoteSnapshot {
            principal_id: principal.into(),
            display_name: principal.to_uppercase(),
            avatar_ref: None,
            session_context_id: "ctx".into(),
            session_label: "Latin".into(),
            topic: None,
            timer_type: TimerType::Countdown,
            mode: TimerMode::Pomodoro,
            phase: "running".into(),
            is_paused: false,
            is_resting: false,
            display_seconds_snapshot: seconds,
            snapshot_at: Some(at),
            updated_at: at,
            heartbeat_at: at,
            running_since: None,
        }
    }

    fn upsert(record: RemoteSnapshot) -> RemoteEvent {
        RemoteEvent::Upserted { record }
    }

    #[test]
    fn test_older_upsert_is_ignored() {
        let mut observer = RemoteObserver::new();
        assert!(observer.apply(upsert(record("ana", 600, 10)), t0()));
        assert!(!observer.apply(upsert(record("ana", 900, 5)), t0()));
        assert!(!observer.apply(upsert(record("ana", 600, 10)), t0()));

        let live = observer.live(t0() + ChronoDuration::seconds(57), ChronoDuration::seconds(90));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].seconds, 553);
    }

    #[test]
    fn test_delete_is_not_undone_by_late_upsert() {
        let mut observer = RemoteObserver::new();
        observer.apply(upsert(record("ana", 600, 10)), t0());
        assert!(observer.apply(
            RemoteEvent::Deleted {
                principal_id: "ana".into(),
                deleted_at: t0() + ChronoDuration::seconds(20),
            },
            t0(),
        ));
        assert!(!observer.apply(upsert(record("ana", 580, 15)), t0()));
        assert!(observer.is_empty());

        assert!(observer.apply(upsert(record("ana", 1500, 30)), t0()));
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn test_duplicate_without_server_time_keeps_first_receipt() {
        let mut observer = RemoteObserver::new();
        let mut first = record("ben", 300, 0);
        first.snapshot_at = None;
        observer.apply(upsert(first.clone()), t0());
        observer.apply(upsert(first), t0() + ChronoDuration::seconds(20));

        let live = observer.live(t0() + ChronoDuration::seconds(30), ChronoDuration::seconds(90));
        assert_eq!(live[0].seconds, 270);
    }

    #[test]
    fn test_heartbeat_without_server_time_keeps_anchor() {
        let mut observer = RemoteObserver::new();
        let mut first = record("ana", 600, 0);
        first.snapshot_at = None;
        observer.apply(upsert(first.clone()), t0());

        let mut heartbeat = first;
        heartbeat.updated_at = t0() + ChronoDuration::seconds(30);
        heartbeat.heartbeat_at = heartbeat.updated_at;
        assert!(observer.apply(upsert(heartbeat), t0() + ChronoDuration::seconds(30)));

        let live = observer.live(t0() + ChronoDuration::seconds(47), ChronoDuration::seconds(90));
        assert_eq!(live[0].seconds, 553);

        let mut paused = record("ana", 553, 47);
        paused.snapshot_at = None;
        paused.is_paused = true;
        observer.apply(upsert(paused), t0() + ChronoDuration::seconds(47));
        let live = observer.live(t0() + ChronoDuration::seconds(80), ChronoDuration::seconds(90));
        assert_eq!(live[0].seconds, 553);
    }

    #[test]
    fn test_tombstone_dropped_after_newer_upsert() {
        let mut observer = RemoteObserver::new();
        observer.apply(
            RemoteEvent::Deleted {
                principal_id: "ana".into(),
                deleted_at: t0(),
            },
            t0(),
        );
        assert_eq!(observer.deleted.len(), 1);

        assert!(observer.apply(upsert(record("ana", 600, 5)), t0()));
        assert!(observer.deleted.is_empty());
        // An upsert older than the live record is still rejected.
        assert!(!observer.apply(upsert(record("ana", 900, -5)), t0()));
    }

    #[test]
    fn test_missing_heartbeat_marks_stale() {
        let mut observer = RemoteObserver::new();
        observer.apply(upsert(record("ana", 600, 0)), t0());
        observer.apply(upsert(record("cid", 600, 100)), t0());

        let live = observer.live(t0() + ChronoDuration::seconds(120), ChronoDuration::seconds(90));
        assert_eq!(live[0].principal_id, "ana");
        assert!(live[0].stale);
        assert!(!live[1].stale);
    }
}
