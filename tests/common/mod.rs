#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use studyclock_lib::db::Database;
use studyclock_lib::remote::{MemoryRemoteStore, PrincipalProfile, RemoteSnapshot, RemoteStore};
use studyclock_lib::settings::TimerSettings;
use studyclock_lib::timer::{LocalSnapshotStore, ManualClock, TimerController, TimerEvent};
use tokio::sync::broadcast;

pub const PRINCIPAL: &str = "ana";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 10, 18, 0, 0).unwrap()
}

pub fn settings() -> TimerSettings {
    TimerSettings {
        pomodoro_minutes: 25,
        rest_minutes: 5,
        prepare_seconds: 0,
        heartbeat_seconds: 30,
    }
}

pub fn profile() -> PrincipalProfile {
    PrincipalProfile {
        principal_id: PRINCIPAL.into(),
        display_name: "Ana".into(),
        avatar_ref: None,
    }
}

/// Controller on the default one-second cadence.
pub fn live_controller(
    db: &Database,
    clock: &ManualClock,
    remote: Arc<MemoryRemoteStore>,
) -> TimerController {
    TimerController::new(
        LocalSnapshotStore::new(db.clone(), PRINCIPAL),
        profile(),
        Arc::new(clock.clone()),
        Some(remote as Arc<dyn RemoteStore>),
    )
}

/// Controller whose background ticker never fires during a test; ticks are
/// driven with `process_tick`.
pub fn controller(
    db: &Database,
    clock: &ManualClock,
    remote: Option<Arc<MemoryRemoteStore>>,
) -> TimerController {
    TimerController::new(
        LocalSnapshotStore::new(db.clone(), PRINCIPAL),
        profile(),
        Arc::new(clock.clone()),
        remote.map(|store| store as Arc<dyn RemoteStore>),
    )
    .with_tick_interval(Duration::from_secs(3600))
}

pub fn drain(events: &mut broadcast::Receiver<TimerEvent>) -> Vec<TimerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Polls until the remote record satisfies `accept`; publishing is
/// asynchronous.
pub async fn wait_for_remote(
    store: &MemoryRemoteStore,
    accept: impl Fn(Option<&RemoteSnapshot>) -> bool,
) -> Option<RemoteSnapshot> {
    for _ in 0..200 {
        let record = store.get(PRINCIPAL).await.unwrap();
        if accept(record.as_ref()) {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("remote record never reached the expected state");
}
