//! Durable local record of the running session.
//!
//! The record stores elapsed bases, never a frozen remaining time, so a
//! restore can account for wall time that passed while the process was gone.
//! Restored sessions always come back paused.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Database;

use super::accumulator::{remaining, running_delta};
use super::state::{BlockDurations, Phase, Segment, Session, SessionContext, TimerMode};

pub const SNAPSHOT_SCHEMA_VERSION: u64 = 2;

/// Name of the single cumulative counter written by version 1 records.
const LEGACY_ELAPSED_FIELD: &str = "elapsedSeconds";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub schema_version: u64,
    pub session_context_id: String,
    #[serde(default)]
    pub session_label: String,
    #[serde(default)]
    pub topic: Option<String>,
    pub mode: TimerMode,
    pub pomodoro_duration: u64,
    pub rest_duration: u64,
    pub is_paused: bool,
    #[serde(default)]
    pub is_preparing: bool,
    #[serde(default)]
    pub is_resting: bool,
    #[serde(default)]
    pub pomodoro_block_finished: bool,
    #[serde(default)]
    pub rest_finished: bool,
    #[serde(default)]
    pub total_focus_seconds: u64,
    #[serde(default)]
    pub focus_block_elapsed_seconds: u64,
    #[serde(default)]
    pub rest_elapsed_seconds: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_finishing: bool,
}

impl LocalSnapshot {
    /// Captures the session with its in-flight segment folded in as of `now`.
    pub fn capture(session: &Session, now: DateTime<Utc>) -> Self {
        let in_flight = session.in_flight_seconds(now);
        let (focus_extra, rest_extra) = match session.phase {
            Phase::Running(Segment::Focus) => (in_flight, 0),
            Phase::Running(Segment::Rest) => (0, in_flight),
            _ => (0, 0),
        };

        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            session_context_id: session.context.id.clone(),
            session_label: session.context.label.clone(),
            topic: session.context.topic.clone(),
            mode: session.mode,
            pomodoro_duration: session.durations.pomodoro_seconds,
            rest_duration: session.durations.rest_seconds,
            is_paused: session.is_paused(),
            is_preparing: matches!(session.phase, Phase::Preparing { .. }),
            is_resting: session.is_resting(),
            pomodoro_block_finished: session.phase == Phase::PomodoroFinished,
            rest_finished: session.phase == Phase::RestFinished,
            total_focus_seconds: session.total_focus_seconds + focus_extra,
            focus_block_elapsed_seconds: session.focus_block_elapsed_base + focus_extra,
            rest_elapsed_seconds: session.rest_elapsed_base + rest_extra,
            last_timestamp: now,
            is_finishing: false,
        }
    }

    /// Parses a stored payload, upgrading older schema versions.
    pub fn decode(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload).context("snapshot is not valid JSON")?;
        let value = upgrade(value)?;
        serde_json::from_value(value).context("snapshot does not match current schema")
    }

    /// Rebuilds a paused session, crediting wall time that elapsed since the
    /// record was written if it was running at the time.
    pub fn into_session(self, now: DateTime<Utc>) -> Session {
        let durations = BlockDurations {
            pomodoro_seconds: self.pomodoro_duration,
            rest_seconds: self.rest_duration,
        };
        let mut total = self.total_focus_seconds;
        let mut block = self.focus_block_elapsed_seconds;
        let mut rest = self.rest_elapsed_seconds;
        if self.mode == TimerMode::Pomodoro {
            block = block.min(durations.pomodoro_seconds);
        }
        rest = rest.min(durations.rest_seconds);

        let phase = if self.rest_finished {
            Phase::RestFinished
        } else if self.pomodoro_block_finished {
            Phase::PomodoroFinished
        } else if self.is_resting {
            Phase::Paused(Segment::Rest)
        } else {
            Phase::Paused(Segment::Focus)
        };

        let was_running = !self.is_paused && !self.is_preparing;
        if was_running {
            match phase {
                Phase::Paused(Segment::Focus) => {
                    let bound = match self.mode {
                        TimerMode::Pomodoro => Some(remaining(durations.pomodoro_seconds, block)),
                        TimerMode::Free => None,
                    };
                    let gap = running_delta(self.last_timestamp, now, bound);
                    block += gap;
                    total += gap;
                }
                Phase::Paused(Segment::Rest) => {
                    let bound = remaining(durations.rest_seconds, rest);
                    rest += running_delta(self.last_timestamp, now, Some(bound));
                }
                _ => {}
            }
        }

        Session {
            context: SessionContext {
                id: self.session_context_id,
                label: self.session_label,
                topic: self.topic,
            },
            mode: self.mode,
            durations,
            phase,
            total_focus_seconds: total,
            focus_block_elapsed_base: block,
            rest_elapsed_base: rest,
            segment_start_anchor: None,
            started_at: now,
        }
    }
}

fn upgrade(mut value: Value) -> Result<Value> {
    let Some(object) = value.as_object_mut() else {
        bail!("snapshot is not a JSON object");
    };
    let version = object
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1);

    if version > SNAPSHOT_SCHEMA_VERSION {
        bail!("snapshot schema {version} is newer than supported {SNAPSHOT_SCHEMA_VERSION}");
    }

    if version < 2 {
        // v1 kept one cumulative counter; it seeds both the session total and
        // the current block.
        let legacy = object
            .remove(LEGACY_ELAPSED_FIELD)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        object
            .entry("totalFocusSeconds")
            .or_insert_with(|| Value::from(legacy));
        object
            .entry("focusBlockElapsedSeconds")
            .or_insert_with(|| Value::from(legacy));
        object.insert("schemaVersion".into(), Value::from(SNAPSHOT_SCHEMA_VERSION));
    }

    Ok(value)
}

/// Per-principal durable store for the local session.
#[derive(Clone)]
pub struct LocalSnapshotStore {
    db: Database,
    principal_id: String,
}

impl LocalSnapshotStore {
    pub fn new(db: Database, principal_id: impl Into<String>) -> Self {
        Self {
            db,
            principal_id: principal_id.into(),
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// First write of a new session; lifts any finishing guard left behind.
    pub async fn begin(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(&LocalSnapshot::capture(session, now))?;
        self.db
            .replace_snapshot(&self.principal_id, payload, now)
            .await
    }

    /// Returns `false` when the write was suppressed by the finishing guard.
    pub async fn save(&self, session: &Session, now: DateTime<Utc>) -> Result<bool> {
        let payload = serde_json::to_string(&LocalSnapshot::capture(session, now))?;
        self.db.write_snapshot(&self.principal_id, payload, now).await
    }

    /// Queues a save behind any pending database work and returns at once.
    pub fn save_in_background(&self, session: &Session, now: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(&LocalSnapshot::capture(session, now))?;
        self.db
            .queue_snapshot_write(&self.principal_id, payload, now)
    }

    pub async fn mark_finishing(&self, now: DateTime<Utc>) -> Result<()> {
        self.db.mark_snapshot_finishing(&self.principal_id, now).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.db.delete_snapshot(&self.principal_id).await
    }

    /// Looks for a resumable session for `context_id`. Anything unreadable,
    /// finishing, or belonging to another context counts as no prior session.
    pub async fn restore(&self, context_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let stored = match self.db.load_snapshot(&self.principal_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(err) => {
                warn!("Failed to read local snapshot for {}: {err:#}", self.principal_id);
                return None;
            }
        };

        if stored.is_finishing {
            info!("Ignoring finishing snapshot for {}", self.principal_id);
            return None;
        }

        let snapshot = match LocalSnapshot::decode(&stored.payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Discarding unreadable snapshot for {}: {err:#}", self.principal_id);
                return None;
            }
        };

        if snapshot.is_finishing || snapshot.session_context_id != context_id {
            return None;
        }

        Some(snapshot.into_session(now))
    }

    /// Like [`restore`](Self::restore) but takes whatever context was stored.
    pub async fn restore_any(&self, now: DateTime<Utc>) -> Option<Session> {
        let stored = self.db.load_snapshot(&self.principal_id).await.ok()??;
        if stored.is_finishing {
            return None;
        }
        let context_id = LocalSnapshot::decode(&stored.payload)
            .ok()?
            .session_context_id;
        self.restore(&context_id, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 20, 19, 30, 0).unwrap()
    }

    fn durations() -> BlockDurations {
        BlockDurations {
            pomodoro_seconds: 1500,
            rest_seconds: 300,
        }
    }

    #[test]
    fn test_legacy_counter_seeds_total_and_block() {
        let payload = format!(
            r#"{{"sessionContextId":"ctx","mode":"pomodoro","pomodoroDuration":1500,
                "restDuration":300,"isPaused":true,"elapsedSeconds":420,
                "lastTimestamp":{}}}"#,
            t0().timestamp_millis()
        );
        let snapshot = LocalSnapshot::decode(&payload).unwrap();
        assert_eq!(snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(snapshot.total_focus_seconds, 420);
        assert_eq!(snapshot.focus_block_elapsed_seconds, 420);

        let session = snapshot.into_session(t0() + Duration::seconds(60));
        assert_eq!(session.display_seconds(t0()), 1080);
    }

    #[test]
    fn test_future_schema_and_garbage_are_rejected() {
        assert!(LocalSnapshot::decode("not json").is_err());
        assert!(LocalSnapshot::decode("[1,2]").is_err());
        assert!(LocalSnapshot::decode(r#"{"schemaVersion":99}"#).is_err());
    }

    #[test]
    fn test_running_capture_restores_paused_with_gap_credited() {
        let mut session = Session::start(
            SessionContext::new("chem", None),
            TimerMode::Pomodoro,
            durations(),
            0,
            t0(),
        );
        session.pause(t0() + Duration::seconds(100));
        session.resume(t0() + Duration::seconds(200));

        let captured = LocalSnapshot::capture(&session, t0() + Duration::seconds(260));
        assert!(!captured.is_paused);
        assert_eq!(captured.total_focus_seconds, 160);

        let restored = captured.into_session(t0() + Duration::seconds(320));
        assert_eq!(restored.phase, Phase::Paused(Segment::Focus));
        assert_eq!(restored.segment_start_anchor, None);
        assert_eq!(restored.total_focus_seconds, 220);
        assert_eq!(restored.display_seconds(t0()), 1280);
    }

    #[test]
    fn test_restore_gap_is_clamped_to_block() {
        let session = Session::start(
            SessionContext::new("chem", None),
            TimerMode::Pomodoro,
            durations(),
            0,
            t0(),
        );
        let captured = LocalSnapshot::capture(&session, t0() + Duration::seconds(1000));
        let restored = captured.into_session(t0() + Duration::hours(8));
        assert_eq!(restored.focus_block_elapsed_base, 1500);
        assert_eq!(restored.total_focus_seconds, 1500);
        assert_eq!(restored.phase, Phase::Paused(Segment::Focus));
    }

    #[test]
    fn test_future_dated_record_adds_nothing() {
        let session = Session::start(
            SessionContext::new("bio", None),
            TimerMode::Free,
            durations(),
            0,
            t0(),
        );
        let captured = LocalSnapshot::capture(&session, t0() + Duration::seconds(50));
        let restored = captured.into_session(t0());
        assert_eq!(restored.total_focus_seconds, 50);
    }

    #[test]
    fn test_finished_flags_restore_finished_phases() {
        let mut session = Session::start(
            SessionContext::new("geo", None),
            TimerMode::Pomodoro,
            durations(),
            0,
            t0(),
        );
        session.tick(t0() + Duration::seconds(1500));
        let captured = LocalSnapshot::capture(&session, t0() + Duration::seconds(1501));
        assert!(captured.pomodoro_block_finished);
        let restored = captured.into_session(t0() + Duration::seconds(4000));
        assert_eq!(restored.phase, Phase::PomodoroFinished);
        assert_eq!(restored.total_focus_seconds, 1500);
    }

    #[tokio::test]
    async fn test_store_restore_matches_context_and_skips_finishing() {
        let store = LocalSnapshotStore::new(Database::in_memory().unwrap(), "ana");
        let session = Session::start(
            SessionContext::new("hist", None),
            TimerMode::Free,
            durations(),
            0,
            t0(),
        );
        store.begin(&session, t0()).await.unwrap();

        assert!(store.restore("other-context", t0()).await.is_none());
        let restored = store
            .restore(&session.context.id, t0() + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(restored.total_focus_seconds, 30);

        store.mark_finishing(t0()).await.unwrap();
        assert!(!store.save(&session, t0()).await.unwrap());
        assert!(store.restore(&session.context.id, t0()).await.is_none());
        assert!(store.restore_any(t0()).await.is_none());
    }
}
