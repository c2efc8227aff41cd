//! Shared store contract for live session visibility.
//!
//! A remote record is a value plus an anchor: `display_seconds_snapshot` is
//! the timer value as of the store-assigned `snapshot_at`. Observers
//! extrapolate from that pair locally instead of receiving a push per second.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::timer::TimerMode;

mod memory;
mod observer;
mod publisher;
mod reconstruct;

pub use memory::MemoryRemoteStore;
pub use observer::{spawn_observer, LiveSession, ObserverOptions, RemoteObserver};
pub use publisher::{
    describe_session, spawn_publisher, PatchOptions, PublishCommand, PublishOutcome,
    PublisherHandle, RemotePublisher,
};
pub use reconstruct::{anchor_time, live_seconds};

/// How the published value moves between snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerType {
    Countdown,
    Stopwatch,
}

/// Who is studying. One remote record exists per principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalProfile {
    pub principal_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionFlags {
    pub timer_type: TimerType,
    pub mode: TimerMode,
    pub phase: String,
    pub is_paused: bool,
    pub is_resting: bool,
    pub running_since: Option<DateTime<Utc>>,
}

/// Full record contents supplied by a publisher. Timestamps are not part of
/// it: the store assigns those.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUpsert {
    pub profile: PrincipalProfile,
    pub session_context_id: String,
    pub session_label: String,
    pub topic: Option<String>,
    pub flags: SessionFlags,
    pub display_seconds_snapshot: u64,
}

/// Partial merge. `display_seconds_snapshot` set means a fresh snapshot and
/// a new `snapshot_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePatch {
    pub flags: Option<SessionFlags>,
    pub display_seconds_snapshot: Option<u64>,
    pub touch_heartbeat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub principal_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub session_context_id: String,
    pub session_label: String,
    pub topic: Option<String>,
    pub timer_type: TimerType,
    pub mode: TimerMode,
    pub phase: String,
    pub is_paused: bool,
    pub is_resting: bool,
    pub display_seconds_snapshot: u64,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub running_since: Option<DateTime<Utc>>,
}

impl RemoteSnapshot {
    pub fn counts_down(&self) -> bool {
        self.timer_type == TimerType::Countdown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RemoteEvent {
    Upserted {
        record: RemoteSnapshot,
    },
    Deleted {
        principal_id: String,
        deleted_at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(&self, write: RemoteUpsert) -> Result<()>;
    async fn patch(&self, principal_id: &str, patch: RemotePatch) -> Result<PatchOutcome>;
    async fn delete(&self, principal_id: &str) -> Result<()>;
    async fn get(&self, principal_id: &str) -> Result<Option<RemoteSnapshot>>;
    async fn list(&self) -> Result<Vec<RemoteSnapshot>>;
    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent>;
}

pub type SharedRemoteStore = Arc<dyn RemoteStore>;
