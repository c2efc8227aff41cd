use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::timer::{Clock, SystemClock};

use super::{PatchOutcome, RemoteEvent, RemotePatch, RemoteSnapshot, RemoteStore, RemoteUpsert};

const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-process shared store. Server timestamps come from the store's own
/// clock, never from the writer.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    records: Arc<RwLock<HashMap<String, RemoteSnapshot>>>,
    events: broadcast::Sender<RemoteEvent>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("records", &self.records)
            .field("subscriber_count", &self.events.receiver_count())
            .finish()
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            events,
            clock,
        }
    }

    /// Drops a record the way an external TTL would: silently, with a delete
    /// event for watchers.
    pub async fn evict(&self, principal_id: &str) -> bool {
        let removed = self.records.write().await.remove(principal_id).is_some();
        if removed {
            let _ = self.events.send(RemoteEvent::Deleted {
                principal_id: principal_id.to_string(),
                deleted_at: self.clock.now(),
            });
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upsert(&self, write: RemoteUpsert) -> Result<()> {
        let now = self.clock.now();
        let record = RemoteSnapshot {
            principal_id: write.profile.principal_id.clone(),
            display_name: write.profile.display_name,
            avatar_ref: write.profile.avatar_ref,
            session_context_id: write.session_context_id,
            session_label: write.session_label,
            topic: write.topic,
            timer_type: write.flags.timer_type,
            mode: write.flags.mode,
            phase: write.flags.phase,
            is_paused: write.flags.is_paused,
            is_resting: write.flags.is_resting,
            display_seconds_snapshot: write.display_seconds_snapshot,
            snapshot_at: Some(now),
            updated_at: now,
            heartbeat_at: now,
            running_since: write.flags.running_since,
        };

        self.records
            .write()
            .await
            .insert(write.profile.principal_id, record.clone());
        let _ = self.events.send(RemoteEvent::Upserted { record });
        Ok(())
    }

    async fn patch(&self, principal_id: &str, patch: RemotePatch) -> Result<PatchOutcome> {
        let now = self.clock.now();
        let record = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(principal_id) else {
                return Ok(PatchOutcome::Missing);
            };

            if let Some(flags) = patch.flags {
                record.timer_type = flags.timer_type;
                record.mode = flags.mode;
                record.phase = flags.phase;
                record.is_paused = flags.is_paused;
                record.is_resting = flags.is_resting;
                record.running_since = flags.running_since;
            }
            if let Some(seconds) = patch.display_seconds_snapshot {
                record.display_seconds_snapshot = seconds;
                record.snapshot_at = Some(now);
            }
            if patch.touch_heartbeat {
                record.heartbeat_at = now;
            }
            record.updated_at = now;
            record.clone()
        };

        let _ = self.events.send(RemoteEvent::Upserted { record });
        Ok(PatchOutcome::Applied)
    }

    async fn delete(&self, principal_id: &str) -> Result<()> {
        self.evict(principal_id).await;
        Ok(())
    }

    async fn get(&self, principal_id: &str) -> Result<Option<RemoteSnapshot>> {
        Ok(self.records.read().await.get(principal_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RemoteSnapshot>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }
}
