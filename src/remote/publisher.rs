use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::timer::Session;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

use super::{
    PatchOutcome, PrincipalProfile, RemotePatch, RemoteUpsert, SessionFlags, SharedRemoteStore,
    TimerType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    pub include_snapshot: bool,
    pub touch_heartbeat: bool,
}

impl PatchOptions {
    pub const STATE_CHANGE: Self = Self {
        include_snapshot: true,
        touch_heartbeat: false,
    };
    pub const HEARTBEAT: Self = Self {
        include_snapshot: false,
        touch_heartbeat: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Upserted,
    Patched,
    Released,
    Failed,
}

/// Builds the full remote view of `session` as of `now`.
pub fn describe_session(
    profile: &PrincipalProfile,
    session: &Session,
    now: DateTime<Utc>,
) -> RemoteUpsert {
    let timer_type = if session.counts_down() {
        TimerType::Countdown
    } else {
        TimerType::Stopwatch
    };

    RemoteUpsert {
        profile: profile.clone(),
        session_context_id: session.context.id.clone(),
        session_label: session.context.label.clone(),
        topic: session.context.topic.clone(),
        flags: SessionFlags {
            timer_type,
            mode: session.mode,
            phase: session.phase.as_str().to_string(),
            is_paused: session.is_paused(),
            is_resting: session.is_resting(),
            running_since: session.segment_start_anchor,
        },
        display_seconds_snapshot: session.display_seconds(now),
    }
}

/// Writes session visibility to the shared store. Every failure is logged
/// and swallowed: the local timer never depends on the remote side.
#[derive(Clone)]
pub struct RemotePublisher {
    store: SharedRemoteStore,
}

impl RemotePublisher {
    pub fn new(store: SharedRemoteStore) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, write: &RemoteUpsert) -> PublishOutcome {
        match self.store.upsert(write.clone()).await {
            Ok(()) => PublishOutcome::Upserted,
            Err(err) => {
                log_warn!(
                    "remote upsert failed for {}: {err:#}",
                    write.profile.principal_id
                );
                PublishOutcome::Failed
            }
        }
    }

    /// Partial merge. A missing record (e.g. evicted by TTL) or a failed
    /// patch falls back to exactly one full upsert.
    pub async fn patch(&self, write: &RemoteUpsert, options: PatchOptions) -> PublishOutcome {
        let patch = RemotePatch {
            flags: options.include_snapshot.then(|| write.flags.clone()),
            display_seconds_snapshot: options
                .include_snapshot
                .then_some(write.display_seconds_snapshot),
            touch_heartbeat: options.touch_heartbeat,
        };

        match self.store.patch(&write.profile.principal_id, patch).await {
            Ok(PatchOutcome::Applied) => PublishOutcome::Patched,
            Ok(PatchOutcome::Missing) => {
                log_info!(
                    "remote record for {} missing, re-creating",
                    write.profile.principal_id
                );
                self.upsert(write).await
            }
            Err(err) => {
                log_warn!(
                    "remote patch failed for {}: {err:#}; retrying as upsert",
                    write.profile.principal_id
                );
                self.upsert(write).await
            }
        }
    }

    pub async fn release(&self, principal_id: &str) -> PublishOutcome {
        match self.store.delete(principal_id).await {
            Ok(()) => PublishOutcome::Released,
            Err(err) => {
                log_warn!("remote delete failed for {principal_id}: {err:#}");
                PublishOutcome::Failed
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PublishCommand {
    Upsert(RemoteUpsert),
    Patch(RemoteUpsert, PatchOptions),
    Release(String),
}

/// Fire-and-forget queue in front of a [`RemotePublisher`]. Commands are
/// applied strictly in order, so a release is never overtaken by an older
/// write.
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<PublishCommand>,
    worker: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<PublishCommand> {
        self.tx.clone()
    }

    pub fn send(&self, command: PublishCommand) {
        if self.tx.send(command).is_err() {
            log_warn!("remote publisher already stopped; dropping command");
        }
    }

    /// Queues an optional final release, then waits for the queue to drain.
    /// Other senders must be dropped first or this waits for them too.
    pub async fn finish(self, release: Option<String>) {
        if let Some(principal_id) = release {
            self.send(PublishCommand::Release(principal_id));
        }
        drop(self.tx);
        if let Err(err) = self.worker.await {
            log_warn!("remote publisher task failed to join: {err}");
        }
    }
}

pub fn spawn_publisher(publisher: RemotePublisher) -> PublisherHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<PublishCommand>();
    let worker = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                PublishCommand::Upsert(write) => {
                    publisher.upsert(&write).await;
                }
                PublishCommand::Patch(write, options) => {
                    publisher.patch(&write, options).await;
                }
                PublishCommand::Release(principal_id) => {
                    publisher.release(&principal_id).await;
                }
            }
        }
    });
    PublisherHandle { tx, worker }
}
