use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    remote::{
        describe_session, spawn_publisher, PatchOptions, PrincipalProfile, PublishCommand,
        PublisherHandle, RemotePublisher, SharedRemoteStore,
    },
    settings::TimerSettings,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

use super::{
    focus_minutes, Clock, LocalSnapshotStore, Phase, Session, SessionContext, TimerMode,
    Transition,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub context: SessionContext,
    pub mode: TimerMode,
    pub phase: Phase,
    pub display_seconds: u64,
    pub total_focus_seconds: u64,
    pub counts_down: bool,
}

impl TimerSnapshot {
    fn of(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            context: session.context.clone(),
            mode: session.mode,
            phase: session.phase,
            display_seconds: session.display_seconds(now),
            total_focus_seconds: session.current_total_focus(now),
            counts_down: session.counts_down(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AlarmKind {
    FocusBlockFinished,
    RestFinished,
}

/// Notifications for the rendering and audio collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimerEvent {
    StateChanged {
        snapshot: TimerSnapshot,
    },
    Tick {
        snapshot: TimerSnapshot,
    },
    /// Looping ambient audio should stop and the alarm should sound.
    Alarm {
        kind: AlarmKind,
    },
    SessionCompleted {
        context_id: String,
        total_focus_seconds: u64,
        minutes: u32,
    },
    Cancelled {
        context_id: String,
    },
}

struct SessionLoops {
    cancel_token: CancellationToken,
    ticker: JoinHandle<()>,
    publisher: Option<PublisherHandle>,
}

/// Clones of what a tick touches. The ticker task owns one of these rather
/// than the controller, so dropping the controller still stops the loop.
struct TickContext {
    state: Arc<Mutex<Option<Session>>>,
    store: LocalSnapshotStore,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<TimerEvent>,
    profile: PrincipalProfile,
    remote_tx: Option<mpsc::UnboundedSender<PublishCommand>>,
}

impl TickContext {
    fn queue(&self, command: PublishCommand) {
        if let Some(tx) = &self.remote_tx {
            if tx.send(command).is_err() {
                log_warn!("remote publisher stopped; dropping update");
            }
        }
    }

    /// With `wait_for_save` false the local write is only queued; it still
    /// lands before any later stop, cancel or restore touches the record.
    async fn tick(&self, wait_for_save: bool) -> Option<Transition> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let session = guard.as_mut()?;

        let transition = session.tick(now);
        if wait_for_save {
            match self.store.save(session, now).await {
                Ok(true) => {}
                Ok(false) => log_info!("local snapshot write suppressed while finishing"),
                Err(err) => log_error!("failed to persist local snapshot: {err:#}"),
            }
        } else if let Err(err) = self.store.save_in_background(session, now) {
            log_error!("failed to queue local snapshot: {err:#}");
        }

        let snapshot = TimerSnapshot::of(session, now);
        if let Some(transition) = transition {
            self.queue(PublishCommand::Patch(
                describe_session(&self.profile, session, now),
                PatchOptions::STATE_CHANGE,
            ));
            let _ = self.events.send(TimerEvent::StateChanged {
                snapshot: snapshot.clone(),
            });

            let alarm = match transition {
                Transition::FocusBlockFinished => Some(AlarmKind::FocusBlockFinished),
                Transition::RestFinished => Some(AlarmKind::RestFinished),
                Transition::FocusStarted => None,
            };
            if let Some(kind) = alarm {
                log_info!("{} reached its boundary", session.context.label);
                let _ = self.events.send(TimerEvent::Alarm { kind });
            }
        }
        let _ = self.events.send(TimerEvent::Tick { snapshot });

        transition
    }

    async fn heartbeat(&self) {
        let guard = self.state.lock().await;
        if let Some(session) = guard.as_ref() {
            self.queue(PublishCommand::Patch(
                describe_session(&self.profile, session, self.clock.now()),
                PatchOptions::HEARTBEAT,
            ));
        }
    }
}

/// Owns the active study session and drives it: user actions, the
/// one-second tick, local persistence and remote publishing.
#[derive(Clone)]
pub struct TimerController {
    state: Arc<Mutex<Option<Session>>>,
    store: LocalSnapshotStore,
    remote: Option<RemotePublisher>,
    profile: PrincipalProfile,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<TimerEvent>,
    loops: Arc<Mutex<Option<SessionLoops>>>,
    tick_interval: Duration,
    debug_mode: bool,
    root_token: CancellationToken,
    _shutdown: Arc<DropGuard>,
}

impl TimerController {
    pub fn new(
        store: LocalSnapshotStore,
        profile: PrincipalProfile,
        clock: Arc<dyn Clock>,
        remote: Option<SharedRemoteStore>,
    ) -> Self {
        let debug_mode = std::env::var("STUDYCLOCK_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let root_token = CancellationToken::new();
        let shutdown = root_token.clone().drop_guard();

        Self {
            state: Arc::new(Mutex::new(None)),
            store,
            remote: remote.map(RemotePublisher::new),
            profile,
            clock,
            events,
            loops: Arc::new(Mutex::new(None)),
            tick_interval: Duration::from_secs(1),
            debug_mode,
            root_token,
            _shutdown: Arc::new(shutdown),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Option<TimerSnapshot> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|session| TimerSnapshot::of(session, self.clock.now()))
    }

    pub async fn start(
        &self,
        context: SessionContext,
        mode: TimerMode,
        settings: &TimerSettings,
    ) -> Result<TimerSnapshot> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            bail!("a study session is already active");
        }

        let now = self.clock.now();
        let session = Session::start(
            context,
            mode,
            settings.durations(),
            u64::from(settings.prepare_seconds),
            now,
        );
        if let Err(err) = self.store.begin(&session, now).await {
            log_error!("failed to persist new session: {err:#}");
        }

        let snapshot = TimerSnapshot::of(&session, now);
        let upsert = describe_session(&self.profile, &session, now);
        log_info!(
            "started {} session '{}'",
            session.mode.as_str(),
            session.context.label
        );
        *guard = Some(session);
        drop(guard);

        self.spawn_loops(settings).await;
        self.queue(PublishCommand::Upsert(upsert)).await;
        self.emit_state_changed(snapshot.clone());
        Ok(snapshot)
    }

    /// Brings back a session left behind by an earlier process. It always
    /// comes back paused; only an explicit resume accrues time again.
    pub async fn restore(
        &self,
        context_id: Option<&str>,
        settings: &TimerSettings,
    ) -> Option<TimerSnapshot> {
        let mut guard = self.state.lock().await;
        let now = self.clock.now();
        if let Some(session) = guard.as_ref() {
            return Some(TimerSnapshot::of(session, now));
        }

        let restored = match context_id {
            Some(id) => self.store.restore(id, now).await,
            None => self.store.restore_any(now).await,
        };
        let session = restored?;

        // Re-save as paused so a second restart cannot credit the gap twice.
        self.persist(&session, now).await;
        let snapshot = TimerSnapshot::of(&session, now);
        let upsert = describe_session(&self.profile, &session, now);
        log_info!(
            "restored session '{}' with {}s of focus",
            session.context.label,
            session.total_focus_seconds
        );
        *guard = Some(session);
        drop(guard);

        self.spawn_loops(settings).await;
        self.queue(PublishCommand::Upsert(upsert)).await;
        self.emit_state_changed(snapshot.clone());
        Some(snapshot)
    }

    pub async fn pause(&self) -> Result<TimerSnapshot> {
        self.transition("pause", |session, now| Ok(session.pause(now)))
            .await
    }

    pub async fn resume(&self) -> Result<TimerSnapshot> {
        self.transition("resume", |session, now| Ok(session.resume(now)))
            .await
    }

    pub async fn skip_to_rest(&self) -> Result<TimerSnapshot> {
        self.transition("start rest", |session, now| {
            session.skip_to_rest(now).map(|_| true)
        })
        .await
    }

    pub async fn repeat_cycle(&self) -> Result<TimerSnapshot> {
        self.transition("repeat", |session, now| {
            session.repeat_cycle(now).map(|_| true)
        })
        .await
    }

    pub async fn back_to_study(&self) -> Result<TimerSnapshot> {
        self.transition("go back to study", |session, now| {
            session.back_to_study(now).map(|_| true)
        })
        .await
    }

    /// Ends the session and returns its focus time in whole minutes (at
    /// least one).
    pub async fn stop(&self) -> Result<u32> {
        let mut session = self
            .state
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("no active session to stop"))?;

        let now = self.clock.now();
        let total = session.finish(now);
        if let Err(err) = self.store.mark_finishing(now).await {
            log_error!("failed to mark session finishing: {err:#}");
        }
        let minutes = focus_minutes(total);

        self.teardown().await;

        log_info!(
            "completed '{}' with {}s of focus ({} min)",
            session.context.label,
            total,
            minutes
        );
        let _ = self.events.send(TimerEvent::SessionCompleted {
            context_id: session.context.id,
            total_focus_seconds: total,
            minutes,
        });
        Ok(minutes)
    }

    /// Discards the session without committing anything. Safe to call when
    /// idle.
    pub async fn cancel(&self) -> Result<()> {
        let session = self.state.lock().await.take();
        self.teardown().await;

        if let Some(session) = session {
            log_info!("cancelled session '{}'", session.context.label);
            let _ = self.events.send(TimerEvent::Cancelled {
                context_id: session.context.id,
            });
        }
        Ok(())
    }

    /// Runs one tick immediately, outside the ticker's cadence, and waits
    /// for its local save.
    pub async fn process_tick(&self) -> Option<Transition> {
        let remote_tx = self.remote_sender().await;
        self.tick_context(remote_tx).tick(true).await
    }

    async fn transition<F>(&self, action: &str, op: F) -> Result<TimerSnapshot>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> Result<bool>,
    {
        let mut guard = self.state.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| anyhow!("no active session to {action}"))?;

        let now = self.clock.now();
        let changed = op(session, now)?;
        let snapshot = TimerSnapshot::of(session, now);
        if changed {
            self.persist(session, now).await;
            self.queue(PublishCommand::Patch(
                describe_session(&self.profile, session, now),
                PatchOptions::STATE_CHANGE,
            ))
            .await;
            self.emit_state_changed(snapshot.clone());
        }
        Ok(snapshot)
    }

    async fn persist(&self, session: &Session, now: DateTime<Utc>) {
        match self.store.save(session, now).await {
            Ok(true) => {}
            Ok(false) => log_warn!("local snapshot write suppressed while finishing"),
            Err(err) => log_error!("failed to persist local snapshot: {err:#}"),
        }
    }

    fn emit_state_changed(&self, snapshot: TimerSnapshot) {
        let _ = self.events.send(TimerEvent::StateChanged { snapshot });
    }

    async fn queue(&self, command: PublishCommand) {
        let loops = self.loops.lock().await;
        if let Some(publisher) = loops.as_ref().and_then(|l| l.publisher.as_ref()) {
            publisher.send(command);
        }
    }

    async fn remote_sender(&self) -> Option<mpsc::UnboundedSender<PublishCommand>> {
        let loops = self.loops.lock().await;
        loops
            .as_ref()
            .and_then(|l| l.publisher.as_ref())
            .map(PublisherHandle::sender)
    }

    fn tick_context(&self, remote_tx: Option<mpsc::UnboundedSender<PublishCommand>>) -> TickContext {
        TickContext {
            state: self.state.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            profile: self.profile.clone(),
            remote_tx,
        }
    }

    async fn spawn_loops(&self, settings: &TimerSettings) {
        let publisher = self.remote.clone().map(spawn_publisher);
        let ctx = self.tick_context(publisher.as_ref().map(PublisherHandle::sender));
        let cancel_token = self.root_token.child_token();

        let tick_interval = self.tick_interval;
        let heartbeat_interval = if self.debug_mode {
            tick_interval
        } else {
            settings.heartbeat_interval()
        };
        let token = cancel_token.clone();

        let ticker = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = time::interval_at(started + tick_interval, tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut heartbeat = time::interval_at(started + heartbeat_interval, heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    // Queued save: a slow disk must not stretch the cadence.
                    _ = ticker.tick() => {
                        ctx.tick(false).await;
                    }
                    _ = heartbeat.tick() => {
                        ctx.heartbeat().await;
                    }
                    _ = token.cancelled() => {
                        log_info!("timer loop shutting down");
                        break;
                    }
                }
            }
        });

        let previous = self.loops.lock().await.replace(SessionLoops {
            cancel_token,
            ticker,
            publisher,
        });
        if let Some(previous) = previous {
            previous.cancel_token.cancel();
        }
    }

    /// Stops the loops, releases the remote record and clears local state.
    /// Loop handles are taken out first, so a second call has nothing left
    /// to tear down remotely.
    async fn teardown(&self) {
        let loops = self.loops.lock().await.take();
        if let Some(loops) = loops {
            loops.cancel_token.cancel();
            if let Err(err) = loops.ticker.await {
                log_warn!("timer loop failed to join: {err}");
            }
            if let Some(publisher) = loops.publisher {
                publisher
                    .finish(Some(self.profile.principal_id.clone()))
                    .await;
            }
        }

        if let Err(err) = self.store.clear().await {
            log_error!("failed to clear local snapshot: {err:#}");
        }
    }
}
