use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::accumulator::{commit, remaining, running_delta};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    Pomodoro,
    Free,
}

impl Default for TimerMode {
    fn default() -> Self {
        TimerMode::Pomodoro
    }
}

impl TimerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerMode::Pomodoro => "pomodoro",
            TimerMode::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Segment {
    Focus,
    Rest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum Phase {
    Preparing { starts_at: DateTime<Utc> },
    Running(Segment),
    Paused(Segment),
    PomodoroFinished,
    RestFinished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparing { .. } => "preparing",
            Phase::Running(Segment::Focus) => "running",
            Phase::Paused(Segment::Focus) => "paused",
            Phase::Running(Segment::Rest) => "resting",
            Phase::Paused(Segment::Rest) => "restPaused",
            Phase::PomodoroFinished => "pomodoroFinished",
            Phase::RestFinished => "restFinished",
        }
    }
}

/// What a study session is about. `id` is the identity restore matches on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub id: String,
    pub label: String,
    pub topic: Option<String>,
}

impl SessionContext {
    pub fn new(label: impl Into<String>, topic: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            topic,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDurations {
    pub pomodoro_seconds: u64,
    pub rest_seconds: u64,
}

/// Outcome of a tick that crossed a phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    FocusStarted,
    FocusBlockFinished,
    RestFinished,
}

/// Single-writer session clock.
///
/// `segment_start_anchor` is `Some` exactly while the phase is `Running(_)`.
/// Committed time lives in the three base counters; in-flight time is always
/// derived from the anchor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub context: SessionContext,
    pub mode: TimerMode,
    pub durations: BlockDurations,
    pub phase: Phase,
    pub total_focus_seconds: u64,
    pub focus_block_elapsed_base: u64,
    pub rest_elapsed_base: u64,
    pub segment_start_anchor: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn start(
        context: SessionContext,
        mode: TimerMode,
        durations: BlockDurations,
        prepare_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut session = Self {
            context,
            mode,
            durations,
            phase: Phase::Preparing {
                starts_at: now + Duration::seconds(prepare_seconds as i64),
            },
            total_focus_seconds: 0,
            focus_block_elapsed_base: 0,
            rest_elapsed_base: 0,
            segment_start_anchor: None,
            started_at: now,
        };
        if prepare_seconds == 0 {
            session.begin_focus_block(now);
        }
        session
    }

    fn focus_bound(&self) -> Option<u64> {
        match self.mode {
            TimerMode::Pomodoro => Some(remaining(
                self.durations.pomodoro_seconds,
                self.focus_block_elapsed_base,
            )),
            TimerMode::Free => None,
        }
    }

    fn rest_bound(&self) -> u64 {
        remaining(self.durations.rest_seconds, self.rest_elapsed_base)
    }

    fn begin_focus_block(&mut self, now: DateTime<Utc>) {
        if self.mode == TimerMode::Pomodoro {
            self.focus_block_elapsed_base = 0;
        }
        self.segment_start_anchor = Some(now);
        self.phase = Phase::Running(Segment::Focus);
    }

    fn begin_rest(&mut self, now: DateTime<Utc>) {
        self.rest_elapsed_base = 0;
        self.segment_start_anchor = Some(now);
        self.phase = Phase::Running(Segment::Rest);
    }

    /// Folds the in-flight segment into its bases and clears the anchor.
    fn commit_segment(&mut self, now: DateTime<Utc>) {
        match self.phase {
            Phase::Running(Segment::Focus) => {
                let block = commit(
                    self.focus_block_elapsed_base,
                    self.segment_start_anchor,
                    now,
                    self.focus_bound(),
                );
                let delta = block - self.focus_block_elapsed_base;
                self.focus_block_elapsed_base = block;
                self.total_focus_seconds = self.total_focus_seconds.saturating_add(delta);
            }
            Phase::Running(Segment::Rest) => {
                self.rest_elapsed_base = commit(
                    self.rest_elapsed_base,
                    self.segment_start_anchor,
                    now,
                    Some(self.rest_bound()),
                );
            }
            _ => {}
        }
        self.segment_start_anchor = None;
    }

    /// Uncommitted seconds of the running segment, clamped to its block.
    pub fn in_flight_seconds(&self, now: DateTime<Utc>) -> u64 {
        match (self.phase, self.segment_start_anchor) {
            (Phase::Running(Segment::Focus), Some(anchor)) => {
                running_delta(anchor, now, self.focus_bound())
            }
            (Phase::Running(Segment::Rest), Some(anchor)) => {
                running_delta(anchor, now, Some(self.rest_bound()))
            }
            _ => 0,
        }
    }

    pub fn current_total_focus(&self, now: DateTime<Utc>) -> u64 {
        match self.phase {
            Phase::Running(Segment::Focus) => self.total_focus_seconds + self.in_flight_seconds(now),
            _ => self.total_focus_seconds,
        }
    }

    /// Value a viewer should see: countdown for Pomodoro focus and rest,
    /// count-up for Free focus. Never negative.
    pub fn display_seconds(&self, now: DateTime<Utc>) -> u64 {
        let in_flight = self.in_flight_seconds(now);
        match self.phase {
            Phase::Preparing { starts_at } => {
                let left = starts_at.signed_duration_since(now).num_seconds().max(0);
                left as u64
            }
            Phase::Running(Segment::Rest) | Phase::Paused(Segment::Rest) => remaining(
                self.durations.rest_seconds,
                self.rest_elapsed_base + in_flight,
            ),
            Phase::RestFinished | Phase::PomodoroFinished => 0,
            Phase::Running(Segment::Focus) | Phase::Paused(Segment::Focus) => match self.mode {
                TimerMode::Pomodoro => remaining(
                    self.durations.pomodoro_seconds,
                    self.focus_block_elapsed_base + in_flight,
                ),
                TimerMode::Free => self.total_focus_seconds + in_flight,
            },
        }
    }

    pub fn counts_down(&self) -> bool {
        self.is_resting() || self.mode == TimerMode::Pomodoro
    }

    pub fn is_paused(&self) -> bool {
        !matches!(self.phase, Phase::Running(_))
    }

    pub fn is_resting(&self) -> bool {
        matches!(
            self.phase,
            Phase::Running(Segment::Rest) | Phase::Paused(Segment::Rest) | Phase::RestFinished
        )
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        match self.phase {
            Phase::Running(segment) => {
                self.commit_segment(now);
                self.phase = Phase::Paused(segment);
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        match self.phase {
            Phase::Paused(segment) => {
                self.segment_start_anchor = Some(now);
                self.phase = Phase::Running(segment);
                true
            }
            _ => false,
        }
    }

    /// Advances time-driven transitions. A boundary fires once: the phase
    /// leaves `Running` in the same step, so later ticks see nothing to do.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        match self.phase {
            Phase::Preparing { starts_at } if now >= starts_at => {
                self.begin_focus_block(now);
                Some(Transition::FocusStarted)
            }
            Phase::Running(Segment::Focus) if self.mode == TimerMode::Pomodoro => {
                let elapsed = self.focus_block_elapsed_base + self.in_flight_seconds(now);
                if elapsed >= self.durations.pomodoro_seconds {
                    self.commit_segment(now);
                    self.phase = Phase::PomodoroFinished;
                    Some(Transition::FocusBlockFinished)
                } else {
                    None
                }
            }
            Phase::Running(Segment::Rest) => {
                let elapsed = self.rest_elapsed_base + self.in_flight_seconds(now);
                if elapsed >= self.durations.rest_seconds {
                    self.commit_segment(now);
                    self.phase = Phase::RestFinished;
                    Some(Transition::RestFinished)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn repeat_cycle(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.phase != Phase::PomodoroFinished {
            bail!("cannot repeat cycle while {}", self.phase.as_str());
        }
        self.begin_focus_block(now);
        Ok(())
    }

    pub fn skip_to_rest(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.mode != TimerMode::Pomodoro {
            bail!("rest is only available in pomodoro mode");
        }
        match self.phase {
            Phase::Running(Segment::Focus)
            | Phase::Paused(Segment::Focus)
            | Phase::PomodoroFinished => {
                self.commit_segment(now);
                self.begin_rest(now);
                Ok(())
            }
            other => bail!("cannot start rest while {}", other.as_str()),
        }
    }

    pub fn back_to_study(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.phase {
            Phase::RestFinished | Phase::Running(Segment::Rest) | Phase::Paused(Segment::Rest) => {
                self.commit_segment(now);
                self.begin_focus_block(now);
                Ok(())
            }
            other => bail!("cannot go back to study while {}", other.as_str()),
        }
    }

    /// Commits any in-flight segment and returns the session's focus total.
    pub fn finish(&mut self, now: DateTime<Utc>) -> u64 {
        if let Phase::Running(segment) = self.phase {
            self.commit_segment(now);
            self.phase = Phase::Paused(segment);
        }
        self.total_focus_seconds
    }
}

/// Focus total reported to the caller on stop: whole minutes, at least one.
pub fn focus_minutes(total_focus_seconds: u64) -> u32 {
    let minutes = (total_focus_seconds + 30) / 60;
    minutes.max(1).min(u32::MAX as u64) as u32
}
