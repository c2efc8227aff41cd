use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::timer::BlockDurations;

/// Timer configuration handed to `start()`; nothing reads it globally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerSettings {
    pub pomodoro_minutes: u32,
    pub rest_minutes: u32,
    pub prepare_seconds: u32,
    pub heartbeat_seconds: u32,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            pomodoro_minutes: 25,
            rest_minutes: 5,
            prepare_seconds: 3,
            heartbeat_seconds: 30,
        }
    }
}

impl TimerSettings {
    /// Block lengths in seconds. Zero-length blocks are raised to a minute.
    pub fn durations(&self) -> BlockDurations {
        BlockDurations {
            pomodoro_seconds: u64::from(self.pomodoro_minutes.max(1)) * 60,
            rest_seconds: u64::from(self.rest_minutes.max(1)) * 60,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_seconds.max(1)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileSettings {
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    timer: TimerSettings,
    profile: ProfileSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn timer(&self) -> TimerSettings {
        self.read().timer
    }

    pub fn profile(&self) -> ProfileSettings {
        self.read().profile.clone()
    }

    pub fn update_timer(&self, settings: TimerSettings) -> Result<()> {
        let mut guard = self.write();
        guard.timer = settings;
        self.persist(&guard)
    }

    pub fn update_profile(&self, profile: ProfileSettings) -> Result<()> {
        let mut guard = self.write();
        guard.profile = profile;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
