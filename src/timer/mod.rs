pub mod accumulator;
pub mod clock;
pub mod commands;
pub mod controller;
pub mod snapshot;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{AlarmKind, TimerController, TimerEvent, TimerSnapshot};
pub use snapshot::{LocalSnapshot, LocalSnapshotStore};
pub use state::{
    focus_minutes, BlockDurations, Phase, Segment, Session, SessionContext, TimerMode, Transition,
};
