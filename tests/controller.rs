mod common;

use std::sync::Arc;

use common::{controller, drain, settings, t0, wait_for_remote, PRINCIPAL};
use studyclock_lib::db::Database;
use studyclock_lib::remote::{MemoryRemoteStore, RemoteStore, TimerType};
use studyclock_lib::settings::TimerSettings;
use studyclock_lib::timer::{
    AlarmKind, ManualClock, Phase, Segment, SessionContext, TimerEvent, TimerMode, Transition,
};

fn alarms(events: &[TimerEvent]) -> Vec<AlarmKind> {
    events
        .iter()
        .filter_map(|event| match event {
            TimerEvent::Alarm { kind } => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_pomodoro_cycle_excludes_paused_time() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let timer = controller(&db, &clock, None);
    let mut events = timer.subscribe();

    let started = timer
        .start(SessionContext::new("Latin", None), TimerMode::Pomodoro, &settings())
        .await
        .unwrap();
    assert_eq!(started.phase, Phase::Running(Segment::Focus));
    assert_eq!(started.display_seconds, 1500);
    assert!(started.counts_down);

    clock.advance_secs(600);
    assert_eq!(timer.process_tick().await, None);
    timer.pause().await.unwrap();
    clock.advance_secs(300);
    let resumed = timer.resume().await.unwrap();
    assert_eq!(resumed.display_seconds, 900);

    clock.advance_secs(900);
    assert_eq!(
        timer.process_tick().await,
        Some(Transition::FocusBlockFinished)
    );
    clock.advance_secs(5);
    assert_eq!(timer.process_tick().await, None);

    let snapshot = timer.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::PomodoroFinished);
    assert_eq!(snapshot.total_focus_seconds, 1500);
    assert_eq!(snapshot.display_seconds, 0);
    assert_eq!(alarms(&drain(&mut events)), vec![AlarmKind::FocusBlockFinished]);

    let resting = timer.skip_to_rest().await.unwrap();
    assert_eq!(resting.phase, Phase::Running(Segment::Rest));
    assert_eq!(resting.display_seconds, 300);

    clock.advance_secs(300);
    assert_eq!(timer.process_tick().await, Some(Transition::RestFinished));
    assert_eq!(alarms(&drain(&mut events)), vec![AlarmKind::RestFinished]);

    let studying = timer.back_to_study().await.unwrap();
    assert_eq!(studying.display_seconds, 1500);
    assert_eq!(studying.total_focus_seconds, 1500);

    clock.advance_secs(120);
    assert_eq!(timer.stop().await.unwrap(), 27);
    assert!(timer.snapshot().await.is_none());

    let completed = drain(&mut events).into_iter().find_map(|event| match event {
        TimerEvent::SessionCompleted {
            total_focus_seconds,
            minutes,
            ..
        } => Some((total_focus_seconds, minutes)),
        _ => None,
    });
    assert_eq!(completed, Some((1620, 27)));
}

#[tokio::test]
async fn test_actions_need_an_active_session() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let timer = controller(&db, &clock, None);

    assert!(timer.pause().await.is_err());
    assert!(timer.stop().await.is_err());
    assert!(timer.cancel().await.is_ok());
    assert!(timer.process_tick().await.is_none());

    timer
        .start(SessionContext::new("Latin", None), TimerMode::Free, &settings())
        .await
        .unwrap();
    assert!(timer
        .start(SessionContext::new("Greek", None), TimerMode::Free, &settings())
        .await
        .is_err());

    // Rest belongs to pomodoro sessions only; state is left untouched.
    assert!(timer.skip_to_rest().await.is_err());
    assert!(timer.repeat_cycle().await.is_err());
    let snapshot = timer.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Running(Segment::Focus));
    assert_eq!(snapshot.context.label, "Latin");
}

#[tokio::test]
async fn test_repeated_pause_is_a_no_op() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let timer = controller(&db, &clock, None);
    let mut events = timer.subscribe();

    timer
        .start(SessionContext::new("Physics", None), TimerMode::Free, &settings())
        .await
        .unwrap();
    clock.advance_secs(42);
    timer.pause().await.unwrap();
    drain(&mut events);

    clock.advance_secs(100);
    let again = timer.pause().await.unwrap();
    assert_eq!(again.display_seconds, 42);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_preparing_counts_in_before_focus() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let timer = controller(&db, &clock, None);
    let settings = TimerSettings {
        prepare_seconds: 3,
        ..settings()
    };

    let started = timer
        .start(SessionContext::new("Biology", None), TimerMode::Pomodoro, &settings)
        .await
        .unwrap();
    assert!(matches!(started.phase, Phase::Preparing { .. }));
    assert_eq!(started.display_seconds, 3);

    clock.advance_secs(2);
    assert_eq!(timer.process_tick().await, None);
    clock.advance_secs(1);
    assert_eq!(timer.process_tick().await, Some(Transition::FocusStarted));

    let snapshot = timer.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Running(Segment::Focus));
    assert_eq!(snapshot.display_seconds, 1500);
    assert_eq!(snapshot.total_focus_seconds, 0);
}

#[tokio::test]
async fn test_short_session_reports_one_minute() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let timer = controller(&db, &clock, None);

    timer
        .start(SessionContext::new("Reading", None), TimerMode::Free, &settings())
        .await
        .unwrap();
    clock.advance_secs(10);
    assert_eq!(timer.stop().await.unwrap(), 1);
}

#[tokio::test]
async fn test_remote_record_follows_session_and_is_released() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryRemoteStore::new(Arc::new(clock.clone())));
    let timer = controller(&db, &clock, Some(store.clone()));

    timer
        .start(
            SessionContext::new("Organic chemistry", Some("alkenes".into())),
            TimerMode::Pomodoro,
            &settings(),
        )
        .await
        .unwrap();
    let record = wait_for_remote(&store, |r| r.is_some()).await.unwrap();
    assert_eq!(record.timer_type, TimerType::Countdown);
    assert_eq!(record.display_seconds_snapshot, 1500);
    assert_eq!(record.topic.as_deref(), Some("alkenes"));
    assert_eq!(record.snapshot_at, Some(t0()));

    clock.advance_secs(47);
    timer.pause().await.unwrap();
    let record = wait_for_remote(&store, |r| r.is_some_and(|r| r.is_paused))
        .await
        .unwrap();
    assert_eq!(record.display_seconds_snapshot, 1453);
    assert_eq!(record.phase, "paused");

    timer.stop().await.unwrap();
    assert!(store.get(PRINCIPAL).await.unwrap().is_none());
}

#[tokio::test]
async fn test_evicted_record_is_recreated_on_next_change() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryRemoteStore::new(Arc::new(clock.clone())));
    let timer = controller(&db, &clock, Some(store.clone()));

    timer
        .start(SessionContext::new("Statistics", None), TimerMode::Free, &settings())
        .await
        .unwrap();
    wait_for_remote(&store, |r| r.is_some()).await;
    assert!(store.evict(PRINCIPAL).await);

    clock.advance_secs(75);
    timer.pause().await.unwrap();
    let record = wait_for_remote(&store, |r| r.is_some()).await.unwrap();
    assert_eq!(record.timer_type, TimerType::Stopwatch);
    assert_eq!(record.display_seconds_snapshot, 75);
    assert!(record.is_paused);

    timer.cancel().await.unwrap();
}

#[tokio::test]
async fn test_cancel_discards_everything() {
    let db = Database::in_memory().unwrap();
    let clock = ManualClock::new(t0());
    let store = Arc::new(MemoryRemoteStore::new(Arc::new(clock.clone())));
    let timer = controller(&db, &clock, Some(store.clone()));
    let mut events = timer.subscribe();

    let context = SessionContext::new("History", None);
    let context_id = context.id.clone();
    timer
        .start(context, TimerMode::Pomodoro, &settings())
        .await
        .unwrap();
    clock.advance_secs(200);
    timer.process_tick().await;

    timer.cancel().await.unwrap();
    timer.cancel().await.unwrap();
    assert!(timer.snapshot().await.is_none());
    assert!(store.get(PRINCIPAL).await.unwrap().is_none());
    assert!(db.load_snapshot(PRINCIPAL).await.unwrap().is_none());

    let cancelled: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            TimerEvent::Cancelled { context_id } => Some(context_id),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled, vec![context_id]);
}
