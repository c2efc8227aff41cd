pub mod db;
pub mod remote;
pub mod settings;
pub mod timer;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;

use db::Database;
use remote::{
    spawn_observer, LiveSession, MemoryRemoteStore, ObserverOptions, PrincipalProfile,
    SharedRemoteStore,
};
use settings::SettingsStore;
use timer::{
    commands::{dispatch, format_clock, Command, Reply},
    AlarmKind, Clock, LocalSnapshotStore, SystemClock, TimerController, TimerEvent,
};

struct AppState {
    timer: TimerController,
    settings: SettingsStore,
    live: watch::Receiver<Vec<LiveSession>>,
}

fn data_dir() -> PathBuf {
    std::env::var_os("STUDYCLOCK_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".studyclock"))
}

fn principal_id() -> String {
    std::env::var("STUDYCLOCK_PRINCIPAL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("studyclock starting up...");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run_console()) {
        log::error!("studyclock exited with error: {err:#}");
        std::process::exit(1);
    }
}

async fn run_console() -> Result<()> {
    let app_data_dir = data_dir();
    std::fs::create_dir_all(&app_data_dir)
        .with_context(|| format!("Failed to create {}", app_data_dir.display()))?;

    let database = Database::new(app_data_dir.join("studyclock.sqlite3"))?;
    let settings = SettingsStore::new(app_data_dir.join("settings.json"))?;

    let principal_id = principal_id();
    let profile_settings = settings.profile();
    let profile = PrincipalProfile {
        display_name: profile_settings
            .display_name
            .unwrap_or_else(|| principal_id.clone()),
        avatar_ref: profile_settings.avatar_ref,
        principal_id: principal_id.clone(),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let remote: SharedRemoteStore = Arc::new(MemoryRemoteStore::new(clock.clone()));

    let shutdown = CancellationToken::new();
    let timer_settings = settings.timer();
    let options = ObserverOptions {
        stale_after: ChronoDuration::seconds(i64::from(timer_settings.heartbeat_seconds.max(1)) * 3),
        ..ObserverOptions::default()
    };
    let (observer, live) = spawn_observer(remote.clone(), clock.clone(), options, shutdown.child_token());

    let timer = TimerController::new(
        LocalSnapshotStore::new(database, principal_id),
        profile,
        clock,
        Some(remote),
    );
    if let Some(snapshot) = timer.restore(None, &timer_settings).await {
        println!("{}", Reply::State(snapshot));
        println!("restored a previous session; type 'resume' to continue");
    }

    let state = AppState {
        timer,
        settings,
        live,
    };
    let result = console_loop(&state).await;

    shutdown.cancel();
    if let Err(err) = observer.await {
        log::warn!("observer task failed to join: {err}");
    }
    result
}

async fn console_loop(state: &AppState) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = state.timer.subscribe();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match line.parse::<Command>() {
                    Ok(command) => command,
                    Err(err) => {
                        println!("{err}");
                        continue;
                    }
                };
                let show_board = command == Command::Status;

                match dispatch(&state.timer, &state.settings.timer(), command).await {
                    Ok(Reply::Quit) => break,
                    Ok(reply) => println!("{reply}"),
                    Err(err) => println!("error: {err:#}"),
                }
                if show_board {
                    print_board(&state.live.borrow());
                }
            }
            event = events.recv() => match event {
                Ok(TimerEvent::Alarm { kind: AlarmKind::FocusBlockFinished }) => {
                    println!("focus block finished; 'rest', 'repeat' or 'stop'");
                }
                Ok(TimerEvent::Alarm { kind: AlarmKind::RestFinished }) => {
                    println!("rest finished; 'study' or 'stop'");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    // Leaving keeps the local snapshot so the next launch can restore it.
    Ok(())
}

fn print_board(live: &[LiveSession]) {
    for session in live {
        println!(
            "  {:<16} {:<20} {:>8} {}{}",
            session.display_name,
            session.session_label,
            format_clock(session.seconds),
            session.phase,
            if session.stale { " (stale)" } else { "" }
        );
    }
}
