use std::str::FromStr;

use anyhow::{anyhow, bail, Result};

use crate::settings::TimerSettings;

use super::{SessionContext, TimerController, TimerMode, TimerSnapshot};

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        mode: TimerMode,
        label: String,
        topic: Option<String>,
    },
    Pause,
    Resume,
    Rest,
    Repeat,
    Study,
    Status,
    Stop,
    Cancel,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "start" => return parse_start(rest),
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "rest" => Command::Rest,
            "repeat" => Command::Repeat,
            "study" => Command::Study,
            "status" => Command::Status,
            "stop" => Command::Stop,
            "cancel" => Command::Cancel,
            "quit" | "exit" => Command::Quit,
            "" => bail!("empty command"),
            other => bail!("unknown command '{other}'"),
        };

        if !rest.is_empty() {
            bail!("'{verb}' takes no arguments");
        }
        Ok(command)
    }
}

/// `start <pomodoro|free> <label> [# topic]`
fn parse_start(args: &str) -> Result<Command> {
    let (mode, rest) = args
        .split_once(char::is_whitespace)
        .ok_or_else(|| anyhow!("usage: start <pomodoro|free> <label> [# topic]"))?;

    let mode = match mode.to_ascii_lowercase().as_str() {
        "pomodoro" => TimerMode::Pomodoro,
        "free" => TimerMode::Free,
        other => bail!("unknown timer mode '{other}'"),
    };

    let (label, topic) = match rest.split_once('#') {
        Some((label, topic)) => (label.trim(), Some(topic.trim())),
        None => (rest.trim(), None),
    };
    if label.is_empty() {
        bail!("a session label is required");
    }

    Ok(Command::Start {
        mode,
        label: label.to_string(),
        topic: topic.filter(|t| !t.is_empty()).map(str::to_string),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    State(TimerSnapshot),
    Idle,
    Completed { minutes: u32 },
    Cancelled,
    Quit,
}

pub async fn dispatch(
    controller: &TimerController,
    settings: &TimerSettings,
    command: Command,
) -> Result<Reply> {
    let reply = match command {
        Command::Start { mode, label, topic } => {
            let context = SessionContext::new(label, topic);
            Reply::State(controller.start(context, mode, settings).await?)
        }
        Command::Pause => Reply::State(controller.pause().await?),
        Command::Resume => Reply::State(controller.resume().await?),
        Command::Rest => Reply::State(controller.skip_to_rest().await?),
        Command::Repeat => Reply::State(controller.repeat_cycle().await?),
        Command::Study => Reply::State(controller.back_to_study().await?),
        Command::Status => controller
            .snapshot()
            .await
            .map_or(Reply::Idle, Reply::State),
        Command::Stop => Reply::Completed {
            minutes: controller.stop().await?,
        },
        Command::Cancel => {
            controller.cancel().await?;
            Reply::Cancelled
        }
        Command::Quit => Reply::Quit,
    };
    Ok(reply)
}

/// `mm:ss`, or `h:mm:ss` once an hour is reached.
pub fn format_clock(seconds: u64) -> String {
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::State(snapshot) => write!(
                f,
                "[{}] {} {} (focus {})",
                snapshot.phase.as_str(),
                snapshot.context.label,
                format_clock(snapshot.display_seconds),
                format_clock(snapshot.total_focus_seconds)
            ),
            Reply::Idle => write!(f, "no active session"),
            Reply::Completed { minutes } => write!(f, "session saved: {minutes} min"),
            Reply::Cancelled => write!(f, "session discarded"),
            Reply::Quit => write!(f, "bye"),
        }
    }
}
