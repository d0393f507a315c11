//! Operator console: commands from stdin, call events to stdout.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::{Command, HELP};
use crate::events::CallEvent;

/// Reads stdin line by line until EOF or `quit`.
pub async fn read_commands(tx: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                let _ = tx.send(Command::Quit).await;
                return;
            }
            Err(e) => {
                warn!("stdin read failed: {e}");
                let _ = tx.send(Command::Quit).await;
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(cmd) => {
                let quit = cmd == Command::Quit;
                if tx.send(cmd).await.is_err() || quit {
                    return;
                }
            }
            Err(e) => println!("{e}\n{HELP}"),
        }
    }
}

pub fn render(event: &CallEvent) -> String {
    match event {
        CallEvent::StateChanged(state) => format!("[state] {state}"),
        CallEvent::IncomingCall { call_id, caller } => {
            format!("[ring] incoming call {call_id} from {caller} (accept | reject)")
        }
        CallEvent::Connected => "[call] media connected".to_owned(),
        CallEvent::RemoteTrack(track) => {
            format!("[call] remote {:?} track {}", track.kind, track.track_id)
        }
        CallEvent::SetupFailed { reason } => format!("[error] {reason}"),
        CallEvent::ConnectionLost => "[error] call connection lost".to_owned(),
        CallEvent::RemoteHangup { duration_secs } => {
            format!("[call] remote side hung up{}", duration_suffix(*duration_secs))
        }
        CallEvent::Rejected => "[call] call rejected".to_owned(),
        CallEvent::Ended { duration_secs } => {
            format!("[call] call ended{}", duration_suffix(*duration_secs))
        }
        CallEvent::Status(snapshot) => format!("[status] {snapshot}"),
        CallEvent::CommandRejected(reason) => format!("[error] {reason}"),
    }
}

fn duration_suffix(secs: Option<i64>) -> String {
    secs.map(|s| format!(" after {}:{:02}", s / 60, s % 60))
        .unwrap_or_default()
}

/// Prints call events until the sender side goes away.
pub async fn print_events(mut rx: mpsc::UnboundedReceiver<CallEvent>) {
    while let Some(event) = rx.recv().await {
        println!("{}", render(&event));
    }
}
