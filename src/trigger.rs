//! Trigger sources (§4.5.1): keyboard, remote push-notification long-poll,
//! and the programmatic API, all mapped onto a single `Command` enum
//! consumed by the Recorder.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::TriggerState;

/// A command accepted by the Recorder, from whichever source.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    StartRecording { duration: Option<f64> },
    StopRecording,
    Status,
}

/// A `Command` plus the source attribution carried onto sync samples.
#[derive(Clone, Debug)]
pub struct Attributed {
    pub command: Command,
    pub source: TriggerState,
}

/// Parses the remote textual form `"start_recording [duration]"` /
/// `"stop_recording"` / `"status"`.
fn parse_text_command(s: &str) -> Option<Command> {
    let mut parts = s.trim().split_whitespace();
    match parts.next()? {
        "start_recording" => {
            let duration = parts.next().and_then(|d| d.parse::<f64>().ok());
            Some(Command::StartRecording { duration })
        }
        "stop_recording" => Some(Command::StopRecording),
        "status" => Some(Command::Status),
        _ => None,
    }
}

#[derive(Deserialize)]
struct JsonCommand {
    command: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

fn parse_json_command(value: &serde_json::Value) -> Option<Command> {
    let c: JsonCommand = serde_json::from_value(value.clone()).ok()?;
    match c.command.as_str() {
        "start_recording" => {
            let duration = c
                .params
                .as_ref()
                .and_then(|p| p.get("duration"))
                .and_then(|d| d.as_f64());
            Some(Command::StartRecording { duration })
        }
        "stop_recording" => Some(Command::StopRecording),
        "status" => Some(Command::Status),
        _ => None,
    }
}

/// Maps one push-notification `message` field onto a `Command`, trying the
/// JSON form before falling back to the textual form (§4.5.1).
fn parse_remote_message(message: &str) -> Option<Command> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(message) {
        if let Some(c) = parse_json_command(&v) {
            return Some(c);
        }
    }
    parse_text_command(message)
}

#[derive(Deserialize)]
struct NtfyMessage {
    id: String,
    message: String,
}

/// Reads a single line at a time from stdin and maps it onto a `Command`,
/// tagging it `Keyboard`. Runs only when the service is attached to an
/// interactive terminal (`Config::keyboard_enabled`).
pub fn spawn_keyboard(tx: mpsc::Sender<Attributed>, shutdown_rx: base::shutdown::Receiver) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut shutdown = shutdown_rx.as_future();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(l)) => {
                            if let Some(command) = parse_text_command(&l) {
                                let _ = tx.send(Attributed { command, source: TriggerState::Keyboard }).await;
                            } else {
                                debug!(line = %l, "unrecognized keyboard command");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "keyboard trigger read error");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Long-polls `<server>/<topic>/json?since=<id>` for newline-delimited JSON
/// messages, mapping each onto a `Command` tagged `Remote` (§4.5.1).
pub fn spawn_remote(
    server: String,
    topic: String,
    poll_interval: Duration,
    tx: mpsc::Sender<Attributed>,
    shutdown_rx: base::shutdown::Receiver,
) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "remote trigger client build failed; remote trigger disabled");
                return;
            }
        };
        let mut since = "all".to_string();
        let mut shutdown = shutdown_rx.as_future();
        loop {
            if shutdown_rx.check().is_err() {
                break;
            }
            let url = format!("{server}/{topic}/json?since={since}");
            let request = client.get(&url).send();
            let response = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                r = request => r,
            };
            let resp = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "remote trigger long-poll failed; retrying");
                    tokio::time::sleep(poll_interval * 2).await;
                    continue;
                }
            };
            let text = match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "remote trigger response read failed; retrying");
                    tokio::time::sleep(poll_interval * 2).await;
                    continue;
                }
            };
            for line in text.lines() {
                let Ok(msg) = serde_json::from_str::<NtfyMessage>(line) else {
                    continue;
                };
                since = msg.id.clone();
                if let Some(command) = parse_remote_message(&msg.message) {
                    let _ = tx
                        .send(Attributed {
                            command,
                            source: TriggerState::Remote,
                        })
                        .await;
                } else {
                    debug!(message = %msg.message, "unrecognized remote command");
                }
            }
        }
        info!("remote trigger source stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_textual_start_with_duration() {
        assert_eq!(
            parse_text_command("start_recording 3"),
            Some(Command::StartRecording { duration: Some(3.0) })
        );
    }

    #[test]
    fn parses_textual_start_without_duration() {
        assert_eq!(
            parse_text_command("start_recording"),
            Some(Command::StartRecording { duration: None })
        );
    }

    #[test]
    fn parses_textual_stop() {
        assert_eq!(parse_text_command("stop_recording"), Some(Command::StopRecording));
    }

    #[test]
    fn parses_json_form() {
        let msg = r#"{"command":"start_recording","params":{"duration":5.0}}"#;
        assert_eq!(
            parse_remote_message(msg),
            Some(Command::StartRecording { duration: Some(5.0) })
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(parse_text_command("frobnicate"), None);
        assert_eq!(parse_remote_message("frobnicate"), None);
    }
}
