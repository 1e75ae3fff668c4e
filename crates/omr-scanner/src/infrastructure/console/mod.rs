//! Line-oriented operator console.
//!
//! Reads one command per line from any `AsyncBufRead` (stdin in production)
//! and writes replies plus a fresh status block whenever the published
//! [`StationStatus`] changes.
//!
//! ```text
//! start [exam_id [template_id]]
//!                   open a session (exam falls back to --exam; the
//!                   template defaults to the exam's catalog entry)
//! capture           grab and submit one frame
//! stop              end the session and release the device
//! status            print the current view
//! devices           list capture devices
//! exams             list exams from the catalog
//! help              this text
//! quit              stop and exit
//! ```

use std::fmt::Write as _;

use anyhow::Context;
use omr_core::StartOutcome;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::scan_session::{ScanSessionHandle, SessionError, StationStatus};

const HELP: &str = "commands: start [exam_id [template_id]] | capture | stop | status | devices | exams | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start {
        exam: Option<String>,
        template: Option<String>,
    },
    Capture,
    Stop,
    Status,
    Devices,
    Exams,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("unknown command '{0}' (type 'help')")]
    UnknownCommand(String),

    #[error("'{0}' takes no arguments")]
    UnexpectedArgument(String),
}

/// Parses one input line.  Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let verb = verb.to_ascii_lowercase();
    let args: Vec<String> = words.map(str::to_string).collect();
    let max_args = if verb == "start" { 2 } else { 0 };
    if args.len() > max_args {
        return Err(ConsoleError::UnexpectedArgument(verb));
    }
    let mut args = args.into_iter();

    let command = match verb.as_str() {
        "start" => ConsoleCommand::Start {
            exam: args.next(),
            template: args.next(),
        },
        "capture" | "c" => ConsoleCommand::Capture,
        "stop" => ConsoleCommand::Stop,
        "status" => ConsoleCommand::Status,
        "devices" => ConsoleCommand::Devices,
        "exams" => ConsoleCommand::Exams,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return Err(ConsoleError::UnknownCommand(verb)),
    };
    Ok(Some(command))
}

/// Formats the status block shown after every change.
pub fn render(status: &StationStatus) -> String {
    let view = &status.view;
    let mut out = String::new();
    let _ = write!(
        out,
        "[{}] connection={} device={}",
        view.label,
        view.connection.as_str(),
        if status.device_active { "on" } else { "off" }
    );
    if view.status_text != view.label {
        let _ = write!(out, "\n  service: {}", view.status_text);
    }

    if let Some(result) = &view.last_result {
        let _ = write!(
            out,
            "\n  last result: frame {} board {}",
            result.sequence_number,
            result.board_number.as_deref().unwrap_or("?")
        );
        if let Some(name) = &result.student_name {
            let _ = write!(out, " {name}");
        }
        if let Some(score) = result.total_score {
            let _ = write!(out, " score {score}");
        }
    }

    if let Some(failure) = &view.failure {
        let _ = write!(
            out,
            "\n  frame {} failed ({}): {} - retry with 'capture'",
            failure.sequence, failure.reason, failure.message
        );
        if let Some(preview) = &failure.preview {
            let _ = write!(out, "\n  aligned preview attached ({} bytes base64)", preview.len());
        }
    }

    let stats = view.stats;
    if stats.frames_captured > 0 {
        let _ = write!(
            out,
            "\n  frames {} | ok {} | failed {}",
            stats.frames_captured, stats.successes, stats.failures
        );
        if let Some(avg) = stats.average_latency {
            let _ = write!(out, " | avg {:.2}s", avg.as_secs_f64());
        }
    }
    out
}

/// Runs the console until `quit`, end of input, or `shutdown`.
///
/// Always ends with a `stop` so the device is released before returning.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails.
pub async fn run_console<R, W>(
    handle: ScanSessionHandle,
    input: R,
    mut output: W,
    default_exam: Option<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut status = handle.subscribe();
    let first = render(&status.borrow_and_update());
    write_line(&mut output, &first).await?;
    write_line(&mut output, HELP).await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("console shutting down on signal");
                break;
            }

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let text = render(&status.borrow_and_update());
                write_line(&mut output, &text).await?;
            }

            line = lines.next_line() => {
                let Some(line) = line.context("reading operator input")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        let reply = execute(&handle, command, default_exam.as_deref()).await;
                        write_line(&mut output, &reply).await?;
                    }
                    Err(e) => write_line(&mut output, &e.to_string()).await?,
                }
            }
        }
    }

    match handle.stop().await {
        Ok(_) | Err(SessionError::Closed) => {}
        Err(e) => write_line(&mut output, &format!("stop failed: {e}")).await?,
    }
    output.flush().await.context("flushing console output")?;
    Ok(())
}

async fn execute(
    handle: &ScanSessionHandle,
    command: ConsoleCommand,
    default_exam: Option<&str>,
) -> String {
    match command {
        ConsoleCommand::Start { exam, template } => {
            let Some(exam) = exam.as_deref().or(default_exam) else {
                return "usage: start <exam_id> [template_id] (or run with --exam)".to_string();
            };
            match handle.start_exam(exam, template.as_deref()).await {
                Ok(StartOutcome::Started) => match template {
                    Some(template) => {
                        format!("starting session for exam {exam} with template {template}")
                    }
                    None => format!("starting session for exam {exam}"),
                },
                Ok(StartOutcome::AlreadyActive(state)) => {
                    format!("a session is already running ({})", state.as_str())
                }
                Err(e) => format!("start failed: {e}"),
            }
        }
        ConsoleCommand::Capture => match handle.capture().await {
            Ok(sequence) => format!("frame {sequence} captured"),
            Err(e) => format!("capture rejected: {e}"),
        },
        ConsoleCommand::Stop => match handle.stop().await {
            Ok(true) => "session stopped".to_string(),
            Ok(false) => "no session to stop".to_string(),
            Err(e) => format!("stop failed: {e}"),
        },
        ConsoleCommand::Status => render(&handle.status()),
        ConsoleCommand::Devices => match handle.list_devices().await {
            Ok(devices) if devices.is_empty() => "no capture devices found".to_string(),
            Ok(devices) => devices
                .iter()
                .map(|d| {
                    let facing = if d.rear_facing { " (rear)" } else { "" };
                    format!("{}  {}{facing}", d.device_id, d.label)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("device enumeration failed: {e}"),
        },
        ConsoleCommand::Exams => match handle.exams().await {
            Ok(exams) if exams.is_empty() => "no exams configured".to_string(),
            Ok(exams) => exams
                .iter()
                .map(|e| {
                    format!(
                        "{}  template {}  {} questions  max {}",
                        e.exam_id, e.template_id, e.question_count, e.max_score
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("exam catalog unavailable: {e}"),
        },
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> anyhow::Result<()> {
    output
        .write_all(format!("{text}\n").as_bytes())
        .await
        .context("writing console output")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
