//! Subprocess helpers shared by the sandbox backends.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::fix::{VerificationOutcome, LAUNCH_FAILED_EXIT_CODE};

/// Run `command` to completion, capturing output, within `timeout`.
///
/// The child is killed if the timeout fires or the future is dropped. When
/// the command was started as a process group leader the whole group is
/// killed on timeout.
pub(crate) async fn run_captured(
    mut command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> VerificationOutcome {
    let started = Instant::now();

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return VerificationOutcome::launch_failure(
                format!("failed to launch command: {}", e),
                started.elapsed(),
            );
        }
    };

    let pid = child.id();

    // Feed stdin and wait under one deadline so a child that never reads
    // its input cannot stall past the timeout.
    let pipe = child.stdin.take();
    let feed = async move {
        match (pipe, stdin) {
            (Some(mut pipe), Some(input)) => {
                let written = pipe.write_all(input).await;
                // Close stdin so the child sees EOF.
                drop(pipe);
                written
            }
            _ => Ok(()),
        }
    };
    let work = async move { tokio::join!(feed, child.wait_with_output()) };

    match tokio::time::timeout(timeout, work).await {
        Ok((Err(e), _)) => {
            debug!("Writing to child stdin failed: {}", e);
            VerificationOutcome::launch_failure(
                format!("failed to write command input: {}", e),
                started.elapsed(),
            )
        }
        Ok((Ok(()), Ok(output))) => VerificationOutcome::from_exit(
            output.status.code().unwrap_or(LAUNCH_FAILED_EXIT_CODE),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            started.elapsed(),
        ),
        Ok((Ok(()), Err(e))) => VerificationOutcome::launch_failure(
            format!("failed to wait for command: {}", e),
            started.elapsed(),
        ),
        Err(_) => {
            kill_process_group(pid);
            VerificationOutcome::timed_out(timeout)
        }
    }
}

/// Best-effort SIGKILL to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let killed = std::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = killed {
        debug!("Could not signal process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Run a setup step; any non-zero exit becomes an error message.
pub(crate) async fn run_step(
    label: &str,
    command: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<VerificationOutcome, String> {
    let outcome = run_captured(command, stdin, timeout).await;
    if outcome.passed {
        Ok(outcome)
    } else {
        Err(format!(
            "{} exited with code {}: {}",
            label,
            outcome.exit_code,
            tail(&outcome.stderr, 500)
        ))
    }
}

/// Last `max_chars` characters of `text`, trimmed.
pub(crate) fn tail(text: &str, max_chars: usize) -> &str {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
