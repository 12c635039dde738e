//! Child-process launch for [`super::LocalBackend`].
//!
//! The child receives its [`RunAssignment`] as one JSON document on stdin and
//! reports a [`CompletionNotice`] as the last JSON line on stdout. Anything
//! else it writes to stdout is ignored; stderr is inherited.

use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::completion::{CompletionNotice, TerminalStatus};

use super::RunAssignment;

/// How long to keep reading stdout once the worker process has exited.
const STDOUT_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

pub(super) struct SpawnedChild {
    pub child: Child,
    pub stdout: ChildStdout,
    pub pid: u32,
}

/// Spawn the worker program and hand it the assignment.
pub(super) async fn spawn_child(
    program: &str,
    args: &[String],
    assignment: &RunAssignment,
) -> anyhow::Result<SpawnedChild> {
    let payload = serde_json::to_vec(assignment).context("failed to encode run assignment")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn worker process '{program}'"))?;

    let pid = child
        .id()
        .context("worker process exited before it could be tracked")?;
    let stdout = child
        .stdout
        .take()
        .context("worker process stdout was not captured")?;
    let mut stdin = child
        .stdin
        .take()
        .context("worker process stdin was not captured")?;

    let handoff = async {
        stdin.write_all(&payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await
    };
    if let Err(err) = handoff.await {
        let _ = child.start_kill();
        return Err(err).context("failed to send the run assignment to the worker process");
    }
    drop(stdin);

    Ok(SpawnedChild { child, stdout, pid })
}

/// Wait for the child to exit, or kill it when `kill` fires, and turn what
/// happened into a completion notice.
pub(super) async fn supervise(
    spawned: SpawnedChild,
    assignment: &RunAssignment,
    mut kill: oneshot::Receiver<()>,
) -> CompletionNotice {
    let SpawnedChild {
        mut child,
        stdout,
        pid,
    } = spawned;
    let run_id = assignment.run_id;
    let experiment_id = assignment.experiment_id();

    let mut reader = tokio::spawn(last_notice(stdout, run_id));

    let mut killed = false;
    let exit = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            killed = true;
            if let Err(err) = child.start_kill() {
                tracing::warn!(pid, error = %err, "failed to signal worker process");
            }
            child.wait().await
        }
    };

    // A grandchild that inherited stdout can keep the pipe open after the
    // worker itself has exited.
    let reported = match tokio::time::timeout(STDOUT_GRACE, &mut reader).await {
        Ok(Ok(notice)) => notice,
        Ok(Err(err)) => {
            tracing::warn!(pid, error = %err, "worker stdout reader did not finish");
            None
        }
        Err(_) => {
            reader.abort();
            tracing::warn!(pid, "worker stdout still open after exit; ignoring further output");
            None
        }
    };

    if killed {
        return CompletionNotice::new(
            run_id,
            experiment_id,
            TerminalStatus::Cancelled,
            Some(format!("worker process {pid} was terminated by a stop request")),
            reported.map_or(0, |n| n.trial_count),
        );
    }

    match (reported, exit) {
        (Some(notice), _) => notice,
        (None, Ok(status)) => CompletionNotice::failed(
            run_id,
            experiment_id,
            format!("worker process {pid} {} without reporting completion", describe(status)),
        ),
        (None, Err(err)) => CompletionNotice::failed(
            run_id,
            experiment_id,
            format!("lost track of worker process {pid}: {err}"),
        ),
    }
}

/// The last stdout line that parses as a notice for this run.
async fn last_notice(
    stdout: ChildStdout,
    run_id: crate::registry::RunId,
) -> Option<CompletionNotice> {
    let mut lines = BufReader::new(stdout).lines();
    let mut last = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Ok(notice) = serde_json::from_str::<CompletionNotice>(line.trim()) {
                    if notice.run_id == run_id {
                        last = Some(notice);
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%run_id, error = %err, "failed reading worker stdout");
                break;
            }
        }
    }
    last
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "was killed by a signal".to_string(),
    }
}
