//! Per-run I/O pump.
//!
//! One pump per live run. It owns the process's stdio streams and is the
//! only place that emits the run's terminal event, so every run gets exactly
//! one regardless of how it ended.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::relay::{RelayEvent, RelayHub};
use crate::sandbox::RunningProcess;
use crate::session::{KillReason, SessionManager, SessionRef};

/// Read buffer for each output stream.
const READ_CHUNK_SIZE: usize = 4096;

pub(crate) struct PumpContext {
    pub session_id: String,
    pub session: SessionRef,
    pub sessions: Arc<SessionManager>,
    pub hub: Arc<RelayHub>,
    /// How long to wait for the exec client to die after a cancel.
    pub kill_grace: Duration,
}

/// Spawn the pump for a freshly started run.
pub(crate) fn spawn_pump(
    ctx: PumpContext,
    process: RunningProcess,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_pump(ctx, process, cancel))
}

async fn run_pump(ctx: PumpContext, process: RunningProcess, cancel: CancellationToken) {
    let RunningProcess {
        pid: _,
        mut stdin,
        stdout,
        stderr,
        waiter,
    } = process;

    // Fan-in: client input -> process stdin.
    let mut stdin_rx = ctx.hub.attach_stdin(&ctx.session_id);
    let stdin_session = ctx.session_id.clone();
    let stdin_task = tokio::spawn(async move {
        while let Some(data) = stdin_rx.recv().await {
            if stdin.write_all(data.as_bytes()).await.is_err()
                || stdin.flush().await.is_err()
            {
                debug!("Stdin pipe for session {} closed", stdin_session);
                break;
            }
        }
    });

    // Fan-out: process output -> stream clients.
    let stdout_task = spawn_reader(
        stdout,
        ctx.hub.clone(),
        ctx.sessions.clone(),
        ctx.session_id.clone(),
        false,
    );
    let stderr_task = spawn_reader(
        stderr,
        ctx.hub.clone(),
        ctx.sessions.clone(),
        ctx.session_id.clone(),
        true,
    );

    let exit_code = tokio::select! {
        code = waiter => code,
        _ = cancel.cancelled() => {
            // Teardown is in flight; give the exec client a grace period to
            // observe the in-container kill before giving up on it.
            debug!("Run for session {} cancelled, awaiting exit", ctx.session_id);
            -1
        }
    };

    // Drain remaining output; EOF arrives once the process is gone. Bounded
    // so a wedged exec client cannot pin the pump.
    for task in [stdout_task, stderr_task] {
        if tokio::time::timeout(ctx.kill_grace, task).await.is_err() {
            warn!(
                "Output drain for session {} exceeded grace period",
                ctx.session_id
            );
        }
    }
    stdin_task.abort();
    ctx.hub.detach_stdin(&ctx.session_id);

    // Exactly one terminal event per run, emitted here and nowhere else.
    // The session goes idle first so an execute arriving right after the
    // terminal event is not spuriously rejected as busy. Reason and idle
    // transition happen under a single lock acquisition so a reaper sweep
    // cannot slip a timeout reason in between and have it land on the
    // next run.
    let kill_reason = {
        let mut session = ctx.session.lock().await;
        let reason = session.take_kill_reason();
        session.mark_idle();
        reason
    };
    match kill_reason {
        None => {
            ctx.hub
                .broadcast(&ctx.session_id, RelayEvent::Exit { code: exit_code })
                .await;
        }
        Some(KillReason::Timeout { limit }) => {
            ctx.hub
                .broadcast(
                    &ctx.session_id,
                    RelayEvent::Error {
                        message: format!(
                            "execution timed out after {}s",
                            limit.as_secs()
                        ),
                    },
                )
                .await;
        }
        // The session itself is gone; clients get no synthetic event.
        Some(KillReason::Expired) | Some(KillReason::Ended) => {
            debug!("Run for session {} ended by teardown", ctx.session_id);
        }
    }
}

fn spawn_reader(
    mut stream: Box<dyn AsyncRead + Send + Unpin>,
    hub: Arc<RelayHub>,
    sessions: Arc<SessionManager>,
    session_id: String,
    is_stderr: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let event = if is_stderr {
                        RelayEvent::Stderr { data }
                    } else {
                        RelayEvent::Stdout { data }
                    };
                    // Output counts as activity for idle expiry.
                    sessions.touch(&session_id).await;
                    hub.broadcast(&session_id, event).await;
                }
                Err(e) => {
                    debug!("Output stream for session {} errored: {}", session_id, e);
                    break;
                }
            }
        }
    })
}
