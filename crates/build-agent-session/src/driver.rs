//! Moves bytes between a running task's terminal and its session.

use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use build_agent_core::TaskId;
use build_agent_pty::{ExitInfo, ExitWaiter};
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until, timeout},
};

use crate::session::Session;

const READ_CHUNK: usize = 4096;
const READ_QUEUE: usize = 64;

/// How long output may keep flowing after the process exited. A background
/// child holding the terminal open would otherwise keep the task running.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for an exit after the terminal could not be read.
const READ_FAILURE_GRACE: Duration = Duration::from_millis(500);

/// Linux and macOS report a closed slave side as `EIO` rather than EOF.
const EIO: i32 = 5;

enum ReadEvent {
    Data(Bytes),
    Failed(std::io::Error),
}

/// How a task's process ended.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskOutcome {
    /// `None` if the exit status could not be collected.
    pub exit: Option<ExitInfo>,
    /// Output could not be read and the process was killed.
    pub io_failed: bool,
}

impl TaskOutcome {
    pub(crate) fn succeeded(&self) -> bool {
        !self.io_failed && self.exit.is_some_and(|exit| exit.success)
    }
}

/// Start the threads serving a spawned task and the task that reports its
/// end to the session.
pub(crate) fn start(
    session: Arc<Session>,
    task_id: TaskId,
    output: Box<dyn Read + Send>,
    input: Box<dyn Write + Send>,
    input_rx: mpsc::Receiver<Bytes>,
    child: ExitWaiter,
) {
    spawn_writer(task_id, input, input_rx);
    let reads = spawn_reader(task_id, output);
    let exit = spawn_waiter(task_id, child);

    tokio::spawn(async move {
        let outcome = pump(&session, task_id, reads, exit).await;
        session.finish_task(task_id, outcome).await;
    });
}

fn spawn_reader(task_id: TaskId, mut output: Box<dyn Read + Send>) -> mpsc::Receiver<ReadEvent> {
    let (tx, rx) = mpsc::channel(READ_QUEUE);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if tx.blocking_send(ReadEvent::Data(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(EIO) => break,
                Err(e) => {
                    let _ = tx.blocking_send(ReadEvent::Failed(e));
                    break;
                }
            }
        }
        tracing::trace!(task_id, "Terminal reader finished");
    });
    rx
}

fn spawn_writer(task_id: TaskId, mut input: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        while let Some(bytes) = rx.blocking_recv() {
            if let Err(e) = input.write_all(&bytes).and_then(|()| input.flush()) {
                tracing::warn!(task_id, "Cannot write to terminal: {e}");
                break;
            }
        }
        tracing::trace!(task_id, "Terminal writer finished");
    });
}

fn spawn_waiter(task_id: TaskId, mut child: ExitWaiter) -> oneshot::Receiver<Option<ExitInfo>> {
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let exit = match child.wait() {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::warn!(task_id, "Cannot collect exit status: {e}");
                None
            }
        };
        let _ = tx.send(exit);
    });
    rx
}

/// Forward output until the terminal closes, then collect the exit.
async fn pump(
    session: &Session,
    task_id: TaskId,
    mut reads: mpsc::Receiver<ReadEvent>,
    mut exit_rx: oneshot::Receiver<Option<ExitInfo>>,
) -> TaskOutcome {
    let mut exit: Option<Option<ExitInfo>> = None;
    let mut drain_deadline: Option<Instant> = None;
    let mut read_failed = false;

    loop {
        let drain = async move {
            match drain_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            event = reads.recv() => match event {
                Some(ReadEvent::Data(bytes)) => session.forward_output(bytes).await,
                Some(ReadEvent::Failed(e)) => {
                    tracing::warn!(task_id, "Cannot read terminal: {e}");
                    read_failed = true;
                    break;
                }
                None => break,
            },
            result = &mut exit_rx, if exit.is_none() => {
                exit = Some(result.ok().flatten());
                drain_deadline = Some(Instant::now() + OUTPUT_DRAIN_TIMEOUT);
            }
            () = drain => {
                tracing::warn!(task_id, "Terminal still open after exit, leaving it behind");
                break;
            }
        }
    }

    if let Some(exit) = exit {
        return TaskOutcome {
            exit,
            io_failed: false,
        };
    }

    if read_failed {
        if let Ok(result) = timeout(READ_FAILURE_GRACE, &mut exit_rx).await {
            return TaskOutcome {
                exit: result.ok().flatten(),
                io_failed: false,
            };
        }
        session.abort_task(task_id);
        return TaskOutcome {
            exit: exit_rx.await.ok().flatten(),
            io_failed: true,
        };
    }

    TaskOutcome {
        exit: exit_rx.await.ok().flatten(),
        io_failed: false,
    }
}
