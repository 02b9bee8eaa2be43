//! A named terminal session running one task at a time.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use build_agent_core::{
    OutputBroadcaster, ReplayFrom, StatusBroadcaster, StatusEvent, SubscriberId, TaskId,
    TaskStatus, TranscriptLog, status::now_millis,
};
use build_agent_pty::{ProcessControl, PtyDimensions, SpawnError, SpawnedProcess, Spawner};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::{ControlPolicy, SessionConfig},
    driver::{self, TaskOutcome},
    event::EventFeed,
    observer::{
        ControlAttachment, ObserverGuard, ObserverId, SpectateAttachment, StatusAttachment,
    },
};

/// Input chunks queued towards a process before writers wait.
const INPUT_QUEUE: usize = 64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Task {0} is still running")]
    AlreadyRunning(TaskId),
    #[error("Control is held by another observer")]
    ControlAlreadyHeld,
    #[error("Observer does not hold control")]
    NotController,
    #[error("No task is running")]
    NoRunningTask,
    #[error("Process input is closed")]
    InputClosed,
    #[error("Spawn failed: {0}")]
    Spawn(#[from] SpawnError),
    #[error("Terminal error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session closed")]
    Closed,
}

pub(crate) type DestroyHook = Box<dyn FnOnce(&Session) + Send>;

struct ActiveTask {
    id: TaskId,
    input: Option<mpsc::Sender<Bytes>>,
    control: Option<ProcessControl>,
    kill_requested: bool,
}

struct ControlSlot {
    holder: ObserverId,
    preempt: oneshot::Sender<()>,
}

struct State {
    status: TaskStatus,
    /// Current or most recent task.
    task: Option<ActiveTask>,
    control: Option<ControlSlot>,
    observers: usize,
    /// Bumped by every execute and attach; a scheduled destroy only fires
    /// if it is unchanged.
    epoch: u64,
    pty_size: PtyDimensions,
    destroyed: bool,
    on_destroy: Option<DestroyHook>,
}

impl State {
    fn busy_task(&self) -> Option<TaskId> {
        if self.status.is_terminal() {
            return None;
        }
        self.task.as_ref().map(|task| task.id)
    }

    fn check_holder(&self, holder: ObserverId) -> Result<(), SessionError> {
        match &self.control {
            Some(slot) if slot.holder == holder => Ok(()),
            _ => Err(SessionError::NotController),
        }
    }

    fn running_task(&mut self) -> Result<&mut ActiveTask, SessionError> {
        if self.busy_task().is_none() {
            return Err(SessionError::NoRunningTask);
        }
        self.task.as_mut().ok_or(SessionError::NoRunningTask)
    }
}

/// One context's terminal.
///
/// Tasks run strictly one after another. Output goes to every attached
/// observer and to the transcript; status transitions go to status
/// listeners. The session destroys itself once it has been idle with no
/// new work for the configured grace period.
pub struct Session {
    context: String,
    created_at: i64,
    config: Arc<SessionConfig>,
    spawner: Arc<dyn Spawner>,
    output: OutputBroadcaster,
    status: StatusBroadcaster,
    transcript: TranscriptLog,
    feed: Option<EventFeed>,
    state: Mutex<State>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context)
            .field("created_at", &self.created_at)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        context: &str,
        config: Arc<SessionConfig>,
        spawner: Arc<dyn Spawner>,
        feed: Option<EventFeed>,
        on_destroy: Option<DestroyHook>,
    ) -> Arc<Self> {
        tracing::info!(context, "Creating session");
        Arc::new(Self {
            context: context.to_string(),
            created_at: now_millis(),
            output: config.output_broadcaster(),
            status: StatusBroadcaster::new(),
            transcript: config.transcript_for(context),
            feed,
            state: Mutex::new(State {
                status: TaskStatus::Created,
                task: None,
                control: None,
                observers: 0,
                epoch: 0,
                pty_size: config.pty_size,
                destroyed: false,
                on_destroy,
            }),
            config,
            spawner,
        })
    }

    /// A session not owned by any registry.
    #[must_use]
    pub fn standalone(
        context: &str,
        config: Arc<SessionConfig>,
        spawner: Arc<dyn Spawner>,
    ) -> Arc<Self> {
        Self::new(context, config, spawner, None, None)
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Creation time, Unix epoch milliseconds.
    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Status of the current or most recent task.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Id of the current or most recent task.
    #[must_use]
    pub fn current_task(&self) -> Option<TaskId> {
        self.state.lock().task.as_ref().map(|task| task.id)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers
    }

    #[must_use]
    pub fn transcript_path(&self) -> Option<&Path> {
        self.transcript.path()
    }

    /// Output broadcaster of this session.
    #[must_use]
    pub const fn output(&self) -> &OutputBroadcaster {
        &self.output
    }

    /// Run `command_line` as the session's next task.
    ///
    /// Returns once the process is running; completion is reported through
    /// status listeners.
    ///
    /// # Errors
    /// Returns `AlreadyRunning` while a task is active, `Spawn` if the
    /// process cannot be started (the session is then destroyed), or
    /// `Closed` if the session is gone.
    pub async fn execute(self: &Arc<Self>, command_line: &str) -> Result<TaskId, SessionError> {
        let (task_id, size) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(SessionError::Closed);
            }
            if let Some(running) = state.busy_task() {
                return Err(SessionError::AlreadyRunning(running));
            }
            let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
            state.status = TaskStatus::Created;
            state.epoch += 1;
            state.task = Some(ActiveTask {
                id,
                input: None,
                control: None,
                kill_requested: false,
            });
            (id, state.pty_size)
        };

        tracing::info!(context = %self.context, task_id, command = command_line, "Executing");

        let process = match self.spawner.spawn(command_line, size).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(context = %self.context, task_id, "Cannot start task: {e}");
                self.transcript.log_command(command_line).await;
                self.transcript.log_status(TaskStatus::Failed).await;
                {
                    let mut state = self.state.lock();
                    state.status = TaskStatus::Failed;
                    self.emit(&StatusEvent::new(
                        task_id,
                        TaskStatus::Created,
                        TaskStatus::Failed,
                    ));
                }
                self.destroy().await;
                return Err(e.into());
            }
        };

        let SpawnedProcess {
            pid,
            output,
            input,
            child,
            mut control,
        } = process;
        self.transcript.log_command(command_line).await;

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        {
            let mut state = self.state.lock();
            state.status = TaskStatus::Running;
            if let Some(task) = state.task.as_mut().filter(|task| task.id == task_id) {
                if task.kill_requested {
                    if let Err(e) = control.kill() {
                        tracing::warn!(task_id, "Cannot kill task: {e}");
                    }
                }
                task.input = Some(input_tx);
                task.control = Some(control);
            }
            self.emit(&StatusEvent::new(
                task_id,
                TaskStatus::Created,
                TaskStatus::Running,
            ));
        }
        tracing::debug!(context = %self.context, task_id, ?pid, "Task running");

        driver::start(Arc::clone(self), task_id, output, input, input_rx, child);
        Ok(task_id)
    }

    /// Attach as the controlling observer.
    ///
    /// Retained output selected by `replay` is delivered before live output.
    ///
    /// # Errors
    /// Returns `ControlAlreadyHeld` under the reject policy while another
    /// observer has control, or `Closed` if the session is gone.
    pub fn attach_control(
        self: &Arc<Self>,
        replay: ReplayFrom,
    ) -> Result<ControlAttachment, SessionError> {
        let holder = ObserverId::new();
        let (preempt_tx, preempted) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(SessionError::Closed);
            }
            if let Some(previous) = state.control.take() {
                match self.config.control_policy {
                    ControlPolicy::Reject => {
                        state.control = Some(previous);
                        return Err(SessionError::ControlAlreadyHeld);
                    }
                    ControlPolicy::Preempt => {
                        tracing::info!(
                            context = %self.context,
                            previous = %previous.holder,
                            next = %holder,
                            "Control preempted"
                        );
                        let _ = previous.preempt.send(());
                    }
                }
            }
            state.control = Some(ControlSlot {
                holder,
                preempt: preempt_tx,
            });
            state.observers += 1;
            state.epoch += 1;
        }

        let output = self.output.attach(self.replay_start(replay));
        let guard = ObserverGuard::new(Arc::clone(self), Some(output.id()), None, Some(holder));
        Ok(ControlAttachment {
            holder,
            output,
            preempted,
            guard,
        })
    }

    /// Attach as a read-only observer.
    ///
    /// # Errors
    /// Returns `Closed` if the session is gone.
    pub fn attach_spectate(
        self: &Arc<Self>,
        replay: ReplayFrom,
    ) -> Result<SpectateAttachment, SessionError> {
        self.register_observer()?;
        let output = self.output.attach(self.replay_start(replay));
        let guard = ObserverGuard::new(Arc::clone(self), Some(output.id()), None, None);
        Ok(SpectateAttachment { output, guard })
    }

    /// Attach a status listener. Only transitions from now on are delivered.
    ///
    /// # Errors
    /// Returns `Closed` if the session is gone.
    pub fn attach_status(self: &Arc<Self>) -> Result<StatusAttachment, SessionError> {
        self.register_observer()?;
        let events = self.status.attach();
        let guard = ObserverGuard::new(Arc::clone(self), None, Some(events.id()), None);
        Ok(StatusAttachment { events, guard })
    }

    /// Forward keyboard input to the running task.
    ///
    /// # Errors
    /// Returns `NotController` for a stale holder, `NoRunningTask` when
    /// idle, or `InputClosed` once the process stopped reading.
    pub async fn write_input(&self, holder: ObserverId, bytes: Bytes) -> Result<(), SessionError> {
        let input = {
            let mut state = self.state.lock();
            state.check_holder(holder)?;
            state
                .running_task()?
                .input
                .clone()
                .ok_or(SessionError::NoRunningTask)?
        };
        input.send(bytes).await.map_err(|_| SessionError::InputClosed)
    }

    /// Resize the terminal. The size also applies to later tasks.
    ///
    /// # Errors
    /// Returns `NotController` for a stale holder or `Io` if the terminal
    /// rejects the size.
    pub fn resize(&self, holder: ObserverId, size: PtyDimensions) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.check_holder(holder)?;
        state.pty_size = size;
        if let Some(control) = state.task.as_ref().and_then(|task| task.control.as_ref()) {
            control.resize(size)?;
        }
        Ok(())
    }

    /// Kill the running task. Its final status is `KILLED`.
    ///
    /// # Errors
    /// Returns `NotController` for a stale holder or `NoRunningTask` when
    /// idle.
    pub fn kill(&self, holder: ObserverId) -> Result<TaskId, SessionError> {
        let mut state = self.state.lock();
        state.check_holder(holder)?;
        let task = state.running_task()?;
        task.kill_requested = true;
        // Still spawning: killed as soon as the process exists.
        if let Some(control) = task.control.as_mut() {
            control.kill()?;
        }
        tracing::info!(context = %self.context, task_id = task.id, "Kill requested");
        Ok(task.id)
    }

    /// Kill whatever is running, regardless of who holds control.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        let Ok(task) = state.running_task() else {
            return;
        };
        task.kill_requested = true;
        if let Some(control) = task.control.as_mut() {
            if let Err(e) = control.kill() {
                tracing::warn!(task_id = task.id, "Cannot kill task: {e}");
            }
        }
    }

    /// Kill a task whose output can no longer be read. Its status is
    /// decided by the exit, not by a kill request.
    pub(crate) fn abort_task(&self, task_id: TaskId) {
        let mut state = self.state.lock();
        let Some(task) = state.task.as_mut().filter(|task| task.id == task_id) else {
            return;
        };
        if let Some(control) = task.control.as_mut() {
            if let Err(e) = control.kill() {
                tracing::warn!(task_id, "Cannot kill task: {e}");
            }
        }
    }

    pub(crate) async fn forward_output(&self, bytes: Bytes) {
        self.output.publish(bytes.clone());
        self.transcript.log_output(&bytes).await;
    }

    pub(crate) async fn finish_task(self: &Arc<Self>, task_id: TaskId, outcome: TaskOutcome) {
        let kill_requested = self
            .state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| task.id == task_id && task.kill_requested);
        let status = if kill_requested {
            TaskStatus::Killed
        } else if outcome.succeeded() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        tracing::info!(
            context = %self.context,
            task_id,
            exit_code = outcome.exit.map(|exit| exit.code),
            %status,
            "Task finished"
        );
        // Trailer first: a listener seeing the end may read the transcript.
        self.transcript.log_status(status).await;

        let epoch = {
            let mut state = self.state.lock();
            state.status = status;
            if let Some(task) = state.task.as_mut().filter(|task| task.id == task_id) {
                task.input = None;
                task.control = None;
            }
            self.emit(&StatusEvent::new(task_id, TaskStatus::Running, status));
            state.epoch
        };
        self.schedule_destroy(epoch);
    }

    /// Publish a transition. Callers hold the state lock so transitions
    /// of consecutive tasks cannot interleave.
    fn emit(&self, event: &StatusEvent) {
        self.status.publish(event);
        if let Some(feed) = &self.feed {
            feed.send(&self.context, event);
        }
    }

    fn register_observer(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(SessionError::Closed);
        }
        state.observers += 1;
        state.epoch += 1;
        Ok(())
    }

    fn replay_start(&self, requested: ReplayFrom) -> ReplayFrom {
        if self.config.replay_enabled {
            requested
        } else {
            ReplayFrom::Live
        }
    }

    pub(crate) fn release_observer(
        self: &Arc<Self>,
        output: Option<SubscriberId>,
        status: Option<SubscriberId>,
        control: Option<ObserverId>,
    ) {
        if let Some(id) = output {
            self.output.detach(id);
        }
        if let Some(id) = status {
            self.status.detach(id);
        }

        let idle_epoch = {
            let mut state = self.state.lock();
            if let Some(holder) = control {
                if state.control.as_ref().is_some_and(|slot| slot.holder == holder) {
                    state.control = None;
                }
            }
            state.observers = state.observers.saturating_sub(1);
            (state.observers == 0 && !state.destroyed && state.busy_task().is_none())
                .then_some(state.epoch)
        };
        if let Some(epoch) = idle_epoch {
            self.schedule_destroy(epoch);
        }
    }

    fn schedule_destroy(self: &Arc<Self>, epoch: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(context = %self.context, "No runtime, session left for its owner");
            return;
        };
        let session = Arc::clone(self);
        let grace = self.config.destroy_grace;
        runtime.spawn(async move {
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            if session.idle_since(epoch) {
                session.destroy().await;
            }
        });
    }

    fn idle_since(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        !state.destroyed && state.epoch == epoch && state.busy_task().is_none()
    }

    /// Destroy the session: it leaves its registry, every observer stream
    /// ends and the transcript is closed. Safe to call more than once.
    pub async fn destroy(&self) {
        let hook = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.control = None;
            state.on_destroy.take()
        };
        // Leave the registry first so no new observer can find this session.
        if let Some(hook) = hook {
            hook(self);
        }
        self.output.close();
        self.status.close();
        self.transcript.close().await;
        tracing::info!(context = %self.context, "Session destroyed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use build_agent_pty::PtySpawner;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh() -> Arc<dyn Spawner> {
        Arc::new(PtySpawner::new().with_shell(PathBuf::from("/bin/sh")))
    }

    fn session_with(config: SessionConfig) -> Arc<Session> {
        Session::standalone("/test", Arc::new(config), sh())
    }

    fn session() -> Arc<Session> {
        session_with(SessionConfig::default())
    }

    async fn wait_for_end(attachment: &mut StatusAttachment, task_id: TaskId) -> StatusEvent {
        timeout(WAIT, async {
            loop {
                let event = attachment.events.recv().await.expect("expected Some");
                if event.task_id == task_id && event.new_status.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn runs_task_to_completion_with_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_with(SessionConfig {
            log_folder: Some(dir.path().to_path_buf()),
            ..SessionConfig::default()
        });
        let mut status = session.attach_status().unwrap();
        let mut spectator = session.attach_spectate(ReplayFrom::Live).unwrap();

        let task_id = assert_ok!(session.execute("echo hi").await);
        let running = status.events.recv().await.expect("expected Some");
        assert_eq!((running.task_id, running.new_status), (task_id, TaskStatus::Running));
        assert_eq!(running.previous_status, TaskStatus::Created);

        let end = wait_for_end(&mut status, task_id).await;
        assert_eq!(end.previous_status, TaskStatus::Running);
        assert_eq!(end.new_status, TaskStatus::Completed);
        assert_eq!(session.status(), TaskStatus::Completed);

        let mut seen = Vec::new();
        while let Ok(Some(frame)) =
            timeout(Duration::from_millis(200), spectator.output.recv()).await
        {
            seen.extend_from_slice(&frame.data);
        }
        assert!(String::from_utf8_lossy(&seen).contains("hi"));

        let transcript = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(transcript.starts_with("% echo hi\r\n"));
        assert!(transcript.contains("hi"));
        assert!(transcript.ends_with("# Finished with status: COMPLETED\r\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_task() {
        let session = session();
        let mut status = session.attach_status().unwrap();
        let task_id = assert_ok!(session.execute("exit 3").await);
        let end = wait_for_end(&mut status, task_id).await;
        assert_eq!(end.new_status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn sequential_tasks_get_distinct_ids() {
        let session = session();
        let mut status = session.attach_status().unwrap();

        let first = assert_ok!(session.execute("true").await);
        wait_for_end(&mut status, first).await;
        let second = assert_ok!(session.execute("true").await);
        wait_for_end(&mut status, second).await;

        assert_ne!(first, second);
        assert_eq!(session.current_task(), Some(second));
    }

    #[tokio::test]
    async fn second_execute_is_refused_while_running_and_kill_ends_it() {
        let session = session();
        let control = session.attach_control(ReplayFrom::Live).unwrap();
        let mut status = session.attach_status().unwrap();

        let task_id = assert_ok!(session.execute("sleep 30").await);
        assert!(matches!(
            session.execute("true").await,
            Err(SessionError::AlreadyRunning(id)) if id == task_id
        ));

        assert_eq!(session.kill(control.holder).unwrap(), task_id);
        let end = wait_for_end(&mut status, task_id).await;
        assert_eq!(end.new_status, TaskStatus::Killed);
        assert!(matches!(
            session.kill(control.holder),
            Err(SessionError::NoRunningTask)
        ));
    }

    #[tokio::test]
    async fn input_reaches_the_process() {
        let session = session();
        let mut control = session.attach_control(ReplayFrom::Live).unwrap();
        let mut status = session.attach_status().unwrap();

        let task_id = assert_ok!(session.execute("read line; echo got-$line").await);
        session
            .write_input(control.holder, Bytes::from_static(b"ping\n"))
            .await
            .unwrap();
        wait_for_end(&mut status, task_id).await;

        let mut seen = Vec::new();
        while let Ok(Some(frame)) =
            timeout(Duration::from_millis(200), control.output.recv()).await
        {
            seen.extend_from_slice(&frame.data);
        }
        assert!(String::from_utf8_lossy(&seen).contains("got-ping"));
    }

    #[tokio::test]
    async fn newer_controller_preempts_older_one() {
        let session = session();
        let first = session.attach_control(ReplayFrom::Live).unwrap();
        let second = session.attach_control(ReplayFrom::Live).unwrap();

        timeout(WAIT, first.preempted).await.unwrap().unwrap();
        assert!(matches!(
            session.resize(first.holder, PtyDimensions { cols: 100, rows: 30 }),
            Err(SessionError::NotController)
        ));
        session
            .resize(second.holder, PtyDimensions { cols: 100, rows: 30 })
            .unwrap();

        // The preempted guard going away must not release the new holder.
        drop(first.guard);
        session
            .resize(second.holder, PtyDimensions { cols: 90, rows: 30 })
            .unwrap();
    }

    #[tokio::test]
    async fn reject_policy_refuses_second_controller() {
        let session = session_with(SessionConfig {
            control_policy: ControlPolicy::Reject,
            ..SessionConfig::default()
        });
        let first = session.attach_control(ReplayFrom::Live).unwrap();
        assert!(matches!(
            session.attach_control(ReplayFrom::Live),
            Err(SessionError::ControlAlreadyHeld)
        ));

        drop(first);
        assert!(session.attach_control(ReplayFrom::Live).is_ok());
    }

    #[tokio::test]
    async fn write_without_task_is_refused() {
        let session = session();
        let control = session.attach_control(ReplayFrom::Live).unwrap();
        assert!(matches!(
            session.write_input(control.holder, Bytes::from_static(b"x")).await,
            Err(SessionError::NoRunningTask)
        ));
    }

    #[tokio::test]
    async fn closing_control_does_not_stop_the_task() {
        let session = session();
        let mut status = session.attach_status().unwrap();
        let control = session.attach_control(ReplayFrom::Live).unwrap();

        let task_id = assert_ok!(session.execute("sleep 0.2").await);
        drop(control);

        let end = wait_for_end(&mut status, task_id).await;
        assert_eq!(end.new_status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn late_spectator_replays_earlier_output() {
        let session = session();
        let mut status = session.attach_status().unwrap();
        let task_id = assert_ok!(session.execute("printf abc").await);
        wait_for_end(&mut status, task_id).await;

        let spectator = session.attach_spectate(ReplayFrom::Start).unwrap();
        let replayed: Vec<u8> = spectator
            .output
            .replay()
            .iter()
            .flat_map(|frame| frame.data.iter().copied())
            .collect();
        assert!(String::from_utf8_lossy(&replayed).contains("abc"));
        assert!(!spectator.output.gap());
    }

    #[tokio::test]
    async fn spawn_failure_reports_failed_and_destroys() {
        let spawner: Arc<dyn Spawner> =
            Arc::new(PtySpawner::new().with_shell(PathBuf::from("/no/such/shell")));
        let session = Session::standalone("/broken", Arc::new(SessionConfig::default()), spawner);
        let mut status = session.attach_status().unwrap();

        assert!(matches!(
            session.execute("true").await,
            Err(SessionError::Spawn(_))
        ));
        let event = status.events.recv().await.expect("expected Some");
        assert_eq!(
            (event.previous_status, event.new_status),
            (TaskStatus::Created, TaskStatus::Failed)
        );
        assert!(status.events.recv().await.is_none());
        assert!(session.is_destroyed());
        assert!(matches!(session.attach_status(), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn idle_session_is_destroyed_after_grace() {
        let session = session_with(SessionConfig {
            destroy_grace: Duration::from_millis(50),
            ..SessionConfig::default()
        });
        let mut status = session.attach_status().unwrap();
        let task_id = assert_ok!(session.execute("true").await);
        wait_for_end(&mut status, task_id).await;

        // Stream ends once the session is destroyed.
        assert!(timeout(WAIT, status.events.recv()).await.unwrap().is_none());
        assert!(session.is_destroyed());
    }

    #[tokio::test]
    async fn new_work_within_grace_keeps_session_alive() {
        let session = session_with(SessionConfig {
            destroy_grace: Duration::from_millis(300),
            ..SessionConfig::default()
        });
        let mut status = session.attach_status().unwrap();
        let first = assert_ok!(session.execute("true").await);
        wait_for_end(&mut status, first).await;

        let second = assert_ok!(session.execute("sleep 0.5").await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!session.is_destroyed());
        wait_for_end(&mut status, second).await;
    }
}
