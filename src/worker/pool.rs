//! Worker pool.
//!
//! [`ProcessPool`] runs tasks in child processes started as
//! `<program> worker`. Each of `worker_count` slots owns at most one child,
//! feeds it submissions from a shared queue, and forwards every message the
//! child prints to the scheduler. After forwarding a finished-notice the slot
//! holds the child paused until the scheduler calls [`WorkerControl::resume`]
//! for that task.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{MessageError, PoolError, SignalError};
use crate::messaging::{Message, MessagePayload, TaskSubmission, WorkerInstruction};
use crate::scheduler::state::{TaskFinishType, TaskIdent};
use crate::worker::signal;

/// Grace period between SIGTERM and SIGKILL when stopping a worker.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Control over workers that already run a task.
pub trait WorkerControl: Send + Sync {
    /// Let the worker paused after finishing `ident` take its next task.
    fn resume(&self, ident: &TaskIdent);

    /// Send a termination signal to a worker process.
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;
}

/// A pool that accepts task submissions.
#[async_trait]
pub trait WorkerPool: WorkerControl {
    /// Queue a task. Never blocks; fails only when the pool cannot run tasks.
    fn submit(&self, submission: TaskSubmission) -> Result<(), PoolError>;

    /// Stop accepting work and stop all worker processes.
    async fn shutdown(&self);
}

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from("worker")],
        }
    }

    /// The running executable in worker mode.
    pub fn current_exe() -> Result<Self, PoolError> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

type ResumeMap = Arc<Mutex<HashMap<TaskIdent, oneshot::Sender<()>>>>;

/// Pool of worker processes.
pub struct ProcessPool {
    submissions: mpsc::UnboundedSender<TaskSubmission>,
    paused: ResumeMap,
    live_slots: Arc<AtomicUsize>,
    stop: watch::Sender<bool>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPool {
    /// Start the slots. Messages from workers go to `messages`.
    pub fn spawn(
        command: WorkerCommand,
        config: &SchedulerConfig,
        messages: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let (submissions, queue) = mpsc::unbounded_channel();
        let queue = Arc::new(tokio::sync::Mutex::new(queue));
        let paused: ResumeMap = Arc::new(Mutex::new(HashMap::new()));
        let live_slots = Arc::new(AtomicUsize::new(config.worker_count));
        let (stop, stop_rx) = watch::channel(false);

        let slots = (0..config.worker_count)
            .map(|index| {
                let slot = Slot {
                    index,
                    command: command.clone(),
                    reset_limit: config.worker_reset_limit,
                    queue: Arc::clone(&queue),
                    messages: messages.clone(),
                    paused: Arc::clone(&paused),
                    stop: stop_rx.clone(),
                };
                let live = Arc::clone(&live_slots);
                tokio::spawn(async move {
                    slot.run().await;
                    live.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        tracing::info!(
            workers = config.worker_count,
            program = %command.program.display(),
            "Worker pool started"
        );

        Self {
            submissions,
            paused,
            live_slots,
            stop,
            slots: Mutex::new(slots),
        }
    }

    /// Number of slots still able to run tasks.
    pub fn live_slots(&self) -> usize {
        self.live_slots.load(Ordering::SeqCst)
    }
}

impl WorkerControl for ProcessPool {
    fn resume(&self, ident: &TaskIdent) {
        let waiter = self
            .paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ident);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => tracing::debug!(task_ident = %ident, "No paused worker for task"),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        signal::terminate(pid)
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    fn submit(&self, submission: TaskSubmission) -> Result<(), PoolError> {
        if *self.stop.borrow() || self.live_slots() == 0 {
            return Err(PoolError::Closed);
        }
        self.submissions
            .send(submission)
            .map_err(|_| PoolError::Closed)
    }

    async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let slots = std::mem::take(&mut *self.slots.lock().unwrap_or_else(PoisonError::into_inner));
        for slot in slots {
            if let Err(e) = slot.await {
                tracing::error!("Worker slot task failed: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// One child process and its pipes.
struct WorkerProcess {
    child: Child,
    pid: u32,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    completed: usize,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> Result<Self, PoolError> {
        let spawn_error = |reason: String| PoolError::Spawn {
            program: command.program.display().to_string(),
            reason,
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_error("process exited immediately".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(pid = pid, "[worker] {}", line);
                }
            });
        }

        tracing::debug!(pid = pid, "Worker process spawned");
        Ok(Self {
            child,
            pid,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            completed: 0,
        })
    }

    async fn send(&mut self, instruction: &WorkerInstruction) -> Result<(), MessageError> {
        let mut line = instruction.to_line()?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Close stdin and let the worker exit on its own.
    async fn retire(self) {
        let WorkerProcess {
            mut child,
            pid,
            stdin,
            ..
        } = self;
        drop(stdin);
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid = pid, %status, "Worker process retired"),
            Ok(Err(e)) => tracing::warn!(pid = pid, "Failed to reap worker: {}", e),
            Err(_) => {
                tracing::warn!(pid = pid, "Worker did not exit after stdin closed, killing");
                let _ = child.kill().await;
            }
        }
    }

    /// SIGTERM, then SIGKILL after the grace period.
    async fn stop(self) {
        let WorkerProcess {
            mut child,
            pid,
            stdin,
            ..
        } = self;
        drop(stdin);
        if let Err(e) = signal::terminate(pid) {
            tracing::debug!(pid = pid, "SIGTERM not delivered: {}", e);
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(_) => tracing::info!(pid = pid, "Worker process stopped"),
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!(pid = pid, "Worker force killed");
            }
        }
    }

    /// Reap a worker whose stdout closed.
    async fn reap(mut self) {
        match self.child.wait().await {
            Ok(status) => tracing::warn!(pid = self.pid, %status, "Worker process exited"),
            Err(e) => tracing::warn!(pid = self.pid, "Failed to reap worker: {}", e),
        }
    }
}

/// How running one task on a worker ended.
enum RunOutcome {
    /// Finished-notice forwarded; the worker is paused.
    Finished(oneshot::Receiver<()>),
    /// The worker process went away.
    Died,
    /// The pool is stopping.
    Stopping,
}

struct Slot {
    index: usize,
    command: WorkerCommand,
    reset_limit: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskSubmission>>>,
    messages: mpsc::UnboundedSender<Message>,
    paused: ResumeMap,
    stop: watch::Receiver<bool>,
}

impl Slot {
    async fn run(mut self) {
        let mut worker: Option<WorkerProcess> = None;

        while let Some(submission) = self.next_submission().await {
            let ident = submission.task_ident.clone();

            let mut process = match worker.take() {
                Some(process) => process,
                None => match WorkerProcess::spawn(&self.command) {
                    Ok(process) => process,
                    Err(e) => {
                        tracing::error!(slot = self.index, task_ident = %ident, "{}", e);
                        self.finish_on_behalf(&ident);
                        return;
                    }
                },
            };

            match self.run_task(&mut process, submission).await {
                RunOutcome::Finished(resumed) => {
                    let released = tokio::select! {
                        r = resumed => r.is_ok(),
                        _ = self.stop.changed() => false,
                    };
                    if !released {
                        self.paused
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&ident);
                        process.stop().await;
                        return;
                    }
                    if let Err(e) = process.send(&WorkerInstruction::Resume).await {
                        tracing::warn!(pid = process.pid, "Failed to resume worker: {}", e);
                        process.reap().await;
                        continue;
                    }
                    process.completed += 1;
                    if process.completed >= self.reset_limit {
                        tracing::info!(
                            pid = process.pid,
                            completed = process.completed,
                            "Worker reached its task limit, recycling"
                        );
                        process.retire().await;
                    } else {
                        worker = Some(process);
                    }
                }
                RunOutcome::Died => {
                    tracing::error!(
                        slot = self.index,
                        pid = process.pid,
                        task_ident = %ident,
                        "Worker died while executing a task"
                    );
                    process.reap().await;
                    self.finish_on_behalf(&ident);
                }
                RunOutcome::Stopping => {
                    process.stop().await;
                    return;
                }
            }
        }

        if let Some(process) = worker {
            process.stop().await;
        }
        tracing::debug!(slot = self.index, "Worker slot stopped");
    }

    async fn next_submission(&mut self) -> Option<TaskSubmission> {
        if *self.stop.borrow() {
            return None;
        }
        let queue = Arc::clone(&self.queue);
        tokio::select! {
            submission = async move { queue.lock().await.recv().await } => submission,
            _ = self.stop.changed() => None,
        }
    }

    async fn run_task(&mut self, process: &mut WorkerProcess, submission: TaskSubmission) -> RunOutcome {
        let ident = submission.task_ident.clone();
        if let Err(e) = process.send(&WorkerInstruction::Execute(submission)).await {
            tracing::warn!(pid = process.pid, task_ident = %ident, "Failed to hand task to worker: {}", e);
            return RunOutcome::Died;
        }

        loop {
            let line = tokio::select! {
                line = process.stdout.next_line() => line,
                _ = self.stop.changed() => return RunOutcome::Stopping,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => return RunOutcome::Died,
                Err(e) => {
                    tracing::warn!(pid = process.pid, "Failed to read from worker: {}", e);
                    return RunOutcome::Died;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = match Message::from_line(&line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(pid = process.pid, "Dropping undecodable worker message: {}", e);
                    continue;
                }
            };

            let finished = message.task_ident == ident
                && matches!(message.payload, MessagePayload::TaskFinished(_));
            let resumed = finished.then(|| {
                let (tx, rx) = oneshot::channel();
                self.paused
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(ident.clone(), tx);
                rx
            });

            self.forward(message);
            if let Some(rx) = resumed {
                return RunOutcome::Finished(rx);
            }
        }
    }

    /// Report a task as crashed when its worker could not finish it.
    fn finish_on_behalf(&self, ident: &TaskIdent) {
        self.forward(Message::finished(
            ident.clone(),
            TaskFinishType::UnhandledException,
            None,
        ));
    }

    fn forward(&self, message: Message) {
        if self.messages.send(message).is_err() {
            tracing::debug!(slot = self.index, "Scheduler gone, dropping worker message");
        }
    }
}
