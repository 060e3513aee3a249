//! Task registry and the periodic coordination tick.
//!
//! `Scheduler` is synchronous and owned by exactly one caller, which makes
//! each tick the single writer of the registry. See [`super::handle`] for the
//! async task that owns it in the daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::commands::request::{AuthUser, CommandRequest};
use crate::config::SchedulerConfig;
use crate::error::{PoolError, TaskError};
use crate::messaging::{Message, MessagePayload};
use crate::scheduler::clock::Clock;
use crate::scheduler::state::{TaskIdent, TaskKillReason, TaskState};
use crate::scheduler::task::{Task, TaskSnapshot};
use crate::worker::pool::WorkerPool;

type IdentGenerator = Box<dyn FnMut() -> TaskIdent + Send>;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Messages drained and routed.
    pub messages: usize,
    /// Tasks handed to the worker pool.
    pub submitted: usize,
    /// Executing tasks flagged for killing after going silent.
    pub timed_out: usize,
    /// Finished tasks dropped because nobody collected them.
    pub abandoned: usize,
    /// Kill requests applied.
    pub killed: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    tasks: HashMap<TaskIdent, Task>,
    /// Tasks in CREATED state, oldest first.
    pending: VecDeque<TaskIdent>,
    pool: Arc<dyn WorkerPool>,
    messages: mpsc::UnboundedReceiver<Message>,
    clock: Arc<dyn Clock>,
    generate_ident: IdentGenerator,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<dyn WorkerPool>,
        messages: mpsc::UnboundedReceiver<Message>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
            pending: VecDeque::new(),
            pool,
            messages,
            clock,
            generate_ident: Box::new(TaskIdent::generate),
        }
    }

    /// Replace the identifier source.
    pub fn with_ident_generator(
        mut self,
        generator: impl FnMut() -> TaskIdent + Send + 'static,
    ) -> Self {
        self.generate_ident = Box::new(generator);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of tasks in the registry.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Register a new task in CREATED state.
    pub fn new_task(&mut self, command: CommandRequest, acting_user: AuthUser) -> TaskIdent {
        let ident = loop {
            let candidate = (self.generate_ident)();
            if !self.tasks.contains_key(&candidate) {
                break candidate;
            }
            tracing::debug!(task_ident = %candidate, "Task identifier collision, retrying");
        };

        tracing::info!(
            task_ident = %ident,
            command = %command.name,
            user = %acting_user.username,
            "Task created"
        );
        let task = Task::new(ident.clone(), command, acting_user, self.clock.now());
        self.tasks.insert(ident.clone(), task);
        self.pending.push_back(ident.clone());
        ident
    }

    /// Current state of a task. A FINISHED task is removed by this call, so
    /// its result is delivered at most once.
    pub fn get_task(&mut self, ident: &TaskIdent) -> Result<TaskSnapshot, TaskError> {
        let task = self.tasks.get(ident).ok_or_else(|| not_found(ident))?;
        let snapshot = task.snapshot();
        if snapshot.state.is_finished() {
            self.tasks.remove(ident);
            tracing::debug!(task_ident = %ident, "Finished task retrieved and removed");
        }
        Ok(snapshot)
    }

    /// Like [`Self::get_task`], but only the task's own user may see it.
    pub fn get_task_for(
        &mut self,
        ident: &TaskIdent,
        requester: &AuthUser,
    ) -> Result<TaskSnapshot, TaskError> {
        let owned = self
            .tasks
            .get(ident)
            .is_some_and(|task| task.acting_user().username == requester.username);
        if !owned {
            return Err(not_found(ident));
        }
        self.get_task(ident)
    }

    /// Flag a task for killing. Takes effect on the next tick.
    pub fn kill_task(&mut self, ident: &TaskIdent, reason: TaskKillReason) -> Result<(), TaskError> {
        let task = self.tasks.get_mut(ident).ok_or_else(|| not_found(ident))?;
        tracing::info!(task_ident = %ident, reason = %reason, "Kill requested");
        task.request_kill(reason);
        Ok(())
    }

    /// One coordination pass.
    ///
    /// Errors only when the worker pool refuses a submission, which the
    /// owner must treat as fatal.
    pub fn tick(&mut self) -> Result<TickSummary, PoolError> {
        let now = self.clock.now();
        let mut summary = TickSummary {
            messages: self.drain_messages(now),
            ..Default::default()
        };

        summary.submitted = self.schedule()?;

        let unresponsive = self.config.task_unresponsive_timeout;
        for task in self.tasks.values_mut() {
            if !task.is_kill_requested() && task.is_defunct(unresponsive, now) {
                tracing::warn!(task_ident = %task.ident(), "Task unresponsive, killing");
                task.request_kill(TaskKillReason::CompletionTimeout);
                summary.timed_out += 1;
            }
        }

        let abandoned = self.config.task_abandoned_timeout;
        let before = self.tasks.len();
        self.tasks.retain(|ident, task| {
            let keep = !task.is_abandoned(abandoned, now);
            if !keep {
                tracing::info!(task_ident = %ident, "Removing abandoned task");
            }
            keep
        });
        summary.abandoned = before - self.tasks.len();

        for task in self.tasks.values_mut() {
            if task.is_kill_requested() && !task.state().is_finished() {
                if let Err(e) = task.kill(&*self.pool, now) {
                    tracing::error!(task_ident = %task.ident(), "Kill failed: {}", e);
                }
                summary.killed += 1;
            }
        }

        Ok(summary)
    }

    /// Stop the worker pool.
    pub async fn shutdown(self) {
        let pool = Arc::clone(&self.pool);
        drop(self);
        pool.shutdown().await;
    }

    /// Route the messages present at the start of the tick.
    fn drain_messages(&mut self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let available = self.messages.len();
        let mut routed = 0;
        while routed < available {
            let Ok(message) = self.messages.try_recv() else {
                break;
            };
            self.route(message, now);
            routed += 1;
        }
        routed
    }

    fn route(&mut self, message: Message, now: chrono::DateTime<chrono::Utc>) {
        let Message {
            task_ident,
            payload,
        } = message;

        let Some(task) = self.tasks.get_mut(&task_ident) else {
            self.route_orphan(&task_ident, payload);
            return;
        };

        match task.receive_message(payload, &*self.pool, now) {
            Ok(()) => {}
            Err(e @ TaskError::UnknownMessage { .. }) => {
                tracing::error!(task_ident = %task_ident, "{}", e);
                task.request_kill(TaskKillReason::InternalMessagingError);
            }
            Err(e) => {
                tracing::error!(task_ident = %task_ident, "Message rejected: {}", e);
            }
        }
    }

    /// Messages for tasks no longer in the registry. Workers still get
    /// released or stopped so none is left paused.
    fn route_orphan(&self, ident: &TaskIdent, payload: MessagePayload) {
        tracing::warn!(task_ident = %ident, kind = payload.kind(), "Message for unknown task discarded");
        match payload {
            MessagePayload::TaskExecuted(notice) => {
                if let Err(e) = self.pool.terminate(notice.worker_pid) {
                    tracing::debug!(task_ident = %ident, "{}", e);
                }
            }
            MessagePayload::TaskFinished(_) => self.pool.resume(ident),
            _ => {}
        }
    }

    /// Submit CREATED tasks in creation order.
    fn schedule(&mut self) -> Result<usize, PoolError> {
        let mut submitted = 0;
        while let Some(ident) = self.pending.pop_front() {
            let Some(task) = self.tasks.get_mut(&ident) else {
                continue;
            };
            if task.state() != TaskState::Created || task.is_kill_requested() {
                continue;
            }
            if let Err(e) = self.pool.submit(task.submission()) {
                tracing::error!(task_ident = %ident, "Worker pool rejected task: {}", e);
                self.pending.push_front(ident);
                return Err(e);
            }
            if let Err(e) = task.transition_to(TaskState::Queued) {
                tracing::error!(task_ident = %ident, "{}", e);
            }
            submitted += 1;
        }
        Ok(submitted)
    }
}

fn not_found(ident: &TaskIdent) -> TaskError {
    TaskError::NotFound {
        ident: ident.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::SignalError;
    use crate::reports::ReportItem;
    use crate::scheduler::clock::ManualClock;
    use crate::scheduler::state::TaskFinishType;
    use crate::worker::pool::WorkerControl;

    /// In-memory pool recording every call.
    #[derive(Default)]
    pub(crate) struct FakePool {
        pub refuse: AtomicBool,
        pub gone: AtomicBool,
        pub submitted: Mutex<Vec<TaskIdent>>,
        pub terminated: Mutex<Vec<u32>>,
        pub resumed: Mutex<Vec<TaskIdent>>,
        pub shut_down: AtomicBool,
    }

    impl WorkerControl for FakePool {
        fn resume(&self, ident: &TaskIdent) {
            self.resumed.lock().unwrap().push(ident.clone());
        }

        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            self.terminated.lock().unwrap().push(pid);
            if self.gone.load(Ordering::SeqCst) {
                Err(SignalError::ProcessGone { pid })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl WorkerPool for FakePool {
        fn submit(&self, submission: crate::messaging::TaskSubmission) -> Result<(), PoolError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            self.submitted.lock().unwrap().push(submission.task_ident);
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) struct Fixture {
        pub scheduler: Scheduler,
        pub pool: Arc<FakePool>,
        pub clock: ManualClock,
        pub worker: mpsc::UnboundedSender<Message>,
    }

    pub(crate) fn fixture() -> Fixture {
        let pool = Arc::new(FakePool::default());
        let clock = ManualClock::default();
        let (worker, messages) = mpsc::unbounded_channel();
        let config = SchedulerConfig {
            task_unresponsive_timeout: Duration::from_secs(600),
            task_abandoned_timeout: Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&pool) as Arc<dyn WorkerPool>,
            messages,
            Arc::new(clock.clone()),
        );
        Fixture {
            scheduler,
            pool,
            clock,
            worker,
        }
    }

    fn admin() -> AuthUser {
        AuthUser::new("hacluster", &["haclient"])
    }

    impl Fixture {
        fn create(&mut self) -> TaskIdent {
            self.scheduler.new_task(CommandRequest::new("debug.echo"), admin())
        }

        fn send(&self, message: Message) {
            self.worker.send(message).unwrap();
        }

        fn state(&self, ident: &TaskIdent) -> TaskState {
            self.scheduler.tasks[ident].state()
        }

        /// Created task, ticked into EXECUTED on `pid`.
        fn executing(&mut self, pid: u32) -> TaskIdent {
            let ident = self.create();
            self.scheduler.tick().unwrap();
            self.send(Message::executed(ident.clone(), pid));
            self.scheduler.tick().unwrap();
            ident
        }
    }

    #[test]
    fn example_success_round_trip() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.tick().unwrap();

        f.send(Message::executed(ident.clone(), 4242));
        f.send(Message::finished(ident.clone(), TaskFinishType::Success, Some(json!("done"))));
        f.scheduler.tick().unwrap();

        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.state, TaskState::Finished);
        assert_eq!(snapshot.finish_type, TaskFinishType::Success);
        assert_eq!(snapshot.result, Some(json!("done")));
        assert_eq!(*f.pool.resumed.lock().unwrap(), vec![ident.clone()]);

        assert!(matches!(f.scheduler.get_task(&ident), Err(TaskError::NotFound { .. })));
    }

    #[test]
    fn example_three_tasks_all_queued() {
        let mut f = fixture();
        let idents: Vec<_> = (0..3).map(|_| f.create()).collect();

        let summary = f.scheduler.tick().unwrap();

        assert_eq!(summary.submitted, 3);
        for ident in &idents {
            assert_eq!(f.state(ident), TaskState::Queued);
        }
        assert_eq!(*f.pool.submitted.lock().unwrap(), idents);
    }

    #[test]
    fn colliding_generator_is_retried() {
        let mut f = fixture();
        let sequence = Mutex::new(vec!["b", "a", "a", "a"]);
        f.scheduler = f
            .scheduler
            .with_ident_generator(move || TaskIdent::from(sequence.lock().unwrap().pop().unwrap()));

        let first = f.create();
        let second = f.create();
        assert_eq!(first, TaskIdent::from("a"));
        assert_eq!(second, TaskIdent::from("b"));
        assert_eq!(f.scheduler.task_count(), 2);
    }

    #[test]
    fn unfinished_task_is_not_removed_by_get() {
        let mut f = fixture();
        let ident = f.create();
        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.state, TaskState::Created);
        assert!(f.scheduler.get_task(&ident).is_ok());
    }

    #[test]
    fn get_task_for_checks_owner() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        f.scheduler.tick().unwrap();

        let stranger = AuthUser::new("alice", &["haclient"]);
        assert!(matches!(
            f.scheduler.get_task_for(&ident, &stranger),
            Err(TaskError::NotFound { .. })
        ));
        assert_eq!(f.scheduler.task_count(), 1);

        let snapshot = f.scheduler.get_task_for(&ident, &admin()).unwrap();
        assert_eq!(snapshot.finish_type, TaskFinishType::Kill);
        assert_eq!(f.scheduler.task_count(), 0);
    }

    #[test]
    fn unknown_ident_is_not_found() {
        let mut f = fixture();
        let ghost = TaskIdent::from("ghost");
        assert!(matches!(f.scheduler.get_task(&ghost), Err(TaskError::NotFound { .. })));
        assert!(matches!(
            f.scheduler.kill_task(&ghost, TaskKillReason::User),
            Err(TaskError::NotFound { .. })
        ));
    }

    #[test]
    fn killed_created_task_is_never_submitted() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        assert_eq!(f.state(&ident), TaskState::Created);

        let summary = f.scheduler.tick().unwrap();

        assert_eq!(summary.killed, 1);
        assert!(f.pool.submitted.lock().unwrap().is_empty());
        assert!(f.pool.terminated.lock().unwrap().is_empty());
        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.finish_type, TaskFinishType::Kill);
        assert_eq!(snapshot.kill_reason, Some(TaskKillReason::User));
    }

    #[test]
    fn killing_queued_task_sends_no_signal() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.tick().unwrap();
        assert_eq!(f.state(&ident), TaskState::Queued);

        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        f.scheduler.tick().unwrap();

        assert_eq!(f.state(&ident), TaskState::Finished);
        assert!(f.pool.terminated.lock().unwrap().is_empty());
    }

    #[test]
    fn killing_executing_task_signals_its_worker() {
        let mut f = fixture();
        let ident = f.executing(31337);

        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        f.scheduler.tick().unwrap();

        assert_eq!(*f.pool.terminated.lock().unwrap(), vec![31337]);
        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.finish_type, TaskFinishType::Kill);
    }

    #[test]
    fn killing_vanished_worker_keeps_state() {
        let mut f = fixture();
        let ident = f.executing(31337);
        f.pool.gone.store(true, Ordering::SeqCst);

        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        f.scheduler.tick().unwrap();

        assert_eq!(*f.pool.terminated.lock().unwrap(), vec![31337]);
        assert_eq!(f.state(&ident), TaskState::Executed);

        // The in-flight finish message settles it.
        f.send(Message::finished(ident.clone(), TaskFinishType::Success, None));
        f.scheduler.tick().unwrap();
        assert_eq!(f.scheduler.get_task(&ident).unwrap().finish_type, TaskFinishType::Success);
    }

    #[test]
    fn silent_executing_task_times_out() {
        let mut f = fixture();
        let ident = f.executing(7);

        f.clock.advance(Duration::from_secs(600));
        f.scheduler.tick().unwrap();
        assert!(!f.scheduler.tasks[&ident].is_kill_requested());

        f.clock.advance(Duration::from_secs(1));
        let summary = f.scheduler.tick().unwrap();
        assert_eq!(summary.timed_out, 1);

        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.kill_reason, Some(TaskKillReason::CompletionTimeout));
        assert_eq!(snapshot.finish_type, TaskFinishType::Kill);
        assert_eq!(*f.pool.terminated.lock().unwrap(), vec![7]);
    }

    #[test]
    fn reports_keep_task_alive() {
        let mut f = fixture();
        let ident = f.executing(7);

        f.clock.advance(Duration::from_secs(500));
        f.send(Message::report(ident.clone(), ReportItem::info("PROGRESS", "still going")));
        f.scheduler.tick().unwrap();
        f.clock.advance(Duration::from_secs(500));
        f.scheduler.tick().unwrap();

        assert!(!f.scheduler.tasks[&ident].is_kill_requested());
    }

    #[test]
    fn unretrieved_finished_task_is_abandoned() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.tick().unwrap();
        f.clock.advance(Duration::from_secs(3600));
        f.send(Message::finished(ident.clone(), TaskFinishType::Fail, None));
        f.scheduler.tick().unwrap();

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.scheduler.tick().unwrap().abandoned, 0);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.scheduler.tick().unwrap().abandoned, 1);
        assert!(matches!(f.scheduler.get_task(&ident), Err(TaskError::NotFound { .. })));
    }

    #[test]
    fn unrecognized_payload_kills_task() {
        let mut f = fixture();
        let ident = f.executing(9);

        f.send(Message::new(
            ident.clone(),
            MessagePayload::Unrecognized {
                kind: "heartbeat".to_string(),
            },
        ));
        f.scheduler.tick().unwrap();

        let snapshot = f.scheduler.get_task(&ident).unwrap();
        assert_eq!(snapshot.kill_reason, Some(TaskKillReason::InternalMessagingError));
        assert_eq!(snapshot.finish_type, TaskFinishType::Kill);
    }

    #[test]
    fn late_executing_notice_terminates_that_worker() {
        let mut f = fixture();
        let ident = f.create();
        f.scheduler.tick().unwrap();
        f.scheduler.kill_task(&ident, TaskKillReason::User).unwrap();
        f.scheduler.tick().unwrap();

        f.send(Message::executed(ident.clone(), 5150));
        f.scheduler.tick().unwrap();

        assert_eq!(*f.pool.terminated.lock().unwrap(), vec![5150]);
        assert_eq!(f.state(&ident), TaskState::Finished);
    }

    #[test]
    fn orphan_messages_release_workers() {
        let mut f = fixture();
        let ghost = TaskIdent::from("ghost");
        f.send(Message::executed(ghost.clone(), 11));
        f.send(Message::finished(ghost.clone(), TaskFinishType::Success, None));
        f.send(Message::report(ghost.clone(), ReportItem::info("X", "y")));

        let summary = f.scheduler.tick().unwrap();

        assert_eq!(summary.messages, 3);
        assert_eq!(*f.pool.terminated.lock().unwrap(), vec![11]);
        assert_eq!(*f.pool.resumed.lock().unwrap(), vec![ghost]);
        assert_eq!(f.scheduler.task_count(), 0);
    }

    #[test]
    fn drain_is_bounded_to_messages_present_at_start() {
        let mut f = fixture();
        let ident = f.executing(1);
        for i in 0..5 {
            f.send(Message::report(ident.clone(), ReportItem::info("P", i.to_string())));
        }
        assert_eq!(f.scheduler.tick().unwrap().messages, 5);
        assert!(f.scheduler.tick().unwrap().is_idle());
    }

    #[test]
    fn refused_submission_is_fatal() {
        let mut f = fixture();
        let ident = f.create();
        f.pool.refuse.store(true, Ordering::SeqCst);

        assert!(matches!(f.scheduler.tick(), Err(PoolError::Closed)));
        assert_eq!(f.state(&ident), TaskState::Created);
    }

    #[tokio::test]
    async fn shutdown_stops_the_pool() {
        let f = fixture();
        let pool = Arc::clone(&f.pool);
        f.scheduler.shutdown().await;
        assert!(pool.shut_down.load(Ordering::SeqCst));
    }
}
