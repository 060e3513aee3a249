//! Async front for the scheduler.
//!
//! One tokio task owns the [`Scheduler`] and interleaves client requests with
//! ticks, so the registry never needs a lock. [`SchedulerHandle`] is the
//! cloneable client side.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::commands::request::{AuthUser, CommandRequest};
use crate::error::{PoolError, TaskError};
use crate::scheduler::scheduler::Scheduler;
use crate::scheduler::state::{TaskIdent, TaskKillReason};
use crate::scheduler::task::TaskSnapshot;

/// Requests buffered before callers start waiting.
const REQUEST_BUFFER: usize = 256;

enum Request {
    NewTask {
        command: CommandRequest,
        acting_user: AuthUser,
        reply: oneshot::Sender<TaskIdent>,
    },
    GetTask {
        ident: TaskIdent,
        requester: Option<AuthUser>,
        reply: oneshot::Sender<Result<TaskSnapshot, TaskError>>,
    },
    KillTask {
        ident: TaskIdent,
        reason: TaskKillReason,
        reply: oneshot::Sender<Result<(), TaskError>>,
    },
    TaskCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<Request>,
    poll_interval: Duration,
}

impl SchedulerHandle {
    /// Move `scheduler` into its own task. The returned join handle resolves
    /// when the scheduler stops; an error there means the worker pool broke.
    pub fn spawn(scheduler: Scheduler) -> (Self, JoinHandle<Result<(), PoolError>>) {
        let tick_interval = scheduler.config().tick_interval;
        let (requests, rx) = mpsc::channel(REQUEST_BUFFER);
        let task = tokio::spawn(run(scheduler, rx, tick_interval));
        (
            Self {
                requests,
                poll_interval: tick_interval,
            },
            task,
        )
    }

    pub async fn new_task(
        &self,
        command: CommandRequest,
        acting_user: AuthUser,
    ) -> Result<TaskIdent, TaskError> {
        self.call(|reply| Request::NewTask {
            command,
            acting_user,
            reply,
        })
        .await
    }

    pub async fn get_task(&self, ident: &TaskIdent) -> Result<TaskSnapshot, TaskError> {
        self.call(|reply| Request::GetTask {
            ident: ident.clone(),
            requester: None,
            reply,
        })
        .await?
    }

    /// `get_task` restricted to the task's own user.
    pub async fn get_task_for(
        &self,
        ident: &TaskIdent,
        requester: &AuthUser,
    ) -> Result<TaskSnapshot, TaskError> {
        self.call(|reply| Request::GetTask {
            ident: ident.clone(),
            requester: Some(requester.clone()),
            reply,
        })
        .await?
    }

    pub async fn kill_task(&self, ident: &TaskIdent, reason: TaskKillReason) -> Result<(), TaskError> {
        self.call(|reply| Request::KillTask {
            ident: ident.clone(),
            reason,
            reply,
        })
        .await?
    }

    pub async fn task_count(&self) -> Result<usize, TaskError> {
        self.call(|reply| Request::TaskCount { reply }).await
    }

    /// Poll until the task finishes, consuming its result.
    pub async fn wait_for_task(
        &self,
        ident: &TaskIdent,
        timeout: Duration,
    ) -> Result<TaskSnapshot, TaskError> {
        let poll = async {
            loop {
                match self.get_task(ident).await {
                    Ok(snapshot) if snapshot.state.is_finished() => return Ok(snapshot),
                    Ok(_) => tokio::time::sleep(self.poll_interval).await,
                    Err(e) => return Err(e),
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or_else(|_| {
                Err(TaskError::WaitTimeout {
                    ident: ident.to_string(),
                    timeout,
                })
            })
    }

    /// Stop the scheduler and its worker pool.
    pub async fn shutdown(&self) -> Result<(), TaskError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, TaskError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| TaskError::SchedulerGone)?;
        response.await.map_err(|_| TaskError::SchedulerGone)
    }
}

async fn run(
    mut scheduler: Scheduler,
    mut requests: mpsc::Receiver<Request>,
    tick_interval: Duration,
) -> Result<(), PoolError> {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(tick_ms = tick_interval.as_millis() as u64, "Scheduler started");

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(Request::Shutdown { reply }) => {
                    tracing::info!("Scheduler shutting down");
                    scheduler.shutdown().await;
                    let _ = reply.send(());
                    return Ok(());
                }
                Some(request) => handle(&mut scheduler, request),
                None => {
                    tracing::info!("All scheduler handles dropped, shutting down");
                    scheduler.shutdown().await;
                    return Ok(());
                }
            },
            _ = ticker.tick() => match scheduler.tick() {
                Ok(summary) if !summary.is_idle() => tracing::debug!(?summary, "Tick"),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Worker pool failure, stopping scheduler: {}", e);
                    scheduler.shutdown().await;
                    return Err(e);
                }
            },
        }
    }
}

fn handle(scheduler: &mut Scheduler, request: Request) {
    match request {
        Request::NewTask {
            command,
            acting_user,
            reply,
        } => {
            let _ = reply.send(scheduler.new_task(command, acting_user));
        }
        Request::GetTask {
            ident,
            requester,
            reply,
        } => {
            let result = match requester {
                Some(user) => scheduler.get_task_for(&ident, &user),
                None => scheduler.get_task(&ident),
            };
            let _ = reply.send(result);
        }
        Request::KillTask {
            ident,
            reason,
            reply,
        } => {
            let _ = reply.send(scheduler.kill_task(&ident, reason));
        }
        Request::TaskCount { reply } => {
            let _ = reply.send(scheduler.task_count());
        }
        Request::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
