//! Scheduler-side task: state machine, message handling, timeouts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::commands::request::{AuthUser, CommandRequest};
use crate::error::{SignalError, TaskError};
use crate::messaging::{MessagePayload, TaskFinished, TaskSubmission};
use crate::reports::ReportItem;
use crate::scheduler::state::{TaskFinishType, TaskIdent, TaskKillReason, TaskState};
use crate::worker::pool::WorkerControl;

/// One administrative command in flight.
#[derive(Debug, Clone)]
pub struct Task {
    ident: TaskIdent,
    command: CommandRequest,
    acting_user: AuthUser,
    state: TaskState,
    finish_type: TaskFinishType,
    kill_reason: Option<TaskKillReason>,
    kill_requested: bool,
    reports: Vec<ReportItem>,
    result: Option<serde_json::Value>,
    worker_pid: Option<u32>,
    created_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    execution_started_at: Option<DateTime<Utc>>,
}

/// Projection of a task returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_ident: TaskIdent,
    pub command: CommandRequest,
    pub reports: Vec<ReportItem>,
    pub state: TaskState,
    pub finish_type: TaskFinishType,
    pub kill_reason: Option<TaskKillReason>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        ident: TaskIdent,
        command: CommandRequest,
        acting_user: AuthUser,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ident,
            command,
            acting_user,
            state: TaskState::Created,
            finish_type: TaskFinishType::Unfinished,
            kill_reason: None,
            kill_requested: false,
            reports: Vec::new(),
            result: None,
            worker_pid: None,
            created_at: now,
            last_message_at: None,
            execution_started_at: None,
        }
    }

    pub fn ident(&self) -> &TaskIdent {
        &self.ident
    }

    pub fn acting_user(&self) -> &AuthUser {
        &self.acting_user
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn finish_type(&self) -> TaskFinishType {
        self.finish_type
    }

    pub fn kill_reason(&self) -> Option<TaskKillReason> {
        self.kill_reason
    }

    pub fn is_kill_requested(&self) -> bool {
        self.kill_requested
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.worker_pid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_at
    }

    pub fn execution_started_at(&self) -> Option<DateTime<Utc>> {
        self.execution_started_at
    }

    /// Move to `target`, which must be strictly later in the lifecycle.
    pub fn transition_to(&mut self, target: TaskState) -> Result<(), TaskError> {
        if !self.state.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                ident: self.ident.to_string(),
                from: self.state,
                to: target,
            });
        }
        tracing::debug!(task_ident = %self.ident, from = %self.state, to = %target, "Task state change");
        self.state = target;
        Ok(())
    }

    /// What the worker pool needs to run this task.
    pub fn submission(&self) -> TaskSubmission {
        TaskSubmission {
            task_ident: self.ident.clone(),
            command: self.command.clone(),
            acting_user: self.acting_user.clone(),
        }
    }

    /// Flag the task for killing on the next tick. The first reason sticks.
    pub fn request_kill(&mut self, reason: TaskKillReason) {
        if self.kill_reason.is_none() {
            self.kill_reason = Some(reason);
        }
        self.kill_requested = true;
    }

    /// Apply a requested kill.
    ///
    /// Tasks that never reached a worker are finished as KILL right away.
    /// Executing tasks get one termination signal; if the worker is already
    /// gone the task is left alone, since its finish message may still be
    /// on the way.
    pub fn kill<C>(&mut self, control: &C, now: DateTime<Utc>) -> Result<(), TaskError>
    where
        C: WorkerControl + ?Sized,
    {
        match self.state {
            TaskState::Finished => Ok(()),
            TaskState::Created | TaskState::Queued => self.finish(TaskFinishType::Kill, None, now),
            TaskState::Executed => {
                let Some(pid) = self.worker_pid else {
                    return self.finish(TaskFinishType::Kill, None, now);
                };
                match control.terminate(pid) {
                    Ok(()) => {
                        tracing::info!(task_ident = %self.ident, pid = pid, "Task worker terminated");
                        self.finish(TaskFinishType::Kill, None, now)
                    }
                    Err(SignalError::ProcessGone { .. }) => {
                        tracing::info!(
                            task_ident = %self.ident,
                            pid = pid,
                            "Task worker already gone, waiting for its finish message"
                        );
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(task_ident = %self.ident, "Failed to kill task: {}", e);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Apply a message from the task's worker.
    pub fn receive_message<C>(
        &mut self,
        payload: MessagePayload,
        control: &C,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError>
    where
        C: WorkerControl + ?Sized,
    {
        if self.state.is_finished() {
            self.receive_late_message(payload, control);
            return Ok(());
        }

        match payload {
            MessagePayload::Report(item) => {
                self.reports.push(item);
            }
            MessagePayload::TaskExecuted(notice) => {
                self.transition_to(TaskState::Executed)?;
                self.worker_pid = Some(notice.worker_pid);
                self.execution_started_at = Some(now);
            }
            MessagePayload::TaskFinished(TaskFinished {
                finish_type,
                result,
            }) => {
                let finish_type = if finish_type == TaskFinishType::Unfinished {
                    tracing::warn!(task_ident = %self.ident, "Finish notice without an outcome");
                    TaskFinishType::UnhandledException
                } else {
                    finish_type
                };
                self.finish(finish_type, result, now)?;
                control.resume(&self.ident);
            }
            MessagePayload::Unrecognized { kind } => {
                return Err(TaskError::UnknownMessage {
                    ident: self.ident.to_string(),
                    kind,
                });
            }
        }
        self.last_message_at = Some(now);
        Ok(())
    }

    /// Messages for a task that was killed before its worker noticed.
    fn receive_late_message<C>(&self, payload: MessagePayload, control: &C)
    where
        C: WorkerControl + ?Sized,
    {
        match payload {
            MessagePayload::TaskExecuted(notice) => {
                tracing::info!(
                    task_ident = %self.ident,
                    pid = notice.worker_pid,
                    "Finished task started executing, terminating its worker"
                );
                if let Err(e) = control.terminate(notice.worker_pid) {
                    tracing::debug!(task_ident = %self.ident, "{}", e);
                }
            }
            MessagePayload::TaskFinished(_) => control.resume(&self.ident),
            other => {
                tracing::debug!(
                    task_ident = %self.ident,
                    kind = other.kind(),
                    "Dropping message for finished task"
                );
            }
        }
    }

    fn finish(
        &mut self,
        finish_type: TaskFinishType,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.transition_to(TaskState::Finished)?;
        self.finish_type = finish_type;
        self.result = result;
        self.last_message_at = Some(now);
        Ok(())
    }

    /// Executing, but silent for longer than `timeout`.
    pub fn is_defunct(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Executed && exceeded(self.last_message_at, timeout, now)
    }

    /// Finished, and not retrieved within `timeout` of finishing.
    pub fn is_abandoned(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Finished && exceeded(self.last_message_at, timeout, now)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_ident: self.ident.clone(),
            command: self.command.clone(),
            reports: self.reports.clone(),
            state: self.state,
            finish_type: self.finish_type,
            kill_reason: self.kill_reason,
            result: self.result.clone(),
        }
    }
}

fn exceeded(since: Option<DateTime<Utc>>, timeout: Duration, now: DateTime<Utc>) -> bool {
    since
        .and_then(|since| (now - since).to_std().ok())
        .is_some_and(|elapsed| elapsed > timeout)
}
