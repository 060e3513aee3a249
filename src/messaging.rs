//! Message protocol between the scheduler and its worker processes.
//!
//! Both directions are newline-delimited JSON. Workers write [`Message`]s to
//! stdout, one per line:
//!
//! ```text
//! {"task_ident":"…","payload_kind":"task_executed","worker_pid":4242}
//! {"task_ident":"…","payload_kind":"report","severity":"INFO","code":"…","message":"…"}
//! {"task_ident":"…","payload_kind":"task_finished","finish_type":"SUCCESS","result":"done"}
//! ```
//!
//! The scheduler side writes [`WorkerInstruction`]s to the worker's stdin.

use serde::{Deserialize, Serialize};

use crate::commands::request::{AuthUser, CommandRequest};
use crate::error::MessageError;
use crate::reports::ReportItem;
use crate::scheduler::state::{TaskFinishType, TaskIdent};

/// Notice that a worker process started executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecuted {
    pub worker_pid: u32,
}

/// Notice that a task is done, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFinished {
    pub finish_type: TaskFinishType,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// What a message carries.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Report(ReportItem),
    TaskExecuted(TaskExecuted),
    TaskFinished(TaskFinished),
    /// A payload kind this side does not understand.
    Unrecognized { kind: String },
}

impl MessagePayload {
    pub fn kind(&self) -> &str {
        match self {
            Self::Report(_) => "report",
            Self::TaskExecuted(_) => "task_executed",
            Self::TaskFinished(_) => "task_finished",
            Self::Unrecognized { kind } => kind,
        }
    }
}

/// Envelope produced by workers and consumed by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub task_ident: TaskIdent,
    pub payload: MessagePayload,
}

/// Flat on-the-wire shape of a [`Message`].
#[derive(Serialize, Deserialize)]
struct RawMessage {
    task_ident: TaskIdent,
    payload_kind: String,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub fn new(task_ident: TaskIdent, payload: MessagePayload) -> Self {
        Self {
            task_ident,
            payload,
        }
    }

    pub fn report(task_ident: TaskIdent, item: ReportItem) -> Self {
        Self::new(task_ident, MessagePayload::Report(item))
    }

    pub fn executed(task_ident: TaskIdent, worker_pid: u32) -> Self {
        Self::new(
            task_ident,
            MessagePayload::TaskExecuted(TaskExecuted { worker_pid }),
        )
    }

    pub fn finished(
        task_ident: TaskIdent,
        finish_type: TaskFinishType,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self::new(
            task_ident,
            MessagePayload::TaskFinished(TaskFinished {
                finish_type,
                result,
            }),
        )
    }

    /// Encode as a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, MessageError> {
        let fields = match &self.payload {
            MessagePayload::Report(item) => object_fields(item)?,
            MessagePayload::TaskExecuted(notice) => object_fields(notice)?,
            MessagePayload::TaskFinished(notice) => object_fields(notice)?,
            MessagePayload::Unrecognized { .. } => serde_json::Map::new(),
        };
        let raw = RawMessage {
            task_ident: self.task_ident.clone(),
            payload_kind: self.payload.kind().to_string(),
            fields,
        };
        serde_json::to_string(&raw).map_err(MessageError::Encode)
    }

    /// Decode one line. Unknown or malformed payloads become
    /// [`MessagePayload::Unrecognized`] so the owning task can still be found.
    pub fn from_line(line: &str) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_str(line.trim()).map_err(MessageError::Decode)?;
        let fields = serde_json::Value::Object(raw.fields);
        let payload = match raw.payload_kind.as_str() {
            "report" => serde_json::from_value(fields).map(MessagePayload::Report),
            "task_executed" => serde_json::from_value(fields).map(MessagePayload::TaskExecuted),
            "task_finished" => serde_json::from_value(fields).map(MessagePayload::TaskFinished),
            _ => Ok(MessagePayload::Unrecognized {
                kind: raw.payload_kind.clone(),
            }),
        }
        .unwrap_or(MessagePayload::Unrecognized {
            kind: raw.payload_kind,
        });
        Ok(Self::new(raw.task_ident, payload))
    }
}

fn object_fields<T: Serialize>(
    value: &T,
) -> Result<serde_json::Map<String, serde_json::Value>, MessageError> {
    match serde_json::to_value(value).map_err(MessageError::Encode)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(MessageError::Malformed(format!(
            "payload must serialize to an object, got {other}"
        ))),
    }
}

/// Work handed to the pool: run `command` on behalf of `acting_user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_ident: TaskIdent,
    pub command: CommandRequest,
    pub acting_user: AuthUser,
}

/// Scheduler-side instruction written to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "snake_case")]
pub enum WorkerInstruction {
    Execute(TaskSubmission),
    /// Leave the post-finish pause and accept the next task.
    Resume,
}

impl WorkerInstruction {
    pub fn to_line(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(MessageError::Encode)
    }

    pub fn from_line(line: &str) -> Result<Self, MessageError> {
        serde_json::from_str(line.trim()).map_err(MessageError::Decode)
    }
}
