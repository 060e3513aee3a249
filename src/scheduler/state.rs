//! Task identity and lifecycle enums.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskIdent(String);

impl TaskIdent {
    /// Random identifier, 32 lowercase hex characters.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskIdent {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskIdent {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for TaskIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a task. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Registered, not yet handed to the worker pool.
    Created,
    /// Submitted to the worker pool.
    Queued,
    /// A worker process picked it up.
    Executed,
    /// Outcome recorded.
    Finished,
}

impl TaskState {
    /// Position in the lifecycle.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Queued => 1,
            Self::Executed => 2,
            Self::Finished => 3,
        }
    }

    /// Only strictly forward moves are allowed.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        target.rank() > self.rank()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Executed => "executed",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskFinishType {
    #[default]
    Unfinished,
    Success,
    Fail,
    Kill,
    UnhandledException,
}

impl std::fmt::Display for TaskFinishType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unfinished => "unfinished",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Kill => "kill",
            Self::UnhandledException => "unhandled_exception",
        };
        write!(f, "{s}")
    }
}

/// Why a task was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKillReason {
    User,
    CompletionTimeout,
    Abandoned,
    InternalMessagingError,
}

impl std::fmt::Display for TaskKillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::CompletionTimeout => "completion_timeout",
            Self::Abandoned => "abandoned",
            Self::InternalMessagingError => "internal_messaging_error",
        };
        write!(f, "{s}")
    }
}
