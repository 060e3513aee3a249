//! Error types for the task daemon.

use std::time::Duration;

use crate::scheduler::state::TaskState;

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Messaging error: {0}")]
    Message(#[from] MessageError),

    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task registry and state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {ident} not found")]
    NotFound { ident: String },

    #[error("Task {ident} cannot transition from {from} to {to}")]
    InvalidTransition {
        ident: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {ident} received an unknown message of kind '{kind}'")]
    UnknownMessage { ident: String, kind: String },

    #[error("Task {ident} did not finish within {timeout:?}")]
    WaitTimeout { ident: String, timeout: Duration },

    #[error("Scheduler is no longer running")]
    SchedulerGone,
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is closed")]
    Closed,

    #[error("Failed to spawn worker process {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message line: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Worker terminated while sending")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process signalling errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Process {pid} does not exist")]
    ProcessGone { pid: u32 },

    #[error("Failed to signal process {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Command registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Command '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
