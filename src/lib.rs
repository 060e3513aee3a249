//! Cluster task daemon: asynchronous task scheduler and worker pool.

pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod messaging;
pub mod reports;
pub mod scheduler;
pub mod worker;
