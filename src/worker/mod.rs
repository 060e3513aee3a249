//! Worker side of the task system.
//!
//! Core components:
//! - `communicator`: outbound message channel with cooperative abort
//! - `context`: `ExecutionEnv` handed to running commands
//! - `executor`: runs one task and reports its outcome
//! - `process`: stdin instruction loop of a worker process
//! - `pool`: `WorkerPool` seam and the child-process `ProcessPool`
//! - `signal`: process signalling and shutdown signals

pub mod communicator;
pub mod context;
pub mod executor;
pub mod pool;
pub mod process;
pub mod signal;

pub use communicator::WorkerCommunicator;
pub use context::ExecutionEnv;
pub use executor::TaskExecutor;
pub use pool::{ProcessPool, WorkerCommand, WorkerControl, WorkerPool};
pub use process::run_worker;
