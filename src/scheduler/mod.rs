//! Task scheduler.
//!
//! - `state`: task identity and lifecycle enums
//! - `task`: per-task state machine
//! - `clock`: time source for timeout decisions
//! - `scheduler`: registry and coordination tick
//! - `handle`: async owner of the scheduler

pub mod clock;
pub mod handle;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod state;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use handle::SchedulerHandle;
pub use scheduler::{Scheduler, TickSummary};
pub use state::{TaskFinishType, TaskIdent, TaskKillReason, TaskState};
pub use task::{Task, TaskSnapshot};
