//! Command map consumed by the task executor.
//!
//! - `request`: `CommandRequest` and the identities it runs as
//! - `permission`: permission levels and the `PermissionCheck` seam
//! - `command`: typed `Operation` trait and its erased `DynCommand` form
//! - `registry`: name to command lookup
//! - `builtin`: operations shipped with the daemon

pub mod builtin;
pub mod command;
pub mod permission;
pub mod registry;
pub mod request;

pub use command::{CommandError, DynCommand, Operation};
pub use permission::{GroupPermissions, Permission, PermissionCheck};
pub use registry::CommandRegistry;
pub use request::{AuthUser, CommandOptions, CommandRequest};
