//! Execution environment handed to a running command.

use std::time::Duration;

use crate::commands::request::{AuthUser, CommandRequest};
use crate::messaging::Message;
use crate::reports::ReportItem;
use crate::scheduler::state::TaskIdent;
use crate::worker::communicator::WorkerCommunicator;

/// What a command may know about the task it runs in.
pub struct ExecutionEnv<'a> {
    task_ident: &'a TaskIdent,
    user: &'a AuthUser,
    request_timeout: Option<Duration>,
    communicator: &'a WorkerCommunicator,
}

impl<'a> ExecutionEnv<'a> {
    pub fn new(
        task_ident: &'a TaskIdent,
        command: &'a CommandRequest,
        acting_user: &'a AuthUser,
        communicator: &'a WorkerCommunicator,
    ) -> Self {
        Self {
            task_ident,
            user: command
                .options
                .effective_identity
                .as_ref()
                .unwrap_or(acting_user),
            request_timeout: command.options.request_timeout.map(Duration::from_secs),
            communicator,
        }
    }

    pub fn task_ident(&self) -> &TaskIdent {
        self.task_ident
    }

    /// The identity the command acts as.
    pub fn user(&self) -> &AuthUser {
        self.user
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Stream a progress report to the scheduler.
    pub fn report(&self, item: ReportItem) {
        let message = Message::report(self.task_ident.clone(), item);
        if let Err(e) = self.communicator.put(&message) {
            tracing::warn!(task_ident = %self.task_ident, "Failed to send report: {}", e);
        }
    }
}
