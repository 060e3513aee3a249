//! Worker process entry loop.
//!
//! A worker reads [`WorkerInstruction`]s from stdin, one per line. After each
//! executed task it blocks until the scheduler sends `resume`, so its slot is
//! never reused before the result has been recorded. EOF ends the process.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::commands::permission::PermissionCheck;
use crate::commands::registry::CommandRegistry;
use crate::error::MessageError;
use crate::messaging::WorkerInstruction;
use crate::worker::communicator::WorkerCommunicator;
use crate::worker::executor::TaskExecutor;
use crate::worker::signal;

/// Run the worker on stdin/stdout until stdin closes.
pub async fn run_worker(
    registry: Arc<CommandRegistry>,
    permissions: Arc<dyn PermissionCheck>,
) -> Result<usize, MessageError> {
    let communicator = Arc::new(WorkerCommunicator::stdout());

    let on_term = Arc::clone(&communicator);
    tokio::spawn(async move {
        signal::terminate_signal().await;
        on_term.request_termination();
    });

    let executor = TaskExecutor::new(registry, permissions);
    let input = BufReader::new(tokio::io::stdin());
    serve(input, &executor, &communicator).await
}

/// Instruction loop. Returns the number of tasks executed.
pub async fn serve<R>(
    input: R,
    executor: &TaskExecutor,
    communicator: &WorkerCommunicator,
) -> Result<usize, MessageError>
where
    R: AsyncBufRead + Unpin,
{
    let pid = std::process::id();
    let mut lines = input.lines();
    let mut executed = 0;
    tracing::info!(pid = pid, "Worker started");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match WorkerInstruction::from_line(&line) {
            Ok(WorkerInstruction::Execute(submission)) => {
                tracing::debug!(pid = pid, task_ident = %submission.task_ident, "Executing task");
                let finish_type = executor.execute(&submission, communicator).await?;
                executed += 1;
                tracing::info!(
                    pid = pid,
                    task_ident = %submission.task_ident,
                    command = %submission.command.name,
                    finish_type = %finish_type,
                    "Task finished, waiting for resume"
                );
                if !wait_for_resume(&mut lines).await? {
                    break;
                }
            }
            Ok(WorkerInstruction::Resume) => {
                tracing::debug!(pid = pid, "Resume received while idle, ignoring");
            }
            Err(e) => {
                tracing::warn!(pid = pid, "Ignoring malformed instruction: {}", e);
            }
        }
    }

    tracing::info!(pid = pid, executed = executed, "Worker exiting");
    Ok(executed)
}

/// Block until `resume`. Returns false on EOF.
async fn wait_for_resume<R>(lines: &mut Lines<R>) -> Result<bool, MessageError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        match WorkerInstruction::from_line(&line) {
            Ok(WorkerInstruction::Resume) => return Ok(true),
            Ok(WorkerInstruction::Execute(submission)) => {
                tracing::warn!(
                    task_ident = %submission.task_ident,
                    "Execute received while paused, dropping"
                );
            }
            Err(e) => tracing::warn!("Ignoring malformed instruction: {}", e),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::commands::permission::GroupPermissions;
    use crate::commands::request::{AuthUser, CommandRequest};
    use crate::config::PermissionConfig;
    use crate::messaging::{MessagePayload, TaskSubmission};
    use crate::scheduler::state::{TaskFinishType, TaskIdent};
    use crate::worker::communicator::tests::SharedBuf;

    fn executor() -> TaskExecutor {
        TaskExecutor::new(
            Arc::new(CommandRegistry::with_builtins().unwrap()),
            Arc::new(GroupPermissions::new(PermissionConfig::default())),
        )
    }

    fn execute_line(ident: &str, command: CommandRequest) -> String {
        WorkerInstruction::Execute(TaskSubmission {
            task_ident: TaskIdent::from(ident),
            command,
            acting_user: AuthUser::new("hacluster", &[]),
        })
        .to_line()
        .unwrap()
    }

    fn finish_types(buf: &SharedBuf) -> Vec<(String, TaskFinishType)> {
        buf.messages()
            .into_iter()
            .filter_map(|m| match m.payload {
                MessagePayload::TaskFinished(f) => Some((m.task_ident.to_string(), f.finish_type)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn runs_tasks_between_resumes() {
        let input = [
            execute_line(
                "a",
                CommandRequest::new("debug.echo").with_params(json!({ "message": "one" })),
            ),
            r#"{"instruction":"resume"}"#.to_string(),
            execute_line("b", CommandRequest::new("no.such.command")),
            r#"{"instruction":"resume"}"#.to_string(),
        ]
        .join("\n");
        let buf = SharedBuf::default();
        let comm = WorkerCommunicator::new(buf.clone());

        let executed = serve(input.as_bytes(), &executor(), &comm).await.unwrap();

        assert_eq!(executed, 2);
        assert_eq!(
            finish_types(&buf),
            vec![
                ("a".to_string(), TaskFinishType::Success),
                ("b".to_string(), TaskFinishType::Fail),
            ]
        );
    }

    #[tokio::test]
    async fn execute_while_paused_is_dropped() {
        let input = [
            execute_line("a", CommandRequest::new("node.status")),
            execute_line("b", CommandRequest::new("node.status")),
        ]
        .join("\n");
        let buf = SharedBuf::default();
        let comm = WorkerCommunicator::new(buf.clone());

        let executed = serve(input.as_bytes(), &executor(), &comm).await.unwrap();

        assert_eq!(executed, 1);
        assert_eq!(finish_types(&buf), vec![("a".to_string(), TaskFinishType::Success)]);
    }

    #[tokio::test]
    async fn garbage_and_stray_resume_are_ignored() {
        let input = "not json\n{\"instruction\":\"resume\"}\n\n";
        let buf = SharedBuf::default();
        let comm = WorkerCommunicator::new(buf.clone());

        let executed = serve(input.as_bytes(), &executor(), &comm).await.unwrap();
        assert_eq!(executed, 0);
        assert!(buf.messages().is_empty());
    }
}
