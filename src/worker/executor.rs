//! Runs one task inside a worker process and reports its outcome.
//!
//! Every path ends in exactly one finished-notice. Client mistakes and domain
//! failures finish FAIL with reports; anything else finishes
//! UNHANDLED_EXCEPTION and is logged here, never propagated.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::commands::command::CommandError;
use crate::commands::permission::PermissionCheck;
use crate::commands::registry::CommandRegistry;
use crate::error::MessageError;
use crate::messaging::{Message, TaskSubmission};
use crate::reports::ReportItem;
use crate::scheduler::state::{TaskFinishType, TaskIdent};
use crate::worker::communicator::WorkerCommunicator;
use crate::worker::context::ExecutionEnv;

/// Executes submissions against a command registry.
pub struct TaskExecutor {
    registry: Arc<CommandRegistry>,
    permissions: Arc<dyn PermissionCheck>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<CommandRegistry>, permissions: Arc<dyn PermissionCheck>) -> Self {
        Self {
            registry,
            permissions,
        }
    }

    /// Run `submission`, sending every message through `communicator`.
    /// Returns the finish type that was reported.
    pub async fn execute(
        &self,
        submission: &TaskSubmission,
        communicator: &WorkerCommunicator,
    ) -> Result<TaskFinishType, MessageError> {
        let ident = &submission.task_ident;
        communicator.put(&Message::executed(ident.clone(), std::process::id()))?;

        let (finish_type, result) = self.run_command(submission, communicator).await?;
        communicator.put(&Message::finished(ident.clone(), finish_type, result))?;
        Ok(finish_type)
    }

    async fn run_command(
        &self,
        submission: &TaskSubmission,
        communicator: &WorkerCommunicator,
    ) -> Result<(TaskFinishType, Option<serde_json::Value>), MessageError> {
        let ident = &submission.task_ident;
        let request = &submission.command;

        let Some(command) = self.registry.get(&request.name) else {
            tracing::info!(task_ident = %ident, command = %request.name, "Unknown command");
            return fail_with(communicator, ident, ReportItem::command_unknown(&request.name));
        };

        if !self
            .permissions
            .is_authorized(&submission.acting_user, command.permission())
        {
            tracing::info!(
                task_ident = %ident,
                command = %request.name,
                user = %submission.acting_user.username,
                required = %command.permission(),
                "Not authorized"
            );
            return fail_with(communicator, ident, ReportItem::not_authorized());
        }

        let env = ExecutionEnv::new(ident, request, &submission.acting_user, communicator);
        let params = serde_json::Value::Object(request.params.clone());
        let outcome = AssertUnwindSafe(command.call(&env, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Ok((TaskFinishType::Success, Some(result))),
            Ok(Err(CommandError::Failed(reports))) => {
                for report in reports {
                    communicator.put(&Message::report(ident.clone(), report))?;
                }
                Ok((TaskFinishType::Fail, None))
            }
            Ok(Err(CommandError::InvalidParams(reason))) => fail_with(
                communicator,
                ident,
                ReportItem::command_invalid_payload(reason),
            ),
            Ok(Err(CommandError::Unexpected(e))) => {
                tracing::error!(
                    task_ident = %ident,
                    command = %request.name,
                    "Command raised an unexpected error: {:?}",
                    e
                );
                Ok((TaskFinishType::UnhandledException, None))
            }
            Err(panic) => {
                tracing::error!(
                    task_ident = %ident,
                    command = %request.name,
                    "Command panicked: {}",
                    panic_message(panic.as_ref())
                );
                Ok((TaskFinishType::UnhandledException, None))
            }
        }
    }
}

fn fail_with(
    communicator: &WorkerCommunicator,
    ident: &TaskIdent,
    report: ReportItem,
) -> Result<(TaskFinishType, Option<serde_json::Value>), MessageError> {
    communicator.put(&Message::report(ident.clone(), report))?;
    Ok((TaskFinishType::Fail, None))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::commands::command::Operation;
    use crate::commands::permission::{GroupPermissions, Permission};
    use crate::commands::request::{AuthUser, CommandRequest};
    use crate::config::PermissionConfig;
    use crate::messaging::{MessagePayload, TaskFinished};
    use crate::reports::codes;
    use crate::worker::communicator::tests::SharedBuf;

    struct Explode;

    #[async_trait]
    impl Operation for Explode {
        type Params = serde_json::Value;
        type Output = ();

        const NAME: &'static str = "test.explode";
        const PERMISSION: Permission = Permission::Read;

        async fn run(&self, _env: &ExecutionEnv<'_>, params: serde_json::Value) -> Result<(), CommandError> {
            if params.get("panic").is_some() {
                panic!("boom");
            }
            Err(anyhow::anyhow!("disk on fire").into())
        }
    }

    fn executor() -> TaskExecutor {
        let mut registry = CommandRegistry::with_builtins().unwrap();
        registry.register(Explode).unwrap();
        TaskExecutor::new(
            Arc::new(registry),
            Arc::new(GroupPermissions::new(PermissionConfig::default())),
        )
    }

    fn submission(command: CommandRequest, user: AuthUser) -> TaskSubmission {
        TaskSubmission {
            task_ident: TaskIdent::from("t1"),
            command,
            acting_user: user,
        }
    }

    fn admin() -> AuthUser {
        AuthUser::new("alice", &["haclient"])
    }

    async fn run(sub: TaskSubmission) -> Vec<Message> {
        let buf = SharedBuf::default();
        let comm = WorkerCommunicator::new(buf.clone());
        executor().execute(&sub, &comm).await.unwrap();
        buf.messages()
    }

    fn finished(msg: &Message) -> &TaskFinished {
        match &msg.payload {
            MessagePayload::TaskFinished(notice) => notice,
            other => panic!("expected finished notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_path() {
        let messages = run(submission(
            CommandRequest::new("debug.echo").with_params(json!({ "message": "hi" })),
            admin(),
        ))
        .await;

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::executed(TaskIdent::from("t1"), std::process::id()));
        assert!(matches!(messages[1].payload, MessagePayload::Report(_)));
        let notice = finished(&messages[2]);
        assert_eq!(notice.finish_type, TaskFinishType::Success);
        assert_eq!(notice.result, Some(json!("hi")));
    }

    #[tokio::test]
    async fn unknown_command_fails_with_one_report() {
        let messages = run(submission(CommandRequest::new("resource.enable"), admin())).await;

        assert_eq!(messages.len(), 3);
        assert!(
            matches!(messages[1].payload, MessagePayload::Report(ref r) if r.code == codes::COMMAND_UNKNOWN)
        );
        let notice = finished(&messages[2]);
        assert_eq!(notice.finish_type, TaskFinishType::Fail);
        assert_eq!(notice.result, None);
    }

    #[tokio::test]
    async fn unauthorized_user_fails() {
        let stranger = AuthUser::new("mallory", &["users"]);
        let messages = run(submission(
            CommandRequest::new("debug.echo").with_params(json!({ "message": "hi" })),
            stranger,
        ))
        .await;

        assert!(
            matches!(messages[1].payload, MessagePayload::Report(ref r) if r.code == codes::NOT_AUTHORIZED)
        );
        assert_eq!(finished(&messages[2]).finish_type, TaskFinishType::Fail);
    }

    #[tokio::test]
    async fn bad_params_fail_with_invalid_payload() {
        let messages = run(submission(
            CommandRequest::new("debug.echo").with_params(json!({ "msg": "typo" })),
            admin(),
        ))
        .await;

        assert!(matches!(
            messages[1].payload,
            MessagePayload::Report(ref r) if r.code == codes::COMMAND_INVALID_PAYLOAD
        ));
        assert_eq!(finished(&messages[2]).finish_type, TaskFinishType::Fail);
    }

    #[tokio::test]
    async fn domain_failure_forwards_reports() {
        let messages = run(submission(
            CommandRequest::new("debug.fail")
                .with_params(json!({ "code": "NODE_OFFLINE", "message": "node2 offline" })),
            admin(),
        ))
        .await;

        assert!(
            matches!(messages[1].payload, MessagePayload::Report(ref r) if r.code == "NODE_OFFLINE")
        );
        let notice = finished(&messages[2]);
        assert_eq!(notice.finish_type, TaskFinishType::Fail);
        assert_eq!(notice.result, None);
    }

    #[tokio::test]
    async fn unexpected_error_is_unhandled_exception() {
        let messages = run(submission(CommandRequest::new("test.explode"), admin())).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(finished(&messages[1]).finish_type, TaskFinishType::UnhandledException);
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let messages = run(submission(
            CommandRequest::new("test.explode").with_params(json!({ "panic": true })),
            admin(),
        ))
        .await;
        let notice = finished(&messages[1]);
        assert_eq!(notice.finish_type, TaskFinishType::UnhandledException);
        assert_eq!(notice.result, None);
    }
}
