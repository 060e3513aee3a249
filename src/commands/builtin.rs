//! Built-in operations shipped with the daemon.
//!
//! Cluster-configuration operations live elsewhere; these cover node
//! introspection and the debug commands used to exercise the task pipeline.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::commands::command::{CommandError, Operation};
use crate::commands::permission::Permission;
use crate::commands::registry::CommandRegistry;
use crate::error::RegistryError;
use crate::reports::ReportItem;
use crate::worker::context::ExecutionEnv;

/// Longest sleep `debug.sleep` accepts.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

pub fn register_all(registry: &mut CommandRegistry) -> Result<(), RegistryError> {
    registry.register(NodeStatus)?;
    registry.register(Echo)?;
    registry.register(Sleep)?;
    registry.register(Fail)?;
    Ok(())
}

/// `node.status`: basic facts about the node running the worker.
pub struct NodeStatus;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeStatusParams {}

#[derive(Debug, Serialize)]
pub struct NodeStatusOutput {
    pub node: String,
    pub worker_pid: u32,
    pub requested_by: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl Operation for NodeStatus {
    type Params = NodeStatusParams;
    type Output = NodeStatusOutput;

    const NAME: &'static str = "node.status";
    const PERMISSION: Permission = Permission::Read;

    async fn run(
        &self,
        env: &ExecutionEnv<'_>,
        _params: NodeStatusParams,
    ) -> Result<NodeStatusOutput, CommandError> {
        let node = tokio::fs::read_to_string("/proc/sys/kernel/hostname")
            .await
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Ok(NodeStatusOutput {
            node,
            worker_pid: std::process::id(),
            requested_by: env.user().username.clone(),
            time: chrono::Utc::now(),
        })
    }
}

/// `debug.echo`: reports the message back and returns it.
pub struct Echo;

#[derive(Debug, Deserialize)]
pub struct EchoParams {
    pub message: String,
}

#[async_trait]
impl Operation for Echo {
    type Params = EchoParams;
    type Output = String;

    const NAME: &'static str = "debug.echo";
    const PERMISSION: Permission = Permission::Read;

    async fn run(&self, env: &ExecutionEnv<'_>, params: EchoParams) -> Result<String, CommandError> {
        env.report(ReportItem::info("ECHO", params.message.clone()));
        Ok(params.message)
    }
}

/// `debug.sleep`: waits, then succeeds. Useful for kill and timeout checks.
pub struct Sleep;

#[derive(Debug, Deserialize)]
pub struct SleepParams {
    pub seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct SleepOutput {
    pub slept: f64,
}

#[async_trait]
impl Operation for Sleep {
    type Params = SleepParams;
    type Output = SleepOutput;

    const NAME: &'static str = "debug.sleep";
    const PERMISSION: Permission = Permission::Write;

    async fn run(
        &self,
        env: &ExecutionEnv<'_>,
        params: SleepParams,
    ) -> Result<SleepOutput, CommandError> {
        let duration = Duration::try_from_secs_f64(params.seconds)
            .ok()
            .filter(|d| *d <= MAX_SLEEP)
            .ok_or_else(|| {
                CommandError::InvalidParams(format!(
                    "seconds must be between 0 and {}",
                    MAX_SLEEP.as_secs()
                ))
            })?;

        env.report(ReportItem::info(
            "SLEEP_STARTED",
            format!("Sleeping for {:.1}s", duration.as_secs_f64()),
        ));
        tokio::time::sleep(duration).await;
        Ok(SleepOutput {
            slept: params.seconds,
        })
    }
}

/// `debug.fail`: always fails with one error report.
pub struct Fail;

#[derive(Debug, Deserialize)]
pub struct FailParams {
    #[serde(default = "default_fail_code")]
    pub code: String,
    pub message: String,
}

fn default_fail_code() -> String {
    "DEBUG_FAILURE".to_string()
}

#[async_trait]
impl Operation for Fail {
    type Params = FailParams;
    type Output = ();

    const NAME: &'static str = "debug.fail";
    const PERMISSION: Permission = Permission::Read;

    async fn run(&self, _env: &ExecutionEnv<'_>, params: FailParams) -> Result<(), CommandError> {
        Err(CommandError::failed(ReportItem::error(
            params.code,
            params.message,
        )))
    }
}
