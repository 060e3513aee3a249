//! Console front-end: line commands on stdin, JSON replies on stdout.
//!
//! ```text
//! run <command> [json-params]   queue a command, prints its task ident
//! get <ident>                   task snapshot (consumes finished tasks)
//! kill <ident>                  request a kill
//! wait <ident> [secs]           block until the task finishes
//! count                         number of tasks held
//! quit
//! ```

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::commands::request::{AuthUser, CommandRequest};
use crate::scheduler::handle::SchedulerHandle;
use crate::scheduler::state::{TaskIdent, TaskKillReason};

/// Default `wait` timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(30);

/// A parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Run(CommandRequest),
    Get(TaskIdent),
    Kill(TaskIdent),
    Wait(TaskIdent, Duration),
    Count,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        match verb {
            "run" => {
                let (name, params) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err("usage: run <command> [json-params]".to_string());
                }
                let params = match params.trim() {
                    "" => serde_json::Value::Object(Default::default()),
                    raw => serde_json::from_str(raw).map_err(|e| format!("invalid params: {e}"))?,
                };
                if !params.is_object() {
                    return Err("params must be a JSON object".to_string());
                }
                Ok(Self::Run(CommandRequest::new(name).with_params(params)))
            }
            "get" => ident_arg(rest, "get").map(Self::Get),
            "kill" => ident_arg(rest, "kill").map(Self::Kill),
            "wait" => {
                let (ident, secs) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let ident = ident_arg(ident, "wait")?;
                let timeout = match secs.trim() {
                    "" => DEFAULT_WAIT,
                    raw => raw
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| format!("invalid seconds '{raw}': {e}"))?,
                };
                Ok(Self::Wait(ident, timeout))
            }
            "count" => Ok(Self::Count),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}

fn ident_arg(raw: &str, verb: &str) -> Result<TaskIdent, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        return Err(format!("usage: {verb} <ident>"));
    }
    Ok(TaskIdent::from(raw))
}

/// Console bound to a scheduler, acting as one user.
pub struct Console {
    scheduler: SchedulerHandle,
    user: AuthUser,
}

impl Console {
    pub fn new(scheduler: SchedulerHandle, user: AuthUser) -> Self {
        Self { scheduler, user }
    }

    /// Serve lines until `quit` or EOF.
    pub async fn run<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match ConsoleCommand::parse(&line) {
                Ok(ConsoleCommand::Quit) => break,
                Ok(command) => self.execute(command).await,
                Err(message) => json!({ "error": message }),
            };
            output.write_all(format!("{reply}\n").as_bytes()).await?;
            output.flush().await?;
        }
        tracing::debug!("Console input closed");
        Ok(())
    }

    /// Run one command against the scheduler.
    pub async fn execute(&self, command: ConsoleCommand) -> serde_json::Value {
        let result = match command {
            ConsoleCommand::Run(request) => self
                .scheduler
                .new_task(request, self.user.clone())
                .await
                .map(|ident| json!({ "task_ident": ident })),
            ConsoleCommand::Get(ident) => self
                .scheduler
                .get_task_for(&ident, &self.user)
                .await
                .map(|snapshot| json!(snapshot)),
            ConsoleCommand::Kill(ident) => self
                .scheduler
                .kill_task(&ident, TaskKillReason::User)
                .await
                .map(|()| json!({ "kill_requested": ident })),
            ConsoleCommand::Wait(ident, timeout) => self
                .scheduler
                .wait_for_task(&ident, timeout)
                .await
                .map(|snapshot| json!(snapshot)),
            ConsoleCommand::Count => self
                .scheduler
                .task_count()
                .await
                .map(|count| json!({ "tasks": count })),
            ConsoleCommand::Help => Ok(json!({
                "commands": ["run <command> [json-params]", "get <ident>", "kill <ident>", "wait <ident> [secs]", "count", "quit"]
            })),
            ConsoleCommand::Quit => Ok(json!({})),
        };
        result.unwrap_or_else(|e| json!({ "error": e.to_string() }))
    }
}
