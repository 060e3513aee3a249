//! Command abstraction.
//!
//! Operations are written against typed parameters ([`Operation`]) and
//! stored type-erased ([`DynCommand`]) so the registry can hold them in one
//! map. Decoding happens at the erasure boundary.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::commands::permission::Permission;
use crate::reports::ReportItem;
use crate::worker::context::ExecutionEnv;

/// Outcome of a command that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Expected domain failure, described by its reports.
    #[error("Command failed with {} report(s)", .0.len())]
    Failed(Vec<ReportItem>),

    /// Parameters do not match what the command accepts.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Anything else. Logged in full, reported as an unhandled exception.
    #[error("Unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl CommandError {
    pub fn failed(report: ReportItem) -> Self {
        Self::Failed(vec![report])
    }
}

/// A named administrative operation with typed parameters.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    type Params: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send;

    /// Name clients use to invoke the operation.
    const NAME: &'static str;
    /// Permission the acting user must hold.
    const PERMISSION: Permission;

    async fn run(
        &self,
        env: &ExecutionEnv<'_>,
        params: Self::Params,
    ) -> Result<Self::Output, CommandError>;
}

/// Object-safe view of an operation.
#[async_trait]
pub trait DynCommand: Send + Sync {
    fn name(&self) -> &str;

    fn permission(&self) -> Permission;

    /// Decode `params`, run, and encode the output.
    async fn call(
        &self,
        env: &ExecutionEnv<'_>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommandError>;
}

/// Adapter erasing an [`Operation`] into a [`DynCommand`].
pub struct TypedCommand<O: Operation> {
    operation: O,
    _params: PhantomData<fn() -> O::Params>,
}

impl<O: Operation> TypedCommand<O> {
    pub fn new(operation: O) -> Self {
        Self {
            operation,
            _params: PhantomData,
        }
    }
}

#[async_trait]
impl<O: Operation> DynCommand for TypedCommand<O> {
    fn name(&self) -> &str {
        O::NAME
    }

    fn permission(&self) -> Permission {
        O::PERMISSION
    }

    async fn call(
        &self,
        env: &ExecutionEnv<'_>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CommandError> {
        let params: O::Params =
            serde_json::from_value(params).map_err(|e| CommandError::InvalidParams(e.to_string()))?;
        let output = self.operation.run(env, params).await?;
        serde_json::to_value(output)
            .map_err(|e| CommandError::Unexpected(anyhow::Error::new(e).context("encoding result")))
    }
}
