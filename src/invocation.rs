//! What a handler sees during one invocation, and what it hands back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::client::{get_all_operations, SharedCheckpointClient};
use crate::error::TestError;
use crate::model::{ErrorObject, Operation, OperationType, OperationUpdate};

/// Outcome of one handler invocation as reported to the checkpoint server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvocationOutput {
    /// The handler returned; carries the serialized result
    Succeeded(Option<String>),
    /// The handler failed
    Failed(ErrorObject),
    /// The handler suspended and must be invoked again later
    Pending,
}

impl InvocationOutput {
    /// True unless the handler suspended.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Converts a typed handler result into the wire outcome.
    pub fn from_handler_result<O: Serialize>(result: Result<O, HandlerError>) -> Self {
        match result {
            Ok(output) => match serde_json::to_string(&output) {
                Ok(json) => Self::Succeeded(Some(json)),
                Err(e) => Self::Failed(ErrorObject::new("SerializationError", e.to_string())),
            },
            Err(HandlerError::Suspend) => Self::Pending,
            Err(HandlerError::Failed(error)) => Self::Failed(error),
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Why a handler did not return a value.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// Progress is checkpointed and the handler waits to be re-invoked
    Suspend,
    Failed(ErrorObject),
}

impl From<ErrorObject> for HandlerError {
    fn from(error: ErrorObject) -> Self {
        Self::Failed(error)
    }
}

impl From<TestError> for HandlerError {
    fn from(error: TestError) -> Self {
        Self::Failed(ErrorObject::new("CheckpointError", error.to_string()))
    }
}

#[derive(Debug)]
struct ContextState {
    checkpoint_token: String,
    operations: HashMap<String, Operation>,
}

/// Checkpoint access for one handler invocation.
///
/// Holds the operations known when the invocation started and merges the
/// operations returned by each checkpoint, so replaying handlers can look up
/// prior outcomes by id.
pub struct InvocationContext {
    client: SharedCheckpointClient,
    durable_execution_arn: String,
    input_payload: Option<String>,
    state: Mutex<ContextState>,
}

impl InvocationContext {
    pub fn new(
        client: SharedCheckpointClient,
        durable_execution_arn: impl Into<String>,
        checkpoint_token: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        let input_payload = operations
            .iter()
            .find(|op| op.operation_type == OperationType::Execution)
            .and_then(|op| op.execution_details.as_ref())
            .and_then(|details| details.input_payload.clone());

        Self {
            client,
            durable_execution_arn: durable_execution_arn.into(),
            input_payload,
            state: Mutex::new(ContextState {
                checkpoint_token: checkpoint_token.into(),
                operations: operations
                    .into_iter()
                    .map(|op| (op.id.clone(), op))
                    .collect(),
            }),
        }
    }

    /// Identifies the execution in checkpoint calls.
    pub fn durable_execution_arn(&self) -> &str {
        &self.durable_execution_arn
    }

    /// Serialized input the execution was started with.
    pub fn input_payload(&self) -> Option<&str> {
        self.input_payload.as_deref()
    }

    /// The operation with id `operation_id` as of the latest checkpoint.
    pub async fn get_operation(&self, operation_id: &str) -> Option<Operation> {
        self.state.lock().await.operations.get(operation_id).cloned()
    }

    /// The token the next checkpoint must carry.
    pub async fn checkpoint_token(&self) -> String {
        self.state.lock().await.checkpoint_token.clone()
    }

    /// Submits updates and merges the returned operation state.
    ///
    /// Checkpoints from one invocation are serialized so each uses the token
    /// returned by the previous one.
    pub async fn checkpoint(&self, updates: Vec<OperationUpdate>) -> Result<(), TestError> {
        let mut state = self.state.lock().await;
        let response = self
            .client
            .checkpoint(&self.durable_execution_arn, &state.checkpoint_token, updates)
            .await?;

        state.checkpoint_token = response.checkpoint_token.clone();
        for operation in response.operations() {
            state
                .operations
                .insert(operation.id.clone(), operation.clone());
        }
        Ok(())
    }

    /// Replaces the local view with the full state from the service.
    pub async fn refresh(&self) -> Result<(), TestError> {
        let operations = get_all_operations(self.client.as_ref(), &self.durable_execution_arn).await?;
        let mut state = self.state.lock().await;
        state.operations = operations
            .into_iter()
            .map(|op| (op.id.clone(), op))
            .collect();
        Ok(())
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("durable_execution_arn", &self.durable_execution_arn)
            .finish()
    }
}
