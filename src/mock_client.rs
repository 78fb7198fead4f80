//! In-memory [`CheckpointClient`] for unit-testing handlers.
//!
//! The mock records every call and answers with queued responses, falling
//! back to a fresh token when the queue is empty.
//!
//! # Examples
//!
//! ```
//! use durable_execution_testing::{CheckpointClient, CheckpointResponse, MockCheckpointClient};
//! use durable_execution_testing::model::{OperationType, OperationUpdate};
//!
//! # tokio_test::block_on(async {
//! let client = MockCheckpointClient::new()
//!     .with_checkpoint_response(Ok(CheckpointResponse::new("token-1")));
//!
//! let response = client
//!     .checkpoint("exec-1", "token-0", vec![OperationUpdate::start("op-1", OperationType::Step)])
//!     .await
//!     .unwrap();
//! assert_eq!(response.checkpoint_token, "token-1");
//! assert_eq!(client.checkpoint_calls()[0].operations.len(), 1);
//! # });
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::client::{CheckpointClient, CheckpointResponse, GetOperationsResponse};
use crate::error::TestError;
use crate::model::{Operation, OperationUpdate};

/// Arguments of one `checkpoint` call.
#[derive(Debug, Clone)]
pub struct CheckpointCall {
    pub durable_execution_arn: String,
    pub checkpoint_token: String,
    pub operations: Vec<OperationUpdate>,
}

/// Arguments of one `get_operations` call.
#[derive(Debug, Clone)]
pub struct GetOperationsCall {
    pub durable_execution_arn: String,
    pub marker: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    checkpoint_responses: VecDeque<Result<CheckpointResponse, TestError>>,
    get_operations_responses: VecDeque<Result<GetOperationsResponse, TestError>>,
    checkpoint_calls: Vec<CheckpointCall>,
    get_operations_calls: Vec<GetOperationsCall>,
}

/// Checkpoint client that replays queued responses and records every call.
///
/// With nothing queued, checkpoints succeed with a fresh token and no
/// operations.
#[derive(Debug, Default)]
pub struct MockCheckpointClient {
    state: Mutex<MockState>,
}

impl MockCheckpointClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the response for the next unanswered `checkpoint` call.
    pub fn with_checkpoint_response(self, response: Result<CheckpointResponse, TestError>) -> Self {
        self.lock().checkpoint_responses.push_back(response);
        self
    }

    /// Queues a successful response that echoes `operations` back.
    pub fn with_checkpoint_operations(self, token: &str, operations: Vec<Operation>) -> Self {
        self.with_checkpoint_response(Ok(CheckpointResponse::new(token).with_operations(operations)))
    }

    /// Queues a response for the next `get_operations` call.
    pub fn with_get_operations_response(
        self,
        response: Result<GetOperationsResponse, TestError>,
    ) -> Self {
        self.lock().get_operations_responses.push_back(response);
        self
    }

    /// Checkpoint calls received so far, oldest first.
    pub fn checkpoint_calls(&self) -> Vec<CheckpointCall> {
        self.lock().checkpoint_calls.clone()
    }

    pub fn get_operations_calls(&self) -> Vec<GetOperationsCall> {
        self.lock().get_operations_calls.clone()
    }

    /// Every update submitted so far, in submission order.
    pub fn submitted_updates(&self) -> Vec<OperationUpdate> {
        self.lock()
            .checkpoint_calls
            .iter()
            .flat_map(|call| call.operations.iter().cloned())
            .collect()
    }

    /// Forgets recorded calls. Queued responses are kept.
    pub fn clear_calls(&self) {
        let mut state = self.lock();
        state.checkpoint_calls.clear();
        state.get_operations_calls.clear();
    }
}

#[async_trait]
impl CheckpointClient for MockCheckpointClient {
    async fn checkpoint(
        &self,
        durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, TestError> {
        let mut state = self.lock();
        state.checkpoint_calls.push(CheckpointCall {
            durable_execution_arn: durable_execution_arn.to_string(),
            checkpoint_token: checkpoint_token.to_string(),
            operations,
        });
        let call_number = state.checkpoint_calls.len();
        state
            .checkpoint_responses
            .pop_front()
            .unwrap_or_else(|| Ok(CheckpointResponse::new(format!("mock-token-{}", call_number))))
    }

    async fn get_operations(
        &self,
        durable_execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<GetOperationsResponse, TestError> {
        let mut state = self.lock();
        state.get_operations_calls.push(GetOperationsCall {
            durable_execution_arn: durable_execution_arn.to_string(),
            marker: marker.map(str::to_string),
        });
        state
            .get_operations_responses
            .pop_front()
            .unwrap_or_else(|| Ok(GetOperationsResponse::default()))
    }
}
