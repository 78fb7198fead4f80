//! Checkpoint client used by handlers to persist progress.
//!
//! The local checkpoint server and [`MockCheckpointClient`](crate::MockCheckpointClient)
//! both implement [`CheckpointClient`], so handlers can run against either.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TestError;
use crate::model::{Operation, OperationUpdate};

/// Communication with a checkpoint service.
#[async_trait]
pub trait CheckpointClient: Send + Sync {
    /// Submits a batch of operation updates.
    ///
    /// The returned token must be used for the next checkpoint; the previous
    /// one is rejected once a new token was issued.
    async fn checkpoint(
        &self,
        durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, TestError>;

    /// Retrieves one page of the execution's operations.
    async fn get_operations(
        &self,
        durable_execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<GetOperationsResponse, TestError>;
}

/// Shared, type-erased checkpoint client.
pub type SharedCheckpointClient = Arc<dyn CheckpointClient>;

/// Response to a checkpoint call: the next token and any changed operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    #[serde(rename = "CheckpointToken", default)]
    pub checkpoint_token: String,
    /// Operations changed by the checkpoint, including server-assigned values
    /// such as callback ids
    #[serde(rename = "NewExecutionState", default, skip_serializing_if = "Option::is_none")]
    pub new_execution_state: Option<NewExecutionState>,
}

impl CheckpointResponse {
    pub fn new(checkpoint_token: impl Into<String>) -> Self {
        Self {
            checkpoint_token: checkpoint_token.into(),
            new_execution_state: None,
        }
    }

    /// Attaches changed operations.
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.new_execution_state = Some(NewExecutionState {
            operations,
            next_marker: None,
        });
        self
    }

    /// Operations carried by the response, empty when there are none.
    pub fn operations(&self) -> &[Operation] {
        self.new_execution_state
            .as_ref()
            .map(|state| state.operations.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewExecutionState {
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,
    #[serde(rename = "NextMarker", default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// One page of operations. `next_marker` is absent on the last page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetOperationsResponse {
    #[serde(rename = "Operations", default)]
    pub operations: Vec<Operation>,
    #[serde(rename = "NextMarker", default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// Fetches every page of the execution's operations.
pub async fn get_all_operations(
    client: &dyn CheckpointClient,
    durable_execution_arn: &str,
) -> Result<Vec<Operation>, TestError> {
    let mut operations = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let page = client
            .get_operations(durable_execution_arn, marker.as_deref())
            .await?;
        operations.extend(page.operations);
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => return Ok(operations),
        }
    }
}
