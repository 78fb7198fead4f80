//! Request and response envelopes exchanged with the checkpoint server thread.
//!
//! Every request crosses the thread boundary as JSON inside a
//! [`WorkerApiRequest`], tagged with its [`ApiType`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::invocation::InvocationOutput;
use crate::model::{ErrorObject, Operation, OperationStatus, OperationUpdate};

/// Server-assigned execution id.
pub type ExecutionId = String;

pub type InvocationId = String;

/// Opaque token; see [`CheckpointTokenData`](super::CheckpointTokenData).
pub type CheckpointToken = String;

/// Operations the checkpoint server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiType {
    StartDurableExecution,
    StartInvocation,
    CompleteInvocation,
    UpdateCheckpointData,
    GetDurableExecutionState,
    CheckpointDurableExecutionState,
    StopDurableExecution,
    SendDurableExecutionCallbackSuccess,
    SendDurableExecutionCallbackFailure,
    SendDurableExecutionCallbackHeartbeat,
}

/// Configuration of the checkpoint server thread.
#[derive(Debug, Clone)]
pub struct CheckpointWorkerParams {
    /// Artificial latency added to every request, in milliseconds
    pub checkpoint_delay: Option<u64>,
    /// How often pending callbacks are checked for expired deadlines
    pub callback_sweep_interval: Duration,
}

impl Default for CheckpointWorkerParams {
    fn default() -> Self {
        Self {
            checkpoint_delay: None,
            callback_sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Starts an execution with an optional JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDurableExecutionRequest {
    pub payload: Option<String>,
    /// Execution-wide timeout in seconds, reported in `ExecutionStarted`
    pub execution_timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDurableExecutionResult {
    pub execution_id: ExecutionId,
    pub execution_operation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInvocationRequest {
    pub execution_id: ExecutionId,
    pub invocation_id: InvocationId,
}

/// Everything a handler needs to begin an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub execution_id: ExecutionId,
    pub invocation_id: InvocationId,
    pub checkpoint_token: CheckpointToken,
    pub operations: Vec<Operation>,
}

/// Reports how an invocation ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteInvocationRequest {
    pub execution_id: ExecutionId,
    pub invocation_id: InvocationId,
    pub output: InvocationOutput,
}

/// Server-side completion of an operation the handler cannot finish itself
/// (elapsed waits, chained invokes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckpointDataRequest {
    pub execution_id: ExecutionId,
    pub operation_id: String,
    pub status: OperationStatus,
    pub result: Option<String>,
    pub error: Option<ErrorObject>,
}

/// Requests one page of operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDurableExecutionStateRequest {
    pub durable_execution_arn: String,
    pub marker: Option<String>,
    pub max_items: Option<usize>,
}

/// A batch of handler updates with the token that authorizes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDurableExecutionStateRequest {
    pub durable_execution_arn: String,
    pub checkpoint_token: CheckpointToken,
    pub operations: Vec<OperationUpdate>,
}

/// Stops an execution from outside the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDurableExecutionRequest {
    pub execution_id: ExecutionId,
    /// Records `ExecutionTimedOut` instead of `ExecutionStopped`
    pub timed_out: bool,
    pub error: Option<ErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCallbackSuccessRequest {
    pub callback_id: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCallbackFailureRequest {
    pub callback_id: String,
    pub error: ErrorObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCallbackHeartbeatRequest {
    pub callback_id: String,
}

/// Envelope of every request sent to the server thread.
///
/// `payload` is the JSON form of the request type named by `api_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerApiRequest {
    pub api_type: ApiType,
    pub request_id: String,
    pub payload: String,
}

/// Envelope of every response. Exactly one of `payload` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerApiResponse {
    pub api_type: ApiType,
    pub request_id: String,
    pub payload: Option<String>,
    pub error: Option<String>,
}

impl WorkerApiResponse {
    pub fn success(api_type: ApiType, request_id: String, payload: String) -> Self {
        Self {
            api_type,
            request_id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(api_type: ApiType, request_id: String, error: String) -> Self {
        Self {
            api_type,
            request_id,
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_api_response_error() {
        let response = WorkerApiResponse::error(
            ApiType::StopDurableExecution,
            "req-1".into(),
            "Execution not found: exec-1".into(),
        );
        assert!(response.is_error());
        assert_eq!(response.payload, None);
    }

    #[test]
    fn test_complete_invocation_request_serialization() {
        let request = CompleteInvocationRequest {
            execution_id: "exec-1".into(),
            invocation_id: "inv-1".into(),
            output: InvocationOutput::Failed(ErrorObject::new("Boom", "failed")),
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: CompleteInvocationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.output, request.output);
    }

    #[test]
    fn test_default_sweep_interval() {
        let params = CheckpointWorkerParams::default();
        assert_eq!(params.callback_sweep_interval, Duration::from_millis(100));
        assert!(params.checkpoint_delay.is_none());
    }
}
