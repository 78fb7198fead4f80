//! Error types for the durable execution test harness.
//!
//! Every fallible API in this crate returns [`TestError`]. Protocol errors
//! (an update the checkpoint server cannot map to a history event) are
//! reported with their offending values so a broken handler is easy to spot.

use thiserror::Error;

use crate::model::{OperationStatus, OperationType};
use crate::types::{TestResultError, WaitingOperationStatus};

/// Errors that can occur while driving a durable execution under test.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::TestError;
///
/// let err = TestError::operation_not_found("my-step");
/// assert!(err.to_string().contains("my-step"));
///
/// let err = TestError::missing_action_or_type(None, Some("WAIT"));
/// assert!(err.to_string().contains("undefined"));
/// assert!(err.to_string().contains("WAIT"));
/// ```
#[derive(Debug, Error)]
pub enum TestError {
    /// The execution finished without succeeding.
    #[error("Execution did not succeed: {0}")]
    ExecutionFailed(TestResultError),

    /// An update arrived without an action or an operation type.
    #[error("Operation update is missing its action or type (action: {action}, type: {operation_type})")]
    MissingActionOrType {
        /// The update action, or `undefined`
        action: String,
        /// The operation type, or `undefined`
        operation_type: String,
    },

    /// No history event is defined for the action/type pair.
    #[error("No history event exists for action {action} on operation type {operation_type}")]
    NoHistoryEvent {
        /// The update action
        action: String,
        /// The operation type
        operation_type: String,
    },

    /// The update is not a legal transition from the operation's current status.
    #[error("Invalid transition for operation {operation_id}: {action} is not allowed from {status}")]
    InvalidTransition {
        /// The operation receiving the update
        operation_id: String,
        /// The rejected action
        action: String,
        /// The status the operation was in
        status: OperationStatus,
    },

    /// A wait or retry delay does not fit in a timestamp.
    #[error("Operation {operation_id} requested a delay of {seconds} seconds, which is out of range")]
    DurationOutOfRange {
        /// The operation carrying the delay
        operation_id: String,
        /// The requested delay
        seconds: u64,
    },

    /// Operation not found.
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Wrong operation type for the requested details.
    #[error("Operation type mismatch: expected {expected}, found {found}")]
    OperationTypeMismatch {
        /// The expected operation type
        expected: OperationType,
        /// The actual operation type found
        found: OperationType,
    },

    /// Callback operation required but not found.
    #[error("Not a callback operation")]
    NotCallbackOperation,

    /// No local function is registered under the requested name.
    #[error("Function not registered: {0}")]
    FunctionNotRegistered(String),

    /// Timeout waiting for operation.
    #[error("Timeout waiting for operation: {0}")]
    WaitTimeout(String),

    /// Execution completed before operation reached expected state.
    #[error("Execution completed before operation {0} reached state {1}")]
    ExecutionCompletedEarly(String, WaitingOperationStatus),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// AWS service or transport error.
    #[error("AWS error: {0}")]
    AwsError(String),

    /// The checkpoint worker has not been set up, or was torn down.
    #[error("Test environment not set up. Call TestEnvironment::setup() first.")]
    EnvironmentNotSetUp,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested result or error is not available.
    #[error("Result not available: {0}")]
    ResultNotAvailable(String),

    /// Checkpoint token is malformed or does not belong to an active invocation.
    #[error("Invalid checkpoint token: {0}")]
    InvalidCheckpointToken(String),

    /// The checkpoint server failed to process a request.
    #[error("Checkpoint server error: {0}")]
    CheckpointServerError(String),

    /// Communication with the checkpoint server failed.
    #[error("Checkpoint communication error: {0}")]
    CheckpointCommunicationError(String),

    /// Execution not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Invocation not found.
    #[error("Invocation not found: {0}")]
    InvocationNotFound(String),

    /// Callback already completed.
    #[error("Callback already completed: {0}")]
    CallbackAlreadyCompleted(String),

    /// Callback not found.
    #[error("Callback not found: {0}")]
    CallbackNotFound(String),
}

fn or_undefined(value: Option<&str>) -> String {
    value.unwrap_or("undefined").to_string()
}

impl TestError {
    /// Creates a missing action/type error. Absent values are rendered as `undefined`.
    pub fn missing_action_or_type(action: Option<&str>, operation_type: Option<&str>) -> Self {
        Self::MissingActionOrType {
            action: or_undefined(action),
            operation_type: or_undefined(operation_type),
        }
    }

    /// Creates a no-history-event error for an unmapped action/type pair.
    pub fn no_history_event(action: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self::NoHistoryEvent {
            action: action.into(),
            operation_type: operation_type.into(),
        }
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(
        operation_id: impl Into<String>,
        action: impl Into<String>,
        status: OperationStatus,
    ) -> Self {
        Self::InvalidTransition {
            operation_id: operation_id.into(),
            action: action.into(),
            status,
        }
    }

    /// Creates a duration out of range error.
    pub fn duration_out_of_range(operation_id: impl Into<String>, seconds: u64) -> Self {
        Self::DurationOutOfRange {
            operation_id: operation_id.into(),
            seconds,
        }
    }

    /// Creates a new `OperationNotFound` error.
    pub fn operation_not_found(name: impl Into<String>) -> Self {
        Self::OperationNotFound(name.into())
    }

    /// Creates a new `OperationTypeMismatch` error.
    pub fn type_mismatch(expected: OperationType, found: OperationType) -> Self {
        Self::OperationTypeMismatch { expected, found }
    }

    /// Creates a new `FunctionNotRegistered` error.
    pub fn function_not_registered(name: impl Into<String>) -> Self {
        Self::FunctionNotRegistered(name.into())
    }

    /// Creates a new `WaitTimeout` error.
    pub fn wait_timeout(operation: impl Into<String>) -> Self {
        Self::WaitTimeout(operation.into())
    }

    /// Creates a new `ExecutionCompletedEarly` error.
    pub fn execution_completed_early(
        operation: impl Into<String>,
        status: WaitingOperationStatus,
    ) -> Self {
        Self::ExecutionCompletedEarly(operation.into(), status)
    }

    /// Creates a new `AwsError`.
    pub fn aws_error(message: impl Into<String>) -> Self {
        Self::AwsError(message.into())
    }

    /// Creates a new `InvalidConfiguration` error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Creates a new `ResultNotAvailable` error.
    pub fn result_not_available(message: impl Into<String>) -> Self {
        Self::ResultNotAvailable(message.into())
    }

    /// Creates a new `InvalidCheckpointToken` error.
    pub fn invalid_checkpoint_token(message: impl Into<String>) -> Self {
        Self::InvalidCheckpointToken(message.into())
    }

    /// Creates a new `CheckpointServerError`.
    pub fn checkpoint_server_error(message: impl Into<String>) -> Self {
        Self::CheckpointServerError(message.into())
    }

    /// Creates a new `CheckpointCommunicationError`.
    pub fn checkpoint_communication_error(message: impl Into<String>) -> Self {
        Self::CheckpointCommunicationError(message.into())
    }

    /// Creates a new `ExecutionNotFound` error.
    pub fn execution_not_found(message: impl Into<String>) -> Self {
        Self::ExecutionNotFound(message.into())
    }

    /// Creates a new `InvocationNotFound` error.
    pub fn invocation_not_found(message: impl Into<String>) -> Self {
        Self::InvocationNotFound(message.into())
    }

    /// Creates a new `CallbackAlreadyCompleted` error.
    pub fn callback_already_completed(message: impl Into<String>) -> Self {
        Self::CallbackAlreadyCompleted(message.into())
    }

    /// Creates a new `CallbackNotFound` error.
    pub fn callback_not_found(message: impl Into<String>) -> Self {
        Self::CallbackNotFound(message.into())
    }

    /// Returns true for transient failures a caller may retry.
    ///
    /// Protocol errors and lookups are never retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TestError::CheckpointCommunicationError(_) | TestError::WaitTimeout(_)
        )
    }

    /// Returns true for errors caused by a malformed or unsupported update.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TestError::MissingActionOrType { .. }
                | TestError::NoHistoryEvent { .. }
                | TestError::InvalidTransition { .. }
                | TestError::DurationOutOfRange { .. }
        )
    }
}
