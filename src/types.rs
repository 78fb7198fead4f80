//! Result-side types: execution status, error payloads, invocations and
//! the statuses test code can wait for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ErrorObject, Operation, OperationStatus, OperationType};

/// Status of one durable execution under test.
///
/// A run moves from `NotStarted` to `Running` and then to exactly one of the
/// terminal states.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::ExecutionStatus;
///
/// assert!(ExecutionStatus::Stopped.is_terminal());
/// assert!(!ExecutionStatus::Running.is_terminal());
/// assert!(!ExecutionStatus::NotStarted.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// `run()` has not been called yet
    NotStarted,
    /// Execution is currently running
    Running,
    /// Execution completed successfully
    Succeeded,
    /// Execution failed with an error
    Failed,
    /// Execution exceeded its timeout
    TimedOut,
    /// Execution was stopped externally
    Stopped,
}

impl ExecutionStatus {
    /// Returns true if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    /// Returns true if this status represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if this status represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::Stopped)
    }

    /// Maps the status of the EXECUTION operation onto a run status.
    pub fn from_operation_status(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Succeeded => Self::Succeeded,
            OperationStatus::Failed | OperationStatus::Cancelled => Self::Failed,
            OperationStatus::TimedOut => Self::TimedOut,
            OperationStatus::Stopped => Self::Stopped,
            OperationStatus::Pending | OperationStatus::Started | OperationStatus::Ready => {
                Self::Running
            }
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Error information from a failed execution or operation.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::TestResultError;
///
/// let error = TestResultError::new("ValidationError", "Invalid input");
/// assert_eq!(error.to_string(), "ValidationError: Invalid input");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResultError {
    /// The type/category of the error
    pub error_type: Option<String>,
    /// Human-readable error message
    pub error_message: Option<String>,
    /// Additional error data (typically JSON)
    pub error_data: Option<String>,
    /// Stack trace if available
    pub stack_trace: Option<Vec<String>>,
}

impl TestResultError {
    /// Creates an error with a type and a message.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
            error_data: None,
            stack_trace: None,
        }
    }

    /// Creates an error with only a message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            error_type: None,
            error_message: Some(message.into()),
            error_data: None,
            stack_trace: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.error_data = Some(data.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }
}

impl std::fmt::Display for TestResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error_type, &self.error_message) {
            (Some(t), Some(m)) => write!(f, "{}: {}", t, m),
            (None, Some(m)) => write!(f, "{}", m),
            (Some(t), None) => write!(f, "{}", t),
            (None, None) => write!(f, "Unknown error"),
        }
    }
}

impl std::error::Error for TestResultError {}

impl From<ErrorObject> for TestResultError {
    fn from(error: ErrorObject) -> Self {
        Self {
            error_type: error.error_type,
            error_message: error.error_message,
            error_data: error.error_data,
            stack_trace: error.stack_trace,
        }
    }
}

impl From<TestResultError> for ErrorObject {
    fn from(error: TestResultError) -> Self {
        Self {
            error_type: error.error_type,
            error_message: error.error_message,
            error_data: error.error_data,
            stack_trace: error.stack_trace,
        }
    }
}

/// Information about a single handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Timestamp when the invocation started
    pub start_timestamp: Option<DateTime<Utc>>,
    /// Timestamp when the invocation ended
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Request id assigned to this invocation
    pub request_id: Option<String>,
    /// Error information if the invocation failed
    pub error: Option<TestResultError>,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a record at `start`.
    pub fn with_start(start: DateTime<Utc>) -> Self {
        Self {
            start_timestamp: Some(start),
            ..Self::default()
        }
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end_timestamp = Some(end);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_error(mut self, error: TestResultError) -> Self {
        self.error = Some(error);
        self
    }

    /// Returns the duration of the invocation if both timestamps are available.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (&self.start_timestamp, &self.end_timestamp) {
            (Some(start), Some(end)) => Some(*end - *start),
            _ => None,
        }
    }
}

/// Status to wait for with `DurableOperation::wait_for_data`.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::WaitingOperationStatus;
///
/// assert_eq!(WaitingOperationStatus::Completed.to_string(), "Completed");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitingOperationStatus {
    /// The operation has been observed in any status
    Started,
    /// Callbacks: the server assigned a callback id. Other types: same as `Started`
    Submitted,
    /// The operation reached a terminal status
    Completed,
}

impl WaitingOperationStatus {
    /// Returns true if `operation` currently satisfies this target.
    pub fn is_satisfied_by(&self, operation: &Operation) -> bool {
        match self {
            Self::Started => true,
            Self::Submitted => {
                operation.operation_type != OperationType::Callback
                    || operation.callback_id().is_some()
            }
            Self::Completed => operation.status.is_terminal(),
        }
    }
}

impl std::fmt::Display for WaitingOperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "Started"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}
