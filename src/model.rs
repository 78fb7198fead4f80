//! Wire data model shared by handlers, the checkpoint server and the runners.
//!
//! Field names serialize in PascalCase and enum values in SCREAMING_SNAKE_CASE,
//! matching the durable execution service API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of durable unit of work an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// The top-level execution pseudo-operation.
    Execution,
    /// A child context grouping other operations.
    Context,
    /// A step whose result is checkpointed.
    Step,
    /// A timed wait.
    Wait,
    /// A callback completed by an external party.
    Callback,
    /// A chained invoke of another function.
    Invoke,
}

impl OperationType {
    /// Returns the wire representation of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "EXECUTION",
            Self::Context => "CONTEXT",
            Self::Step => "STEP",
            Self::Wait => "WAIT",
            Self::Callback => "CALLBACK",
            Self::Invoke => "INVOKE",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "Execution"),
            Self::Context => write!(f, "Context"),
            Self::Step => write!(f, "Step"),
            Self::Wait => write!(f, "Wait"),
            Self::Callback => write!(f, "Callback"),
            Self::Invoke => write!(f, "Invoke"),
        }
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Started,
    Ready,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Stopped,
}

impl OperationStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut | Self::Stopped
        )
    }

    /// Returns true if the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true for terminal statuses other than success.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Started => write!(f, "Started"),
            Self::Ready => write!(f, "Ready"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Action carried by an [`OperationUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationAction {
    Start,
    Succeed,
    Fail,
    Retry,
    Cancel,
}

impl OperationAction {
    /// Returns the wire representation of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Succeed => "SUCCEED",
            Self::Fail => "FAIL",
            Self::Retry => "RETRY",
            Self::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload reported by handlers and the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<String>>,
}

impl ErrorObject {
    /// Creates an error with a type and message.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
            error_data: None,
            stack_trace: None,
        }
    }

    /// Attaches a stack trace.
    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Step state, including retry bookkeeping owned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_delay_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Wait bookkeeping. `scheduled_end_timestamp` is set when the wait starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_end_timestamp: Option<DateTime<Utc>>,
}

/// `callback_id` is assigned by the checkpoint server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvokeDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// The materialized state of one durable unit of work.
///
/// Only the detail record matching `operation_type` is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Operation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Type")]
    pub operation_type: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_details: Option<ExecutionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_details: Option<ContextDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_details: Option<StepDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_details: Option<WaitDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_details: Option<CallbackDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_details: Option<InvokeDetails>,
}

impl Operation {
    /// Creates a started operation with no details.
    pub fn new(id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: None,
            operation_type,
            sub_type: None,
            status: OperationStatus::Started,
            start_timestamp: None,
            end_timestamp: None,
            execution_details: None,
            context_details: None,
            step_details: None,
            wait_details: None,
            callback_details: None,
            invoke_details: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true if the operation reached a terminal status.
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the callback id assigned by the server, if any.
    pub fn callback_id(&self) -> Option<&str> {
        self.callback_details.as_ref()?.callback_id.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,
}

/// Options of a step RETRY.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitOptions {
    pub wait_seconds: u64,
}

/// Callback deadlines in seconds; absent means no deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvokeOptions {
    pub function_name: String,
}

/// A checkpoint delta submitted by a running handler.
///
/// `action` and `operation_type` are optional on the wire; the checkpoint
/// server rejects updates missing either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<OperationAction>,
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_options: Option<ContextOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_options: Option<StepOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_options: Option<CallbackOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_options: Option<InvokeOptions>,
}

impl OperationUpdate {
    fn with_action(
        id: impl Into<String>,
        operation_type: OperationType,
        action: OperationAction,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: None,
            sub_type: None,
            action: Some(action),
            operation_type: Some(operation_type),
            payload: None,
            error: None,
            context_options: None,
            step_options: None,
            wait_options: None,
            callback_options: None,
            invoke_options: None,
        }
    }

    /// Creates a START update.
    pub fn start(id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::with_action(id, operation_type, OperationAction::Start)
    }

    /// Creates a SUCCEED update carrying an optional serialized result.
    pub fn succeed(
        id: impl Into<String>,
        operation_type: OperationType,
        payload: Option<String>,
    ) -> Self {
        let mut update = Self::with_action(id, operation_type, OperationAction::Succeed);
        update.payload = payload;
        update
    }

    /// Creates a FAIL update.
    pub fn fail(id: impl Into<String>, operation_type: OperationType, error: ErrorObject) -> Self {
        let mut update = Self::with_action(id, operation_type, OperationAction::Fail);
        update.error = Some(error);
        update
    }

    /// Creates a step RETRY update scheduling the next attempt after `delay_seconds`.
    pub fn retry(id: impl Into<String>, error: Option<ErrorObject>, delay_seconds: u64) -> Self {
        let mut update = Self::with_action(id, OperationType::Step, OperationAction::Retry);
        update.error = error;
        update.step_options = Some(StepOptions {
            next_attempt_delay_seconds: Some(delay_seconds),
        });
        update
    }

    /// Creates a CANCEL update.
    pub fn cancel(id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::with_action(id, operation_type, OperationAction::Cancel)
    }

    /// Sets the name used by name lookups.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    /// Sets the JSON payload: the input of a START, the result of a SUCCEED.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the duration of a wait START.
    pub fn with_wait_seconds(mut self, wait_seconds: u64) -> Self {
        self.wait_options = Some(WaitOptions { wait_seconds });
        self
    }

    /// Sets the callback deadlines of a callback START.
    pub fn with_callback_options(
        mut self,
        timeout_seconds: Option<u64>,
        heartbeat_timeout_seconds: Option<u64>,
    ) -> Self {
        self.callback_options = Some(CallbackOptions {
            timeout_seconds,
            heartbeat_timeout_seconds,
        });
        self
    }

    /// Names the registered function a chained invoke calls.
    pub fn with_function_name(mut self, function_name: impl Into<String>) -> Self {
        self.invoke_options = Some(InvokeOptions {
            function_name: function_name.into(),
        });
        self
    }

    pub fn with_replay_children(mut self, replay_children: bool) -> Self {
        self.context_options = Some(ContextOptions {
            replay_children: Some(replay_children),
        });
        self
    }
}

/// `base` plus `seconds`, or `None` when the result is not representable.
pub fn checked_add_seconds(base: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    base.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_seconds_rejects_unrepresentable_delays() {
        let now = Utc::now();
        assert_eq!(
            checked_add_seconds(now, 90),
            Some(now + chrono::Duration::seconds(90))
        );
        assert_eq!(checked_add_seconds(now, u64::MAX), None);
        assert_eq!(checked_add_seconds(now, i64::MAX as u64), None);
        assert_eq!(checked_add_seconds(now, 10_u64.pow(16)), None);
    }

    #[test]
    fn test_operation_serializes_pascal_case() {
        let operation = Operation::new("op-1", OperationType::Wait).with_name("pause");
        let json = serde_json::to_value(&operation).unwrap();
        assert_eq!(json["Id"], "op-1");
        assert_eq!(json["Type"], "WAIT");
        assert_eq!(json["Status"], "STARTED");
        assert_eq!(json["Name"], "pause");
        assert!(json.get("ParentId").is_none());
    }

    #[test]
    fn test_update_without_action_deserializes() {
        let update: OperationUpdate =
            serde_json::from_str(r#"{"Id":"op-1","Type":"STEP"}"#).unwrap();
        assert!(update.action.is_none());
        assert_eq!(update.operation_type, Some(OperationType::Step));
    }

    #[test]
    fn test_status_classification() {
        assert!(OperationStatus::TimedOut.is_terminal());
        assert!(OperationStatus::TimedOut.is_failure());
        assert!(!OperationStatus::Ready.is_terminal());
        assert!(OperationStatus::Succeeded.is_success());
        assert!(!OperationStatus::Succeeded.is_failure());
    }

    #[test]
    fn test_retry_update_sets_step_options() {
        let update = OperationUpdate::retry("step-1", None, 5);
        assert_eq!(update.action, Some(OperationAction::Retry));
        assert_eq!(update.operation_type, Some(OperationType::Step));
        assert_eq!(
            update.step_options.and_then(|o| o.next_attempt_delay_seconds),
            Some(5)
        );
    }
}
