//! Handles test code uses to inspect and drive individual operations.
//!
//! A [`DurableOperation`] is a tracked lookup: it may be created before the
//! operation exists and always reflects the latest snapshot received by the
//! runner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::TestError;
use crate::history::{HistoryEvent, OperationEvents};
use crate::model::{ErrorObject, Operation, OperationStatus, OperationType};
use crate::operation_storage::{OperationLookup, TrackedId, TrackedReceiver};
use crate::types::{TestResultError, WaitingOperationStatus};
use crate::wait_manager::{lock_tracker, SharedTracker};

/// Step state with the result deserialized into `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDetails<T = serde_json::Value> {
    /// The current attempt, starting at 1
    pub attempt: Option<u32>,
    /// When the next attempt is due, for a step waiting to retry
    pub next_attempt_timestamp: Option<DateTime<Utc>>,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

/// Wait state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitDetails {
    pub wait_seconds: Option<u64>,
    pub scheduled_end_timestamp: Option<DateTime<Utc>>,
}

/// Callback state with the result deserialized into `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackDetails<T = serde_json::Value> {
    /// The id external systems use to complete the callback
    pub callback_id: Option<String>,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

/// Chained invoke state with the result deserialized into `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeDetails<T = serde_json::Value> {
    pub function_name: Option<String>,
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

/// Context state with the result deserialized into `T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDetails<T = serde_json::Value> {
    pub result: Option<T>,
    pub error: Option<TestResultError>,
}

/// Trait for sending callback responses.
///
/// Implemented by the local checkpoint server handle and the cloud backend.
#[async_trait::async_trait]
pub trait CallbackSender: Send + Sync {
    /// Sends a success response for a callback. `result` is serialized JSON.
    async fn send_success(&self, callback_id: &str, result: &str) -> Result<(), TestError>;

    /// Sends a failure response for a callback.
    async fn send_failure(
        &self,
        callback_id: &str,
        error: &TestResultError,
    ) -> Result<(), TestError>;

    /// Sends a heartbeat for a callback.
    async fn send_heartbeat(&self, callback_id: &str) -> Result<(), TestError>;
}

fn parse_result<T: DeserializeOwned>(result: Option<&String>) -> Result<Option<T>, TestError> {
    result
        .map(|json| serde_json::from_str(json))
        .transpose()
        .map_err(TestError::from)
}

fn to_result_error(error: Option<&ErrorObject>) -> Option<TestResultError> {
    error.cloned().map(TestResultError::from)
}

/// A tracked operation with inspection and interaction methods.
///
/// # Examples
///
/// ```ignore
/// let payment = runner.get_operation("payment");
/// let result = runner.run(input).await?;
///
/// assert_eq!(payment.get_status(), Some(OperationStatus::Succeeded));
/// let details = payment.get_step_details::<Receipt>()?;
/// ```
#[derive(Clone)]
pub struct DurableOperation {
    lookup: OperationLookup,
    tracked_id: TrackedId,
    receiver: TrackedReceiver,
    tracker: SharedTracker,
    callback_sender: Option<Arc<dyn CallbackSender>>,
}

impl std::fmt::Debug for DurableOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableOperation")
            .field("lookup", &self.lookup)
            .field("operation", &*self.receiver.borrow())
            .field("callback_sender", &self.callback_sender.is_some())
            .finish()
    }
}

impl DurableOperation {
    /// Registers `lookup` with `tracker` and returns the tracking handle.
    pub fn track(
        tracker: SharedTracker,
        lookup: OperationLookup,
        callback_sender: Option<Arc<dyn CallbackSender>>,
    ) -> Self {
        let (tracked_id, receiver) = lock_tracker(&tracker).track(lookup.clone());
        Self {
            lookup,
            tracked_id,
            receiver,
            tracker,
            callback_sender,
        }
    }

    /// How this handle finds its operation.
    pub fn lookup(&self) -> &OperationLookup {
        &self.lookup
    }

    /// True once a matching operation has been received.
    pub fn is_resolved(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Latest snapshot of the operation, if it exists yet.
    pub fn get_operation_data(&self) -> Option<Operation> {
        self.receiver
            .borrow()
            .as_ref()
            .map(|entry| entry.operation.clone())
    }

    fn read<R>(&self, f: impl FnOnce(&Operation) -> R) -> Option<R> {
        self.receiver.borrow().as_ref().map(|entry| f(&entry.operation))
    }

    fn require(&self) -> Result<Operation, TestError> {
        self.get_operation_data()
            .ok_or_else(|| TestError::operation_not_found(self.lookup.to_string()))
    }

    /// Operation id, once the operation has been received.
    pub fn get_id(&self) -> Option<String> {
        self.read(|op| op.id.clone())
    }

    /// Id of the enclosing context, if any.
    pub fn get_parent_id(&self) -> Option<String> {
        self.read(|op| op.parent_id.clone()).flatten()
    }

    /// Name given by the handler, if any.
    pub fn get_name(&self) -> Option<String> {
        self.read(|op| op.name.clone()).flatten()
    }

    /// Operation type.
    pub fn get_type(&self) -> Option<OperationType> {
        self.read(|op| op.operation_type)
    }

    /// Free-form sub type set by the handler.
    pub fn get_sub_type(&self) -> Option<String> {
        self.read(|op| op.sub_type.clone()).flatten()
    }

    /// Latest status, or `None` while the operation has not been received.
    pub fn get_status(&self) -> Option<OperationStatus> {
        self.read(|op| op.status)
    }

    /// When the operation started.
    pub fn get_start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(|op| op.start_timestamp).flatten()
    }

    /// When the operation reached a terminal status.
    pub fn get_end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(|op| op.end_timestamp).flatten()
    }

    /// History events recorded for this operation so far.
    pub fn get_events(&self) -> Vec<HistoryEvent> {
        self.receiver
            .borrow()
            .as_ref()
            .map(|entry| entry.events.clone())
            .unwrap_or_default()
    }

    /// True for a CALLBACK operation.
    pub fn is_callback(&self) -> bool {
        self.get_type() == Some(OperationType::Callback)
    }

    /// True once the status is terminal.
    pub fn is_completed(&self) -> bool {
        self.get_status().is_some_and(|status| status.is_terminal())
    }

    /// Tracked handles for the direct children of this operation.
    pub fn get_child_operations(&self) -> Vec<DurableOperation> {
        let Some(id) = self.get_id() else {
            return Vec::new();
        };
        let child_ids: Vec<String> = lock_tracker(&self.tracker)
            .index()
            .get_operation_children(&id)
            .into_iter()
            .map(|entry: &OperationEvents| entry.operation.id.clone())
            .collect();

        child_ids
            .into_iter()
            .map(|child_id| {
                Self::track(
                    Arc::clone(&self.tracker),
                    OperationLookup::by_id(child_id),
                    self.callback_sender.clone(),
                )
            })
            .collect()
    }
}

impl DurableOperation {
    fn require_type(&self, expected: OperationType) -> Result<Operation, TestError> {
        let operation = self.require()?;
        if operation.operation_type != expected {
            return Err(TestError::type_mismatch(expected, operation.operation_type));
        }
        Ok(operation)
    }

    /// Gets step-specific details.
    ///
    /// Fails with `OperationNotFound` while the operation has not been
    /// received and with `OperationTypeMismatch` for any other type.
    pub fn get_step_details<T: DeserializeOwned>(&self) -> Result<StepDetails<T>, TestError> {
        let operation = self.require_type(OperationType::Step)?;
        let details = operation.step_details.unwrap_or_default();
        Ok(StepDetails {
            attempt: details.attempt,
            next_attempt_timestamp: details.next_attempt_timestamp,
            result: parse_result(details.result.as_ref())?,
            error: to_result_error(details.error.as_ref()),
        })
    }

    /// Gets wait-specific details.
    ///
    /// Same failure modes as [`get_step_details`](Self::get_step_details).
    pub fn get_wait_details(&self) -> Result<WaitDetails, TestError> {
        let operation = self.require_type(OperationType::Wait)?;
        let details = operation.wait_details.unwrap_or_default();
        Ok(WaitDetails {
            wait_seconds: details.wait_seconds,
            scheduled_end_timestamp: details.scheduled_end_timestamp,
        })
    }

    /// Gets callback-specific details; `result` is deserialized as `T`.
    pub fn get_callback_details<T: DeserializeOwned>(
        &self,
    ) -> Result<CallbackDetails<T>, TestError> {
        let operation = self.require_type(OperationType::Callback)?;
        let details = operation.callback_details.unwrap_or_default();
        Ok(CallbackDetails {
            callback_id: details.callback_id.clone(),
            result: parse_result(details.result.as_ref())?,
            error: to_result_error(details.error.as_ref()),
        })
    }

    /// Gets chained-invoke details; `result` is deserialized as `T`.
    pub fn get_invoke_details<T: DeserializeOwned>(&self) -> Result<InvokeDetails<T>, TestError> {
        let operation = self.require_type(OperationType::Invoke)?;
        let details = operation.invoke_details.unwrap_or_default();
        Ok(InvokeDetails {
            function_name: details.function_name.clone(),
            result: parse_result(details.result.as_ref())?,
            error: to_result_error(details.error.as_ref()),
        })
    }

    /// Gets child-context details.
    pub fn get_context_details<T: DeserializeOwned>(&self) -> Result<ContextDetails<T>, TestError> {
        let operation = self.require_type(OperationType::Context)?;
        let details = operation.context_details.unwrap_or_default();
        Ok(ContextDetails {
            result: parse_result(details.result.as_ref())?,
            error: to_result_error(details.error.as_ref()),
        })
    }
}

impl DurableOperation {
    fn callback_target(&self) -> Result<(String, &Arc<dyn CallbackSender>), TestError> {
        let operation = self.require()?;
        if operation.operation_type != OperationType::Callback {
            return Err(TestError::NotCallbackOperation);
        }
        let callback_id = operation.callback_id().map(str::to_string).ok_or_else(|| {
            TestError::result_not_available("Callback ID not available for this operation")
        })?;
        let sender = self.callback_sender.as_ref().ok_or_else(|| {
            TestError::invalid_configuration("No callback sender configured for this runner")
        })?;
        Ok((callback_id, sender))
    }

    /// Completes the callback successfully. `result` is serialized JSON.
    pub async fn send_callback_success(&self, result: &str) -> Result<(), TestError> {
        let (callback_id, sender) = self.callback_target()?;
        sender.send_success(&callback_id, result).await
    }

    /// Completes the callback with a failure.
    ///
    /// Fails with `NotCallbackOperation` for any other operation type and with
    /// `ResultNotAvailable` before a callback id has been assigned.
    pub async fn send_callback_failure(&self, error: &TestResultError) -> Result<(), TestError> {
        let (callback_id, sender) = self.callback_target()?;
        sender.send_failure(&callback_id, error).await
    }

    /// Resets the heartbeat deadline of a pending callback.
    pub async fn send_callback_heartbeat(&self) -> Result<(), TestError> {
        let (callback_id, sender) = self.callback_target()?;
        sender.send_heartbeat(&callback_id).await
    }
}

impl DurableOperation {
    /// Waits until the operation reaches `target_status`.
    ///
    /// Returns immediately when the latest snapshot already satisfies the
    /// target. Fails with `ExecutionCompletedEarly` when the execution ends
    /// first.
    pub async fn wait_for_data(
        &self,
        target_status: WaitingOperationStatus,
    ) -> Result<&Self, TestError> {
        let ticket = lock_tracker(&self.tracker).wait_for(self.tracked_id, target_status);
        ticket.wait().await?;
        Ok(self)
    }

    /// Like [`wait_for_data`](Self::wait_for_data) but gives up after `timeout`.
    pub async fn wait_for_data_with_timeout(
        &self,
        target_status: WaitingOperationStatus,
        timeout: Duration,
    ) -> Result<&Self, TestError> {
        tokio::time::timeout(timeout, self.wait_for_data(target_status))
            .await
            .map_err(|_| TestError::wait_timeout(self.lookup.to_string()))?
    }
}
