//! Checkpoint state of a single execution.
//!
//! The manager applies handler updates to operation snapshots, records one
//! history event per accepted transition, and collects everything touched
//! since the last flush into a batch for subscribers.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::callback_manager::{CallbackManager, CallbackTimeouts, CompleteCallbackStatus};
use super::checkpoint_token::CheckpointTokenData;
use super::event_processor::{require_action_and_type, EventProcessor};
use super::types::{CheckpointToken, ExecutionId, InvocationId};
use crate::error::TestError;
use crate::history::{
    ErrorDetails, EventDetails, EventType, HistoryEvent, InvocationCompletedDetails,
    OperationEvents, ResultDetails, WaitSucceededDetails,
};
use crate::invocation::InvocationOutput;
use crate::model::{
    checked_add_seconds, CallbackDetails, ContextDetails, ErrorObject, ExecutionDetails,
    InvokeDetails, Operation, OperationAction, OperationStatus, OperationType, OperationUpdate,
    StepDetails, WaitDetails,
};
use crate::types::{Invocation, TestResultError};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct ActiveInvocation {
    started_at: DateTime<Utc>,
    checkpoint_token: CheckpointToken,
}

/// Manages checkpoints for a single execution.
#[derive(Debug)]
pub struct CheckpointManager {
    execution_id: ExecutionId,
    operations: HashMap<String, Operation>,
    /// Operation ids in first-seen order
    operation_order: Vec<String>,
    history: Vec<HistoryEvent>,
    callback_manager: CallbackManager,
    event_processor: EventProcessor,
    invocations: HashMap<InvocationId, ActiveInvocation>,
    execution_operation_id: Option<String>,
    /// Ids touched since the last flush, in touch order
    pending_ids: Vec<String>,
    pending_events: HashMap<String, Vec<HistoryEvent>>,
}

impl CheckpointManager {
    /// Creates an empty manager. Call [`initialize`](Self::initialize) before use.
    pub fn new(execution_id: &str, execution_timeout: Option<u64>) -> Self {
        let mut event_processor = EventProcessor::new();
        event_processor.set_execution_timeout(execution_timeout);
        Self {
            execution_id: execution_id.to_string(),
            operations: HashMap::new(),
            operation_order: Vec::new(),
            history: Vec::new(),
            callback_manager: CallbackManager::new(execution_id),
            event_processor,
            invocations: HashMap::new(),
            execution_operation_id: None,
            pending_ids: Vec::new(),
            pending_events: HashMap::new(),
        }
    }

    /// Starts the EXECUTION pseudo-operation with the input payload.
    pub fn initialize(&mut self, payload: Option<String>) -> Result<Operation, TestError> {
        let execution_operation_id = Uuid::new_v4().to_string();
        let mut update = OperationUpdate::start(&execution_operation_id, OperationType::Execution);
        update.payload = payload;

        let operation = self.apply_update(&update)?;
        self.execution_operation_id = Some(execution_operation_id);
        Ok(operation)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// The EXECUTION pseudo-operation.
    pub fn execution_operation(&self) -> Option<&Operation> {
        self.operations.get(self.execution_operation_id.as_deref()?)
    }

    /// True once the EXECUTION operation is terminal.
    pub fn is_execution_completed(&self) -> bool {
        self.execution_operation()
            .map(Operation::is_completed)
            .unwrap_or(false)
    }

    /// Latest snapshot of an operation.
    pub fn get_operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.get(operation_id)
    }

    /// All operations in first-seen order.
    pub fn get_state(&self) -> Vec<Operation> {
        self.operation_order
            .iter()
            .filter_map(|id| self.operations.get(id).cloned())
            .collect()
    }

    /// One page of operations. The marker is the offset of the next page.
    pub fn get_operations_page(
        &self,
        marker: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<(Vec<Operation>, Option<String>), TestError> {
        let start = match marker {
            Some(marker) => marker.parse::<usize>().map_err(|_| {
                TestError::invalid_configuration(format!("Invalid marker: {}", marker))
            })?,
            None => 0,
        };
        let page_size = max_items.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let end = (start + page_size).min(self.operation_order.len());

        let page = self
            .operation_order
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.operations.get(id).cloned())
            .collect();
        let next_marker = (end < self.operation_order.len()).then(|| end.to_string());
        Ok((page, next_marker))
    }

    /// Every history event of the execution in event id order.
    pub fn get_history_events(&self) -> Vec<HistoryEvent> {
        self.history.clone()
    }

    pub fn callback_manager(&self) -> &CallbackManager {
        &self.callback_manager
    }

    /// True while an invocation holds a checkpoint token.
    pub fn has_active_invocation(&self) -> bool {
        !self.invocations.is_empty()
    }

    /// Registers a new invocation and issues its first checkpoint token.
    pub fn start_invocation(&mut self, invocation_id: &str) -> Result<CheckpointToken, TestError> {
        if self.invocations.contains_key(invocation_id) {
            return Err(TestError::checkpoint_server_error(format!(
                "Invocation {} already started",
                invocation_id
            )));
        }
        let checkpoint_token = CheckpointTokenData::new(&self.execution_id, invocation_id).encode()?;
        self.invocations.insert(
            invocation_id.to_string(),
            ActiveInvocation {
                started_at: Utc::now(),
                checkpoint_token: checkpoint_token.clone(),
            },
        );
        Ok(checkpoint_token)
    }

    /// Ends an invocation, records `InvocationCompleted` and, for a terminal
    /// output, completes the execution.
    pub fn complete_invocation(
        &mut self,
        invocation_id: &str,
        output: &InvocationOutput,
    ) -> Result<Invocation, TestError> {
        let active = self
            .invocations
            .remove(invocation_id)
            .ok_or_else(|| TestError::invocation_not_found(invocation_id))?;
        let execution = self
            .execution_operation()
            .cloned()
            .ok_or_else(|| TestError::execution_not_found(self.execution_id.clone()))?;

        let end_timestamp = Utc::now();
        let event = self.event_processor.create_history_event(
            EventType::InvocationCompleted,
            &execution,
            EventDetails::InvocationCompleted(InvocationCompletedDetails {
                start_timestamp: active.started_at,
                end_timestamp,
                request_id: invocation_id.to_string(),
                error: output.error().cloned(),
            }),
        );
        self.record(event);

        if !execution.is_completed() {
            let update = match output {
                InvocationOutput::Succeeded(result) => Some(OperationUpdate::succeed(
                    &execution.id,
                    OperationType::Execution,
                    result.clone(),
                )),
                InvocationOutput::Failed(error) => Some(OperationUpdate::fail(
                    &execution.id,
                    OperationType::Execution,
                    error.clone(),
                )),
                InvocationOutput::Pending => None,
            };
            if let Some(update) = update {
                self.apply_update(&update)?;
            }
        }

        let mut invocation = Invocation::with_start(active.started_at)
            .with_end(end_timestamp)
            .with_request_id(invocation_id);
        if let Some(error) = output.error() {
            invocation = invocation.with_error(TestResultError::from(error.clone()));
        }
        Ok(invocation)
    }

    /// Applies a checkpoint from an active invocation and rotates its token.
    ///
    /// Returns the new token and the snapshots of the touched operations.
    ///
    /// Updates are applied in order and the first rejected update aborts the
    /// remainder of the batch. Batches are not atomic: updates ahead of the
    /// rejected one stay applied and their events are published with the next
    /// batch. The token is only rotated on success, so the caller may retry
    /// the remaining updates with the same token.
    pub fn checkpoint(
        &mut self,
        token: &CheckpointTokenData,
        raw_token: &str,
        updates: &[OperationUpdate],
    ) -> Result<(CheckpointToken, Vec<Operation>), TestError> {
        let active = self
            .invocations
            .get(&token.invocation_id)
            .ok_or_else(|| {
                TestError::invalid_checkpoint_token(format!(
                    "invocation {} is not active",
                    token.invocation_id
                ))
            })?;
        if active.checkpoint_token != raw_token {
            return Err(TestError::invalid_checkpoint_token("token was already used"));
        }

        let touched = self.process_checkpoint(updates)?;

        let next_token = CheckpointTokenData::new(&self.execution_id, &token.invocation_id).encode()?;
        if let Some(active) = self.invocations.get_mut(&token.invocation_id) {
            active.checkpoint_token = next_token.clone();
        }
        Ok((next_token, touched))
    }

    /// Applies updates without token validation.
    ///
    /// On error, updates before the rejected one remain applied.
    pub fn process_checkpoint(
        &mut self,
        updates: &[OperationUpdate],
    ) -> Result<Vec<Operation>, TestError> {
        updates.iter().map(|update| self.apply_update(update)).collect()
    }

    /// Applies one handler update and records its event.
    ///
    /// Nothing is modified when the update is rejected.
    fn apply_update(&mut self, update: &OperationUpdate) -> Result<Operation, TestError> {
        let (action, operation_type) = require_action_and_type(update)?;
        let now = Utc::now();

        let mut operation = match self.operations.get(&update.id) {
            Some(existing) => {
                if existing.operation_type != operation_type {
                    return Err(TestError::type_mismatch(existing.operation_type, operation_type));
                }
                if existing.is_completed()
                    || (action == OperationAction::Start && existing.status == OperationStatus::Started)
                {
                    return Err(TestError::invalid_transition(
                        &existing.id,
                        action.as_str(),
                        existing.status,
                    ));
                }
                existing.clone()
            }
            None => {
                let mut operation = Operation::new(&update.id, operation_type);
                operation.parent_id = update.parent_id.clone();
                operation.sub_type = update.sub_type.clone();
                operation.start_timestamp = Some(now);
                if operation_type == OperationType::Step {
                    operation.step_details = Some(StepDetails {
                        attempt: Some(1),
                        ..StepDetails::default()
                    });
                }
                operation
            }
        };
        if operation.name.is_none() {
            operation.name = update.name.clone();
        }

        apply_action(&mut operation, update, action, now)?;
        let event = self.event_processor.process_update(update, &operation, now)?;

        if let (OperationAction::Start, OperationType::Callback) = (action, operation_type) {
            if let Some(callback_id) = operation.callback_id() {
                let options = update.callback_options.as_ref();
                self.callback_manager.register_callback(
                    callback_id,
                    &operation.id,
                    CallbackTimeouts::from_seconds(
                        options.and_then(|o| o.timeout_seconds),
                        options.and_then(|o| o.heartbeat_timeout_seconds),
                    ),
                )?;
            }
        }

        tracing::debug!(
            execution_id = %self.execution_id,
            operation_id = %operation.id,
            event_type = %event.event_type,
            "Applied operation update"
        );
        self.store(operation.clone());
        self.record(event);
        Ok(operation)
    }

    /// Completes an operation the handler cannot complete itself.
    ///
    /// Supported: elapsed or cancelled waits, and chained invoke outcomes.
    pub fn complete_operation(
        &mut self,
        operation_id: &str,
        status: OperationStatus,
        result: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<Operation, TestError> {
        let operation = self
            .operations
            .get(operation_id)
            .cloned()
            .ok_or_else(|| TestError::operation_not_found(operation_id))?;
        let rejected = || {
            TestError::invalid_transition(
                operation_id,
                format!("complete as {}", status),
                operation.status,
            )
        };
        if operation.is_completed() {
            return Err(rejected());
        }

        let (event_type, details) = match (operation.operation_type, status) {
            (OperationType::Wait, OperationStatus::Succeeded) => (
                EventType::WaitSucceeded,
                EventDetails::WaitSucceeded(WaitSucceededDetails {
                    duration: operation.wait_details.as_ref().and_then(|d| d.wait_seconds),
                }),
            ),
            (OperationType::Wait, OperationStatus::Cancelled) => {
                (EventType::WaitCancelled, error_details(error))
            }
            (OperationType::Invoke, OperationStatus::Succeeded) => {
                (EventType::ChainedInvokeSucceeded, result_details(result))
            }
            (OperationType::Invoke, OperationStatus::Failed) => {
                (EventType::ChainedInvokeFailed, error_details(error))
            }
            (OperationType::Invoke, OperationStatus::TimedOut) => {
                (EventType::ChainedInvokeTimedOut, error_details(error))
            }
            (OperationType::Invoke, OperationStatus::Stopped) => {
                (EventType::ChainedInvokeStopped, error_details(error))
            }
            _ => return Err(rejected()),
        };
        Ok(self.complete_with_event(operation, status, event_type, details))
    }

    /// Completes the CALLBACK operation behind `callback_id`.
    ///
    /// Fails with `CallbackAlreadyCompleted` on a second completion.
    pub fn complete_callback(
        &mut self,
        callback_id: &str,
        status: CompleteCallbackStatus,
        result: Option<String>,
        error: Option<ErrorObject>,
    ) -> Result<Operation, TestError> {
        let operation_id = self.callback_manager.complete(callback_id, status)?;
        let operation = self
            .operations
            .get(&operation_id)
            .cloned()
            .ok_or_else(|| TestError::operation_not_found(operation_id.clone()))?;

        let (operation_status, event_type, details) = match status {
            CompleteCallbackStatus::Success => (
                OperationStatus::Succeeded,
                EventType::CallbackSucceeded,
                result_details(result),
            ),
            CompleteCallbackStatus::Failure => (
                OperationStatus::Failed,
                EventType::CallbackFailed,
                error_details(error),
            ),
            CompleteCallbackStatus::TimedOut => (
                OperationStatus::TimedOut,
                EventType::CallbackTimedOut,
                error_details(error),
            ),
        };
        Ok(self.complete_with_event(operation, operation_status, event_type, details))
    }

    /// Records a heartbeat for a pending callback.
    pub fn send_callback_heartbeat(&mut self, callback_id: &str) -> Result<(), TestError> {
        self.callback_manager.send_heartbeat(callback_id)
    }

    /// Times out callbacks past a deadline and returns their operations.
    pub fn check_callback_timeouts(&mut self, now: Instant) -> Vec<Operation> {
        let mut completed = Vec::new();
        for timed_out in self.callback_manager.check_timeouts(now) {
            let Some(operation) = self.operations.get(&timed_out.operation_id).cloned() else {
                continue;
            };
            tracing::info!(
                execution_id = %self.execution_id,
                callback_id = %timed_out.callback_id,
                kind = ?timed_out.kind,
                "Callback timed out"
            );
            completed.push(self.complete_with_event(
                operation,
                OperationStatus::TimedOut,
                EventType::CallbackTimedOut,
                error_details(Some(timed_out.kind.to_error())),
            ));
        }
        completed
    }

    /// Ends the execution as STOPPED, or TIMED_OUT when `timed_out` is set.
    pub fn stop_execution(
        &mut self,
        timed_out: bool,
        error: Option<ErrorObject>,
    ) -> Result<Operation, TestError> {
        let execution = self
            .execution_operation()
            .cloned()
            .ok_or_else(|| TestError::execution_not_found(self.execution_id.clone()))?;
        if execution.is_completed() {
            return Err(TestError::invalid_transition(
                &execution.id,
                "STOP",
                execution.status,
            ));
        }
        let (status, event_type) = if timed_out {
            (OperationStatus::TimedOut, EventType::ExecutionTimedOut)
        } else {
            (OperationStatus::Stopped, EventType::ExecutionStopped)
        };
        Ok(self.complete_with_event(execution, status, event_type, error_details(error)))
    }

    fn complete_with_event(
        &mut self,
        mut operation: Operation,
        status: OperationStatus,
        event_type: EventType,
        details: EventDetails,
    ) -> Operation {
        store_outcome(
            &mut operation,
            details.result().map(str::to_string),
            details.error().cloned(),
        );
        let event = self
            .event_processor
            .create_history_event(event_type, &operation, details);
        operation.status = status;
        operation.end_timestamp = Some(event.event_timestamp);

        self.store(operation.clone());
        self.record(event);
        operation
    }

    fn store(&mut self, operation: Operation) {
        if !self.operations.contains_key(&operation.id) {
            self.operation_order.push(operation.id.clone());
        }
        self.touch(&operation.id);
        self.operations.insert(operation.id.clone(), operation);
    }

    fn record(&mut self, event: HistoryEvent) {
        if let Some(id) = event.id.clone() {
            self.touch(&id);
            self.pending_events.entry(id).or_default().push(event.clone());
        }
        self.history.push(event);
    }

    fn touch(&mut self, operation_id: &str) {
        if !self.pending_ids.iter().any(|id| id == operation_id) {
            self.pending_ids.push(operation_id.to_string());
        }
    }

    /// True when operations changed since the last [`flush_batch`](Self::flush_batch).
    pub fn has_pending_batch(&self) -> bool {
        !self.pending_ids.is_empty()
    }

    /// Drains everything touched since the previous flush.
    ///
    /// Each entry pairs the latest snapshot with the events produced for it
    /// since then.
    pub fn flush_batch(&mut self) -> Vec<OperationEvents> {
        let ids = std::mem::take(&mut self.pending_ids);
        let mut events = std::mem::take(&mut self.pending_events);
        ids.into_iter()
            .filter_map(|id| {
                let operation = self.operations.get(&id)?.clone();
                Some(OperationEvents::new(operation, events.remove(&id).unwrap_or_default()))
            })
            .collect()
    }
}

/// Moves `operation` to the state implied by `action`.
///
/// Fails when a wait or retry delay cannot be turned into a timestamp.
fn apply_action(
    operation: &mut Operation,
    update: &OperationUpdate,
    action: OperationAction,
    now: DateTime<Utc>,
) -> Result<(), TestError> {
    match action {
        OperationAction::Start => {
            operation.status = OperationStatus::Started;
            start_details(operation, update, now)?;
        }
        OperationAction::Succeed => {
            operation.status = OperationStatus::Succeeded;
            operation.end_timestamp = Some(now);
            store_outcome(operation, update.payload.clone(), update.error.clone());
        }
        OperationAction::Fail => {
            operation.status = OperationStatus::Failed;
            operation.end_timestamp = Some(now);
            store_outcome(operation, update.payload.clone(), update.error.clone());
        }
        OperationAction::Retry => {
            operation.status = OperationStatus::Pending;
            let delay = update
                .step_options
                .as_ref()
                .and_then(|options| options.next_attempt_delay_seconds);
            let next_attempt_timestamp = delay
                .map(|seconds| deadline(&operation.id, now, seconds))
                .transpose()?;
            let step = operation.step_details.get_or_insert_with(StepDetails::default);
            step.attempt = Some(step.attempt.unwrap_or(1) + 1);
            step.next_attempt_delay_seconds = delay;
            step.next_attempt_timestamp = next_attempt_timestamp;
            step.error = update.error.clone();
        }
        OperationAction::Cancel => {
            operation.status = OperationStatus::Cancelled;
            operation.end_timestamp = Some(now);
        }
    }
    Ok(())
}

fn deadline(operation_id: &str, now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>, TestError> {
    checked_add_seconds(now, seconds)
        .ok_or_else(|| TestError::duration_out_of_range(operation_id, seconds))
}

fn start_details(
    operation: &mut Operation,
    update: &OperationUpdate,
    now: DateTime<Utc>,
) -> Result<(), TestError> {
    match operation.operation_type {
        OperationType::Execution => {
            operation.execution_details = Some(ExecutionDetails {
                input_payload: update.payload.clone(),
            });
        }
        OperationType::Context => {
            operation.context_details = Some(ContextDetails {
                replay_children: update
                    .context_options
                    .as_ref()
                    .and_then(|options| options.replay_children),
                ..ContextDetails::default()
            });
        }
        OperationType::Step => {
            let step = operation.step_details.get_or_insert_with(StepDetails::default);
            step.attempt = Some(step.attempt.unwrap_or(1));
        }
        OperationType::Wait => {
            let wait_seconds = update.wait_options.as_ref().map(|options| options.wait_seconds);
            let scheduled_end = deadline(&operation.id, now, wait_seconds.unwrap_or(0))?;
            operation.wait_details = Some(WaitDetails {
                wait_seconds,
                scheduled_end_timestamp: Some(scheduled_end),
            });
        }
        OperationType::Callback => {
            operation.callback_details = Some(CallbackDetails {
                callback_id: Some(Uuid::new_v4().to_string()),
                ..CallbackDetails::default()
            });
        }
        OperationType::Invoke => {
            operation.invoke_details = Some(InvokeDetails {
                function_name: update
                    .invoke_options
                    .as_ref()
                    .map(|options| options.function_name.clone()),
                ..InvokeDetails::default()
            });
        }
    }
    Ok(())
}

/// Stores a result and error in the operation's detail record.
fn store_outcome(operation: &mut Operation, result: Option<String>, error: Option<ErrorObject>) {
    match operation.operation_type {
        OperationType::Step => {
            let details = operation.step_details.get_or_insert_with(StepDetails::default);
            details.result = result;
            details.error = error;
        }
        OperationType::Context => {
            let details = operation
                .context_details
                .get_or_insert_with(ContextDetails::default);
            details.result = result;
            details.error = error;
        }
        OperationType::Callback => {
            let details = operation
                .callback_details
                .get_or_insert_with(CallbackDetails::default);
            details.result = result;
            details.error = error;
        }
        OperationType::Invoke => {
            let details = operation
                .invoke_details
                .get_or_insert_with(InvokeDetails::default);
            details.result = result;
            details.error = error;
        }
        OperationType::Execution | OperationType::Wait => {}
    }
}

fn result_details(result: Option<String>) -> EventDetails {
    EventDetails::Result(ResultDetails { result })
}

fn error_details(error: Option<ErrorObject>) -> EventDetails {
    EventDetails::Error(ErrorDetails { error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::replay_history;
    use proptest::prelude::*;

    fn started_manager() -> CheckpointManager {
        let mut manager = CheckpointManager::new("exec-1", None);
        manager.initialize(Some(r#"{"input":"test"}"#.to_string())).unwrap();
        manager
    }

    #[test]
    fn test_initialize_records_execution_started() {
        let manager = started_manager();
        let execution = manager.execution_operation().unwrap();
        assert_eq!(execution.operation_type, OperationType::Execution);
        assert_eq!(execution.status, OperationStatus::Started);
        assert_eq!(
            execution.execution_details.as_ref().and_then(|d| d.input_payload.as_deref()),
            Some(r#"{"input":"test"}"#)
        );

        let history = manager.get_history_events();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::ExecutionStarted);
        assert_eq!(history[0].event_id, 1);
    }

    #[test]
    fn test_callback_start_assigns_callback_id() {
        let mut manager = started_manager();
        let update = OperationUpdate::start("cb-op", OperationType::Callback)
            .with_callback_options(Some(300), None);

        let touched = manager.process_checkpoint(&[update]).unwrap();
        let callback_id = touched[0].callback_id().unwrap().to_string();
        assert!(manager.callback_manager().contains(&callback_id));

        match &manager.get_history_events()[1].details {
            EventDetails::CallbackStarted(details) => {
                assert_eq!(details.callback_id.as_deref(), Some(callback_id.as_str()));
                assert_eq!(details.timeout, Some(300));
            }
            other => panic!("unexpected details: {:?}", other),
        }

        let completed = manager
            .complete_callback(
                &callback_id,
                CompleteCallbackStatus::Success,
                Some("\"ok\"".to_string()),
                None,
            )
            .unwrap();
        assert_eq!(completed.status, OperationStatus::Succeeded);
        assert_eq!(
            completed.callback_details.and_then(|d| d.result),
            Some("\"ok\"".to_string())
        );
    }

    #[test]
    fn test_update_on_terminal_operation_is_rejected() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::succeed("step-1", OperationType::Step, None)])
            .unwrap();
        let events_before = manager.get_history_events().len();

        let err = manager
            .process_checkpoint(&[OperationUpdate::start("step-1", OperationType::Step)])
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidTransition { .. }));
        assert_eq!(manager.get_history_events().len(), events_before);
    }

    #[test]
    fn test_type_change_is_rejected() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::start("op-1", OperationType::Step)])
            .unwrap();
        let err = manager
            .process_checkpoint(&[OperationUpdate::start("op-1", OperationType::Wait)])
            .unwrap_err();
        assert!(matches!(err, TestError::OperationTypeMismatch { .. }));
    }

    #[test]
    fn test_cancel_has_no_history_event() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::start("ctx", OperationType::Context)])
            .unwrap();
        let err = manager
            .process_checkpoint(&[OperationUpdate::cancel("ctx", OperationType::Context)])
            .unwrap_err();
        assert!(matches!(err, TestError::NoHistoryEvent { .. }));
        assert_eq!(
            manager.get_operation("ctx").map(|op| op.status),
            Some(OperationStatus::Started)
        );
    }

    #[test]
    fn test_retry_advances_attempt_and_schedules_next() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::start("step-1", OperationType::Step)])
            .unwrap();
        let touched = manager
            .process_checkpoint(&[OperationUpdate::retry(
                "step-1",
                Some(ErrorObject::new("Flaky", "try again")),
                5,
            )])
            .unwrap();

        let step = &touched[0];
        assert_eq!(step.status, OperationStatus::Pending);
        let details = step.step_details.as_ref().unwrap();
        assert_eq!(details.attempt, Some(2));
        assert_eq!(details.next_attempt_delay_seconds, Some(5));
        assert!(details.next_attempt_timestamp.is_some());

        let last = manager.get_history_events().pop().unwrap();
        assert_eq!(last.event_type, EventType::StepStarted);
    }

    #[test]
    fn test_out_of_range_wait_is_rejected_without_side_effects() {
        let mut manager = started_manager();
        let events_before = manager.get_history_events().len();

        for seconds in [u64::MAX, 10_u64.pow(16)] {
            let err = manager
                .process_checkpoint(&[
                    OperationUpdate::start("wait-1", OperationType::Wait).with_wait_seconds(seconds)
                ])
                .unwrap_err();
            assert!(matches!(
                err,
                TestError::DurationOutOfRange { seconds: s, .. } if s == seconds
            ));
        }
        assert!(manager.get_operation("wait-1").is_none());
        assert_eq!(manager.get_history_events().len(), events_before);
    }

    #[test]
    fn test_out_of_range_retry_delay_is_rejected() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::start("step-1", OperationType::Step)])
            .unwrap();
        let events_before = manager.get_history_events().len();

        let err = manager
            .process_checkpoint(&[OperationUpdate::retry("step-1", None, u64::MAX)])
            .unwrap_err();
        assert!(err.is_protocol_error());

        let step = manager.get_operation("step-1").unwrap();
        assert_eq!(step.status, OperationStatus::Started);
        assert_eq!(step.step_details.as_ref().and_then(|d| d.attempt), Some(1));
        assert_eq!(manager.get_history_events().len(), events_before);
    }

    #[test]
    fn test_wait_completion_by_server() {
        let mut manager = started_manager();
        manager
            .process_checkpoint(&[OperationUpdate::start("wait-1", OperationType::Wait).with_wait_seconds(30)])
            .unwrap();
        let completed = manager
            .complete_operation("wait-1", OperationStatus::Succeeded, None, None)
            .unwrap();
        assert_eq!(completed.status, OperationStatus::Succeeded);
        assert!(completed.end_timestamp.is_some());

        let err = manager
            .complete_operation("wait-1", OperationStatus::Succeeded, None, None)
            .unwrap_err();
        assert!(matches!(err, TestError::InvalidTransition { .. }));
    }

    #[test]
    fn test_complete_invocation_completes_execution() {
        let mut manager = started_manager();
        manager.start_invocation("inv-1").unwrap();
        let invocation = manager
            .complete_invocation("inv-1", &InvocationOutput::Succeeded(Some("42".to_string())))
            .unwrap();
        assert_eq!(invocation.request_id.as_deref(), Some("inv-1"));
        assert!(manager.is_execution_completed());

        let types: Vec<EventType> = manager
            .get_history_events()
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::ExecutionStarted,
                EventType::InvocationCompleted,
                EventType::ExecutionSucceeded
            ]
        );
    }

    #[test]
    fn test_complete_unknown_invocation_fails() {
        let mut manager = started_manager();
        let result = manager.complete_invocation("unknown", &InvocationOutput::Pending);
        assert!(matches!(result, Err(TestError::InvocationNotFound(_))));
    }

    #[test]
    fn test_stale_token_is_rejected() {
        let mut manager = started_manager();
        let first = manager.start_invocation("inv-1").unwrap();
        let data = CheckpointTokenData::decode(&first).unwrap();

        let (second, _) = manager
            .checkpoint(&data, &first, &[OperationUpdate::start("s", OperationType::Step)])
            .unwrap();
        assert_ne!(first, second);

        let err = manager.checkpoint(&data, &first, &[]).unwrap_err();
        assert!(matches!(err, TestError::InvalidCheckpointToken(_)));
    }

    #[test]
    fn test_rejected_update_keeps_earlier_updates_and_token() {
        let mut manager = started_manager();
        let token = manager.start_invocation("inv-1").unwrap();
        let data = CheckpointTokenData::decode(&token).unwrap();

        let err = manager
            .checkpoint(
                &data,
                &token,
                &[
                    OperationUpdate::start("step-a", OperationType::Step),
                    OperationUpdate::cancel("step-a", OperationType::Step),
                    OperationUpdate::start("step-b", OperationType::Step),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, TestError::NoHistoryEvent { .. }));
        assert_eq!(
            manager.get_operation("step-a").map(|op| op.status),
            Some(OperationStatus::Started)
        );
        assert!(manager.get_operation("step-b").is_none());

        let batch = manager.flush_batch();
        assert!(batch.iter().any(|entry| entry.operation.id == "step-a"));

        let (_, touched) = manager
            .checkpoint(
                &data,
                &token,
                &[OperationUpdate::start("step-b", OperationType::Step)],
            )
            .unwrap();
        assert_eq!(touched[0].id, "step-b");
    }

    #[test]
    fn test_flush_batch_pairs_snapshots_with_new_events() {
        let mut manager = started_manager();
        manager.flush_batch();
        manager
            .process_checkpoint(&[
                OperationUpdate::start("step-1", OperationType::Step).with_name("fetch"),
                OperationUpdate::succeed("step-1", OperationType::Step, Some("1".to_string())),
            ])
            .unwrap();

        let batch = manager.flush_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].operation.status, OperationStatus::Succeeded);
        assert_eq!(batch[0].events.len(), 2);
        assert!(manager.flush_batch().is_empty());
    }

    #[test]
    fn test_operations_paging() {
        let mut manager = started_manager();
        let updates: Vec<OperationUpdate> = (0..5)
            .map(|i| OperationUpdate::start(format!("step-{}", i), OperationType::Step))
            .collect();
        manager.process_checkpoint(&updates).unwrap();

        let (first, marker) = manager.get_operations_page(None, Some(4)).unwrap();
        assert_eq!(first.len(), 4);
        let (rest, end) = manager.get_operations_page(marker.as_deref(), Some(4)).unwrap();
        assert_eq!(rest.len(), 2);
        assert!(end.is_none());
    }

    #[test]
    fn test_stop_execution_as_timed_out() {
        let mut manager = started_manager();
        let execution = manager.stop_execution(true, None).unwrap();
        assert_eq!(execution.status, OperationStatus::TimedOut);
        assert!(manager.stop_execution(false, None).is_err());
    }

    fn arbitrary_update() -> impl Strategy<Value = OperationUpdate> {
        let id = prop::sample::select(vec!["a", "b", "c"]);
        (id, 0u8..9, 0u64..100).prop_map(|(id, kind, n)| match kind {
            0 => OperationUpdate::start(id, OperationType::Step).with_name(id),
            1 => OperationUpdate::succeed(id, OperationType::Step, Some(n.to_string())),
            2 => OperationUpdate::fail(id, OperationType::Step, ErrorObject::new("E", "failed")),
            3 => OperationUpdate::retry(id, None, n),
            4 => OperationUpdate::start(id, OperationType::Wait).with_wait_seconds(n),
            5 => OperationUpdate::start(id, OperationType::Context).with_replay_children(n % 2 == 0),
            6 => OperationUpdate::succeed(id, OperationType::Context, Some(n.to_string())),
            7 => OperationUpdate::start(id, OperationType::Callback).with_callback_options(Some(n), None),
            _ => OperationUpdate::start(id, OperationType::Invoke).with_function_name("fn"),
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Replaying the history rebuilds the snapshots produced by direct application.
        #[test]
        fn prop_replay_matches_direct_application(
            updates in prop::collection::vec(arbitrary_update(), 1..25)
        ) {
            let mut manager = started_manager();
            for update in &updates {
                let _ = manager.process_checkpoint(std::slice::from_ref(update));
            }

            let replayed = replay_history(&manager.get_history_events());
            let replayed: Vec<Operation> = replayed.into_iter().map(|pair| pair.operation).collect();
            prop_assert_eq!(replayed, manager.get_state());
        }
    }
}
