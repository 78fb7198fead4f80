//! Static mapping from update (action, operation type) pairs to history events.
//!
//! Each supported pair resolves to the [`EventType`] it produces and a pure
//! detail constructor. Pairs missing from the table have no history event;
//! callers treat that as a protocol error. Terminal wait, callback and
//! chained invoke events are synthesized by the checkpoint server itself and
//! are not reachable from a handler update.

use chrono::{DateTime, Utc};

use crate::history::{
    CallbackStartedDetails, ChainedInvokeStartedDetails, ContextStartedDetails, ErrorDetails,
    EventDetails, EventType, ExecutionStartedDetails, ResultDetails, RetryDetails,
    StepCompletedDetails, StepStartedDetails, WaitStartedDetails,
};
use crate::model::{checked_add_seconds, Operation, OperationAction, OperationType, OperationUpdate};

/// Inputs to a detail constructor that come from the processor rather than
/// the update or operation.
#[derive(Debug, Clone, Copy)]
pub struct DetailMetadata {
    /// Time at which the update is applied
    pub now: DateTime<Utc>,
    /// Execution-wide timeout in seconds, if one was configured
    pub execution_timeout: Option<u64>,
}

/// Builds an event's details from the update, the operation state after the
/// update was applied, and processor metadata.
pub type DetailBuilder = fn(&OperationUpdate, &Operation, &DetailMetadata) -> EventDetails;

/// The event produced by one (action, type) pair.
#[derive(Clone, Copy)]
pub struct HistoryResolution {
    pub event_type: EventType,
    pub build_details: DetailBuilder,
}

impl std::fmt::Debug for HistoryResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryResolution")
            .field("event_type", &self.event_type)
            .finish()
    }
}

const fn entry(
    action: OperationAction,
    operation_type: OperationType,
    event_type: EventType,
    build_details: DetailBuilder,
) -> (OperationAction, OperationType, HistoryResolution) {
    (
        action,
        operation_type,
        HistoryResolution {
            event_type,
            build_details,
        },
    )
}

const RESOLUTIONS: [(OperationAction, OperationType, HistoryResolution); 13] = [
    entry(OperationAction::Start, OperationType::Execution, EventType::ExecutionStarted, execution_started),
    entry(OperationAction::Fail, OperationType::Execution, EventType::ExecutionFailed, error_details),
    entry(OperationAction::Succeed, OperationType::Execution, EventType::ExecutionSucceeded, result_details),
    entry(OperationAction::Start, OperationType::Callback, EventType::CallbackStarted, callback_started),
    entry(OperationAction::Start, OperationType::Context, EventType::ContextStarted, context_started),
    entry(OperationAction::Fail, OperationType::Context, EventType::ContextFailed, error_details),
    entry(OperationAction::Succeed, OperationType::Context, EventType::ContextSucceeded, result_details),
    entry(OperationAction::Start, OperationType::Invoke, EventType::ChainedInvokeStarted, invoke_started),
    entry(OperationAction::Start, OperationType::Step, EventType::StepStarted, step_started),
    entry(OperationAction::Retry, OperationType::Step, EventType::StepStarted, step_retried),
    entry(OperationAction::Fail, OperationType::Step, EventType::StepFailed, step_completed),
    entry(OperationAction::Succeed, OperationType::Step, EventType::StepSucceeded, step_completed),
    entry(OperationAction::Start, OperationType::Wait, EventType::WaitStarted, wait_started),
];

/// Looks up the history event for an (action, type) pair.
pub fn resolve(action: OperationAction, operation_type: OperationType) -> Option<HistoryResolution> {
    RESOLUTIONS
        .iter()
        .find(|(a, t, _)| *a == action && *t == operation_type)
        .map(|(_, _, resolution)| *resolution)
}

fn execution_started(
    update: &OperationUpdate,
    _operation: &Operation,
    metadata: &DetailMetadata,
) -> EventDetails {
    EventDetails::ExecutionStarted(ExecutionStartedDetails {
        input_payload: update.payload.clone(),
        execution_timeout: metadata.execution_timeout,
    })
}

fn result_details(update: &OperationUpdate, _: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::Result(ResultDetails {
        result: update.payload.clone(),
    })
}

fn error_details(update: &OperationUpdate, _: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::Error(ErrorDetails {
        error: update.error.clone(),
    })
}

fn context_started(update: &OperationUpdate, _: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::ContextStarted(ContextStartedDetails {
        replay_children: update
            .context_options
            .as_ref()
            .and_then(|options| options.replay_children),
    })
}

fn callback_started(
    update: &OperationUpdate,
    operation: &Operation,
    _: &DetailMetadata,
) -> EventDetails {
    let options = update.callback_options.as_ref();
    EventDetails::CallbackStarted(CallbackStartedDetails {
        callback_id: operation.callback_id().map(str::to_string),
        timeout: options.and_then(|o| o.timeout_seconds),
        heartbeat_timeout: options.and_then(|o| o.heartbeat_timeout_seconds),
        input: update.payload.clone(),
    })
}

fn invoke_started(update: &OperationUpdate, _: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::ChainedInvokeStarted(ChainedInvokeStartedDetails {
        function_name: update
            .invoke_options
            .as_ref()
            .map(|options| options.function_name.clone()),
        input: update.payload.clone(),
    })
}

fn step_started(_: &OperationUpdate, _: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::StepStarted(StepStartedDetails::default())
}

fn step_retried(update: &OperationUpdate, operation: &Operation, _: &DetailMetadata) -> EventDetails {
    EventDetails::StepStarted(StepStartedDetails {
        error: update.error.clone(),
        retry_details: Some(retry_details(operation)),
    })
}

fn step_completed(
    update: &OperationUpdate,
    operation: &Operation,
    _: &DetailMetadata,
) -> EventDetails {
    EventDetails::StepCompleted(StepCompletedDetails {
        result: update.payload.clone(),
        error: update.error.clone(),
        retry_details: retry_details(operation),
    })
}

/// Read from the operation snapshot, never from the update.
fn retry_details(operation: &Operation) -> RetryDetails {
    let step = operation.step_details.as_ref();
    RetryDetails {
        current_attempt: step.and_then(|s| s.attempt),
        next_attempt_delay_seconds: step.and_then(|s| s.next_attempt_delay_seconds),
    }
}

/// Prefers the deadline already stored on the operation. Out-of-range
/// durations are rejected before an event is built, so the last fallback
/// only applies to a bare operation.
fn wait_started(update: &OperationUpdate, operation: &Operation, metadata: &DetailMetadata) -> EventDetails {
    let duration = update.wait_options.as_ref().map(|options| options.wait_seconds);
    let scheduled_end_timestamp = operation
        .wait_details
        .as_ref()
        .and_then(|details| details.scheduled_end_timestamp)
        .or_else(|| checked_add_seconds(metadata.now, duration.unwrap_or(0)))
        .unwrap_or(metadata.now);
    EventDetails::WaitStarted(WaitStartedDetails {
        duration,
        scheduled_end_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CallbackDetails, StepDetails};

    fn metadata() -> DetailMetadata {
        DetailMetadata {
            now: Utc::now(),
            execution_timeout: Some(900),
        }
    }

    #[test]
    fn test_supported_pairs_resolve() {
        let supported = [
            (OperationAction::Start, OperationType::Execution, EventType::ExecutionStarted),
            (OperationAction::Fail, OperationType::Execution, EventType::ExecutionFailed),
            (OperationAction::Succeed, OperationType::Execution, EventType::ExecutionSucceeded),
            (OperationAction::Start, OperationType::Callback, EventType::CallbackStarted),
            (OperationAction::Start, OperationType::Context, EventType::ContextStarted),
            (OperationAction::Fail, OperationType::Context, EventType::ContextFailed),
            (OperationAction::Succeed, OperationType::Context, EventType::ContextSucceeded),
            (OperationAction::Start, OperationType::Invoke, EventType::ChainedInvokeStarted),
            (OperationAction::Start, OperationType::Step, EventType::StepStarted),
            (OperationAction::Retry, OperationType::Step, EventType::StepStarted),
            (OperationAction::Fail, OperationType::Step, EventType::StepFailed),
            (OperationAction::Succeed, OperationType::Step, EventType::StepSucceeded),
            (OperationAction::Start, OperationType::Wait, EventType::WaitStarted),
        ];
        for (action, operation_type, expected) in supported {
            let resolution = resolve(action, operation_type).unwrap();
            assert_eq!(resolution.event_type, expected, "{} {}", action, operation_type);
        }
    }

    #[test]
    fn test_unsupported_pairs_do_not_resolve() {
        assert!(resolve(OperationAction::Succeed, OperationType::Wait).is_none());
        assert!(resolve(OperationAction::Succeed, OperationType::Callback).is_none());
        assert!(resolve(OperationAction::Retry, OperationType::Wait).is_none());
        assert!(resolve(OperationAction::Cancel, OperationType::Wait).is_none());
        assert!(resolve(OperationAction::Succeed, OperationType::Invoke).is_none());
    }

    #[test]
    fn test_wait_started_details() {
        let meta = metadata();
        let update = OperationUpdate::start("w", OperationType::Wait).with_wait_seconds(10);
        let operation = Operation::new("w", OperationType::Wait);
        let resolution = resolve(OperationAction::Start, OperationType::Wait).unwrap();

        match (resolution.build_details)(&update, &operation, &meta) {
            EventDetails::WaitStarted(details) => {
                assert_eq!(details.duration, Some(10));
                assert_eq!(
                    details.scheduled_end_timestamp,
                    meta.now + chrono::Duration::seconds(10)
                );
            }
            other => panic!("unexpected details: {:?}", other),
        }

        let bare = OperationUpdate::start("w", OperationType::Wait);
        match (resolution.build_details)(&bare, &operation, &meta) {
            EventDetails::WaitStarted(details) => {
                assert_eq!(details.duration, None);
                assert_eq!(details.scheduled_end_timestamp, meta.now);
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_wait_started_uses_stored_deadline() {
        let meta = metadata();
        let deadline = meta.now + chrono::Duration::seconds(45);
        let update = OperationUpdate::start("w", OperationType::Wait).with_wait_seconds(u64::MAX);
        let mut operation = Operation::new("w", OperationType::Wait);
        operation.wait_details = Some(crate::model::WaitDetails {
            wait_seconds: Some(45),
            scheduled_end_timestamp: Some(deadline),
        });
        let resolution = resolve(OperationAction::Start, OperationType::Wait).unwrap();

        match (resolution.build_details)(&update, &operation, &meta) {
            EventDetails::WaitStarted(details) => {
                assert_eq!(details.scheduled_end_timestamp, deadline);
            }
            other => panic!("unexpected details: {:?}", other),
        }

        let bare = Operation::new("w", OperationType::Wait);
        match (resolution.build_details)(&update, &bare, &meta) {
            EventDetails::WaitStarted(details) => {
                assert_eq!(details.duration, Some(u64::MAX));
                assert_eq!(details.scheduled_end_timestamp, meta.now);
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_step_completion_reads_attempt_from_operation() {
        let mut update = OperationUpdate::succeed("s", OperationType::Step, Some("42".to_string()));
        update.step_options = Some(crate::model::StepOptions {
            next_attempt_delay_seconds: Some(99),
        });
        let mut operation = Operation::new("s", OperationType::Step);
        operation.step_details = Some(StepDetails {
            attempt: Some(3),
            next_attempt_delay_seconds: Some(5),
            ..StepDetails::default()
        });

        let resolution = resolve(OperationAction::Succeed, OperationType::Step).unwrap();
        match (resolution.build_details)(&update, &operation, &metadata()) {
            EventDetails::StepCompleted(details) => {
                assert_eq!(details.result.as_deref(), Some("42"));
                assert_eq!(details.retry_details.current_attempt, Some(3));
                assert_eq!(details.retry_details.next_attempt_delay_seconds, Some(5));
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_callback_started_merges_operation_and_update() {
        let update = OperationUpdate::start("cb", OperationType::Callback)
            .with_callback_options(Some(300), Some(30))
            .with_payload("{\"order\":1}");
        let mut operation = Operation::new("cb", OperationType::Callback);
        operation.callback_details = Some(CallbackDetails {
            callback_id: Some("callback-xyz".to_string()),
            ..CallbackDetails::default()
        });

        let resolution = resolve(OperationAction::Start, OperationType::Callback).unwrap();
        match (resolution.build_details)(&update, &operation, &metadata()) {
            EventDetails::CallbackStarted(details) => {
                assert_eq!(details.callback_id.as_deref(), Some("callback-xyz"));
                assert_eq!(details.timeout, Some(300));
                assert_eq!(details.heartbeat_timeout, Some(30));
                assert_eq!(details.input.as_deref(), Some("{\"order\":1}"));
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }

    #[test]
    fn test_execution_started_includes_timeout() {
        let update = OperationUpdate::start("exec", OperationType::Execution).with_payload("{}");
        let operation = Operation::new("exec", OperationType::Execution);
        let resolution = resolve(OperationAction::Start, OperationType::Execution).unwrap();
        match (resolution.build_details)(&update, &operation, &metadata()) {
            EventDetails::ExecutionStarted(details) => {
                assert_eq!(details.execution_timeout, Some(900));
                assert_eq!(details.input_payload.as_deref(), Some("{}"));
            }
            other => panic!("unexpected details: {:?}", other),
        }
    }
}
