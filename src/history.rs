//! History events and event-sourced reconstruction of operation state.
//!
//! Every accepted update produces exactly one [`HistoryEvent`]. Events are
//! immutable; replaying an execution's events in order with
//! [`replay_history`] rebuilds the operation snapshots the checkpoint server
//! holds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    checked_add_seconds, CallbackDetails, ContextDetails, ErrorObject, ExecutionDetails,
    InvokeDetails, Operation, OperationStatus, OperationType, StepDetails, WaitDetails,
};

/// Named state transitions recorded in an execution's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ExecutionStarted,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionTimedOut,
    ExecutionStopped,
    ContextStarted,
    ContextSucceeded,
    ContextFailed,
    WaitStarted,
    WaitSucceeded,
    WaitCancelled,
    StepStarted,
    StepSucceeded,
    StepFailed,
    CallbackStarted,
    CallbackSucceeded,
    CallbackFailed,
    CallbackTimedOut,
    ChainedInvokeStarted,
    ChainedInvokeSucceeded,
    ChainedInvokeFailed,
    ChainedInvokeTimedOut,
    ChainedInvokeStopped,
    InvocationCompleted,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_children: Option<bool>,
}

/// Result carried by a successful completion event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Error carried by a failed, cancelled, timed out or stopped event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Attempt bookkeeping copied from the step when the event was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_delay_seconds: Option<u64>,
}

/// Details of a `StepStarted` event. `retry_details` is present only when
/// the event was produced by a RETRY.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_details: Option<RetryDetails>,
}

/// Details of `StepSucceeded` and `StepFailed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepCompletedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub retry_details: RetryDetails,
}

/// Details of `WaitStarted`. `duration` is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub scheduled_end_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitSucceededDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// Details of `CallbackStarted`, including the server-assigned callback id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChainedInvokeStartedDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

/// Details of `InvocationCompleted`; one per handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationCompletedDetails {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Detail payload of a history event, one variant per detail shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "DetailType", content = "Details")]
pub enum EventDetails {
    ContextStarted(ContextStartedDetails),
    ExecutionStarted(ExecutionStartedDetails),
    Result(ResultDetails),
    Error(ErrorDetails),
    StepStarted(StepStartedDetails),
    StepCompleted(StepCompletedDetails),
    WaitStarted(WaitStartedDetails),
    WaitSucceeded(WaitSucceededDetails),
    CallbackStarted(CallbackStartedDetails),
    ChainedInvokeStarted(ChainedInvokeStartedDetails),
    InvocationCompleted(InvocationCompletedDetails),
}

impl EventDetails {
    /// Returns the result payload if the details carry one.
    pub fn result(&self) -> Option<&str> {
        match self {
            Self::Result(details) => details.result.as_deref(),
            Self::StepCompleted(details) => details.result.as_deref(),
            _ => None,
        }
    }

    /// Returns the error payload if the details carry one.
    pub fn error(&self) -> Option<&ErrorObject> {
        match self {
            Self::Error(details) => details.error.as_ref(),
            Self::StepStarted(details) => details.error.as_ref(),
            Self::StepCompleted(details) => details.error.as_ref(),
            Self::InvocationCompleted(details) => details.error.as_ref(),
            _ => None,
        }
    }
}

/// An immutable, append-only record of one operation transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryEvent {
    pub event_id: u64,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub details: EventDetails,
}

/// An operation snapshot together with history events for that operation.
///
/// In a checkpoint batch the events are the ones produced since the previous
/// batch; inside the operation index they accumulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationEvents {
    pub operation: Operation,
    #[serde(default)]
    pub events: Vec<HistoryEvent>,
}

impl OperationEvents {
    pub fn new(operation: Operation, events: Vec<HistoryEvent>) -> Self {
        Self { operation, events }
    }
}

/// Rebuilds operation snapshots from an ordered event log.
///
/// Operations are returned in first-seen order, each with the events that
/// touched it. Events without an operation id are skipped.
pub fn replay_history(events: &[HistoryEvent]) -> Vec<OperationEvents> {
    let mut order: Vec<String> = Vec::new();
    let mut replayed: HashMap<String, OperationEvents> = HashMap::new();

    for event in events {
        let Some(id) = event.id.clone() else {
            continue;
        };
        match replayed.get_mut(&id) {
            Some(entry) => {
                apply_event(&mut entry.operation, event);
                entry.events.push(event.clone());
            }
            None => {
                let Some(operation_type) = operation_type_of(event.event_type) else {
                    continue;
                };
                let mut operation = Operation::new(id.clone(), operation_type);
                operation.name = event.name.clone();
                operation.parent_id = event.parent_id.clone();
                operation.sub_type = event.sub_type.clone();
                operation.start_timestamp = Some(event.event_timestamp);
                apply_event(&mut operation, event);
                order.push(id.clone());
                replayed.insert(id, OperationEvents::new(operation, vec![event.clone()]));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| replayed.remove(&id))
        .collect()
}

fn operation_type_of(event_type: EventType) -> Option<OperationType> {
    use EventType::*;
    match event_type {
        ExecutionStarted | ExecutionSucceeded | ExecutionFailed | ExecutionTimedOut
        | ExecutionStopped => Some(OperationType::Execution),
        ContextStarted | ContextSucceeded | ContextFailed => Some(OperationType::Context),
        WaitStarted | WaitSucceeded | WaitCancelled => Some(OperationType::Wait),
        StepStarted | StepSucceeded | StepFailed => Some(OperationType::Step),
        CallbackStarted | CallbackSucceeded | CallbackFailed | CallbackTimedOut => {
            Some(OperationType::Callback)
        }
        ChainedInvokeStarted | ChainedInvokeSucceeded | ChainedInvokeFailed
        | ChainedInvokeTimedOut | ChainedInvokeStopped => Some(OperationType::Invoke),
        InvocationCompleted => None,
    }
}

fn terminal_status_of(event_type: EventType) -> Option<OperationStatus> {
    use EventType::*;
    match event_type {
        ExecutionSucceeded | ContextSucceeded | WaitSucceeded | StepSucceeded
        | CallbackSucceeded | ChainedInvokeSucceeded => Some(OperationStatus::Succeeded),
        ExecutionFailed | ContextFailed | StepFailed | CallbackFailed | ChainedInvokeFailed => {
            Some(OperationStatus::Failed)
        }
        WaitCancelled => Some(OperationStatus::Cancelled),
        ExecutionTimedOut | CallbackTimedOut | ChainedInvokeTimedOut => {
            Some(OperationStatus::TimedOut)
        }
        ExecutionStopped | ChainedInvokeStopped => Some(OperationStatus::Stopped),
        _ => None,
    }
}

fn apply_event(operation: &mut Operation, event: &HistoryEvent) {
    if operation.name.is_none() {
        operation.name = event.name.clone();
    }
    if let Some(status) = terminal_status_of(event.event_type) {
        operation.status = status;
        operation.end_timestamp = Some(event.event_timestamp);
    }

    match &event.details {
        EventDetails::InvocationCompleted(_) | EventDetails::WaitSucceeded(_) => {}
        EventDetails::ContextStarted(details) => {
            operation.status = OperationStatus::Started;
            operation.context_details = Some(ContextDetails {
                replay_children: details.replay_children,
                ..ContextDetails::default()
            });
        }
        EventDetails::ExecutionStarted(details) => {
            operation.status = OperationStatus::Started;
            operation.execution_details = Some(ExecutionDetails {
                input_payload: details.input_payload.clone(),
            });
        }
        EventDetails::StepStarted(details) => {
            let step = operation.step_details.get_or_insert_with(StepDetails::default);
            match &details.retry_details {
                Some(retry) => {
                    operation.status = OperationStatus::Pending;
                    step.attempt = retry.current_attempt;
                    step.next_attempt_delay_seconds = retry.next_attempt_delay_seconds;
                    step.next_attempt_timestamp = retry
                        .next_attempt_delay_seconds
                        .and_then(|delay| checked_add_seconds(event.event_timestamp, delay));
                    step.error = details.error.clone();
                }
                None => {
                    operation.status = OperationStatus::Started;
                    step.attempt = Some(step.attempt.unwrap_or(1));
                }
            }
        }
        EventDetails::StepCompleted(details) => {
            let step = operation.step_details.get_or_insert_with(StepDetails::default);
            step.attempt = details.retry_details.current_attempt;
            step.result = details.result.clone();
            step.error = details.error.clone();
        }
        EventDetails::WaitStarted(details) => {
            operation.status = OperationStatus::Started;
            operation.wait_details = Some(WaitDetails {
                wait_seconds: details.duration,
                scheduled_end_timestamp: Some(details.scheduled_end_timestamp),
            });
        }
        EventDetails::CallbackStarted(details) => {
            operation.status = OperationStatus::Started;
            operation.callback_details = Some(CallbackDetails {
                callback_id: details.callback_id.clone(),
                ..CallbackDetails::default()
            });
        }
        EventDetails::ChainedInvokeStarted(details) => {
            operation.status = OperationStatus::Started;
            operation.invoke_details = Some(InvokeDetails {
                function_name: details.function_name.clone(),
                ..InvokeDetails::default()
            });
        }
        EventDetails::Result(details) => store_outcome(operation, details.result.clone(), None),
        EventDetails::Error(details) => store_outcome(operation, None, details.error.clone()),
    }
}

fn store_outcome(operation: &mut Operation, result: Option<String>, error: Option<ErrorObject>) {
    match operation.operation_type {
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
        OperationType::Execution | OperationType::Step | OperationType::Wait => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_id: u64, event_type: EventType, id: &str, details: EventDetails) -> HistoryEvent {
        HistoryEvent {
            event_id,
            event_type,
            id: Some(id.to_string()),
            name: Some(format!("{}-name", id)),
            parent_id: None,
            sub_type: None,
            event_timestamp: Utc::now(),
            details,
        }
    }

    #[test]
    fn test_replay_callback_lifecycle() {
        let events = vec![
            event(
                1,
                EventType::CallbackStarted,
                "cb",
                EventDetails::CallbackStarted(CallbackStartedDetails {
                    callback_id: Some("callback-1".to_string()),
                    timeout: Some(300),
                    ..CallbackStartedDetails::default()
                }),
            ),
            event(
                2,
                EventType::CallbackSucceeded,
                "cb",
                EventDetails::Result(ResultDetails {
                    result: Some("\"ok\"".to_string()),
                }),
            ),
        ];

        let replayed = replay_history(&events);
        assert_eq!(replayed.len(), 1);
        let operation = &replayed[0].operation;
        assert_eq!(operation.operation_type, OperationType::Callback);
        assert_eq!(operation.status, OperationStatus::Succeeded);
        assert_eq!(operation.callback_id(), Some("callback-1"));
        assert_eq!(
            operation.callback_details.as_ref().and_then(|d| d.result.as_deref()),
            Some("\"ok\"")
        );
        assert_eq!(replayed[0].events.len(), 2);
    }

    #[test]
    fn test_replay_step_retry_then_success() {
        let events = vec![
            event(1, EventType::StepStarted, "s", EventDetails::StepStarted(StepStartedDetails::default())),
            event(
                2,
                EventType::StepStarted,
                "s",
                EventDetails::StepStarted(StepStartedDetails {
                    error: None,
                    retry_details: Some(RetryDetails {
                        current_attempt: Some(2),
                        next_attempt_delay_seconds: Some(5),
                    }),
                }),
            ),
        ];
        let replayed = replay_history(&events);
        let step = &replayed[0].operation;
        assert_eq!(step.status, OperationStatus::Pending);
        assert_eq!(step.step_details.as_ref().and_then(|d| d.attempt), Some(2));
        assert!(step
            .step_details
            .as_ref()
            .and_then(|d| d.next_attempt_timestamp)
            .is_some());
    }

    #[test]
    fn test_replay_tolerates_unrepresentable_retry_delay() {
        let events = vec![event(
            1,
            EventType::StepStarted,
            "s",
            EventDetails::StepStarted(StepStartedDetails {
                error: None,
                retry_details: Some(RetryDetails {
                    current_attempt: Some(2),
                    next_attempt_delay_seconds: Some(u64::MAX),
                }),
            }),
        )];
        let replayed = replay_history(&events);
        let details = replayed[0].operation.step_details.as_ref().unwrap();
        assert_eq!(details.next_attempt_delay_seconds, Some(u64::MAX));
        assert_eq!(details.next_attempt_timestamp, None);
    }

    #[test]
    fn test_replay_skips_events_without_operation() {
        let mut orphan = event(
            1,
            EventType::InvocationCompleted,
            "x",
            EventDetails::InvocationCompleted(InvocationCompletedDetails {
                start_timestamp: Utc::now(),
                end_timestamp: Utc::now(),
                request_id: "req".to_string(),
                error: None,
            }),
        );
        orphan.id = None;
        assert!(replay_history(&[orphan]).is_empty());
    }

    #[test]
    fn test_event_details_serialize_tagged() {
        let details = EventDetails::WaitSucceeded(WaitSucceededDetails { duration: Some(3) });
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["DetailType"], "WaitSucceeded");
        assert_eq!(json["Details"]["Duration"], 3);
    }
}
