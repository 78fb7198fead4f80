//! Turns a terminal execution into a [`TestResult`].

use serde::de::DeserializeOwned;

use crate::error::TestError;
use crate::history::{EventDetails, EventType, HistoryEvent};
use crate::model::Operation;
use crate::test_result::TestResult;
use crate::types::{ExecutionStatus, Invocation, TestResultError};

/// Outcome of an execution as recorded in its history.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    /// Serialized result of a successful execution
    pub result: Option<String>,
    pub error: Option<TestResultError>,
}

impl ExecutionRecord {
    /// Reads the outcome from the EXECUTION operation and its terminal event.
    pub fn from_execution_events(execution: &Operation, events: &[HistoryEvent]) -> Self {
        let status = ExecutionStatus::from_operation_status(execution.status);
        let terminal = events.iter().rev().find(|event| {
            event.id.as_deref() == Some(execution.id.as_str())
                && matches!(
                    event.event_type,
                    EventType::ExecutionSucceeded
                        | EventType::ExecutionFailed
                        | EventType::ExecutionTimedOut
                        | EventType::ExecutionStopped
                )
        });

        Self {
            status,
            result: terminal
                .and_then(|event| event.details.result())
                .map(str::to_string),
            error: terminal
                .and_then(|event| event.details.error())
                .cloned()
                .map(TestResultError::from),
        }
    }
}

/// Builds [`TestResult`] values from terminal execution records.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFormatter;

impl ResultFormatter {
    /// Combines the record, the operations and the event log into a result.
    ///
    /// A successful execution without a result deserializes from `null`, so
    /// `()` and `Option<_>` outputs work.
    pub fn create_test_result<T: DeserializeOwned>(
        record: ExecutionRecord,
        operations: Vec<Operation>,
        history_events: Vec<HistoryEvent>,
    ) -> Result<TestResult<T>, TestError> {
        let invocations = invocations_from_history(&history_events);
        let result = match record.status {
            ExecutionStatus::Succeeded => {
                let json = record.result.as_deref().unwrap_or("null");
                TestResult::success(serde_json::from_str(json)?, operations)
            }
            status if status.is_terminal() => TestResult::failure(status, record.error, operations),
            status => {
                return Err(TestError::result_not_available(format!(
                    "Execution has not completed ({})",
                    status
                )))
            }
        };
        Ok(result
            .with_invocations(invocations)
            .with_history_events(history_events))
    }
}

/// One [`Invocation`] per `InvocationCompleted` event, in history order.
pub fn invocations_from_history(events: &[HistoryEvent]) -> Vec<Invocation> {
    events
        .iter()
        .filter_map(|event| match &event.details {
            EventDetails::InvocationCompleted(details) => {
                let invocation = Invocation::with_start(details.start_timestamp)
                    .with_end(details.end_timestamp)
                    .with_request_id(details.request_id.clone());
                Some(match &details.error {
                    Some(error) => invocation.with_error(error.clone().into()),
                    None => invocation,
                })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ErrorDetails, InvocationCompletedDetails, ResultDetails};
    use crate::model::{ErrorObject, OperationStatus, OperationType};
    use chrono::Utc;

    fn event(event_id: u64, event_type: EventType, details: EventDetails) -> HistoryEvent {
        HistoryEvent {
            event_id,
            event_type,
            id: Some("exec".to_string()),
            name: None,
            parent_id: None,
            sub_type: None,
            event_timestamp: Utc::now(),
            details,
        }
    }

    fn execution(status: OperationStatus) -> Operation {
        Operation::new("exec", OperationType::Execution).with_status(status)
    }

    #[test]
    fn test_success_result_is_deserialized() {
        let events = vec![event(
            2,
            EventType::ExecutionSucceeded,
            EventDetails::Result(ResultDetails {
                result: Some("{\"total\":3}".to_string()),
            }),
        )];
        let record = ExecutionRecord::from_execution_events(&execution(OperationStatus::Succeeded), &events);

        let result: TestResult<serde_json::Value> =
            ResultFormatter::create_test_result(record, vec![], events).unwrap();
        assert_eq!(result.get_result().unwrap()["total"], 3);
        assert_eq!(result.get_history_events().len(), 1);
    }

    #[test]
    fn test_failed_execution_keeps_error() {
        let events = vec![event(
            2,
            EventType::ExecutionFailed,
            EventDetails::Error(ErrorDetails {
                error: Some(ErrorObject::new("Boom", "it broke")),
            }),
        )];
        let record = ExecutionRecord::from_execution_events(&execution(OperationStatus::Failed), &events);
        assert_eq!(record.status, ExecutionStatus::Failed);

        let result: TestResult<String> =
            ResultFormatter::create_test_result(record, vec![], events).unwrap();
        assert_eq!(result.get_error().unwrap().error_type.as_deref(), Some("Boom"));
    }

    #[test]
    fn test_unit_result_without_payload() {
        let record = ExecutionRecord::from_execution_events(&execution(OperationStatus::Succeeded), &[]);
        let result: TestResult<()> = ResultFormatter::create_test_result(record, vec![], vec![]).unwrap();
        assert!(result.get_result().is_ok());
    }

    #[test]
    fn test_running_execution_is_rejected() {
        let record = ExecutionRecord::from_execution_events(&execution(OperationStatus::Started), &[]);
        let result = ResultFormatter::create_test_result::<String>(record, vec![], vec![]);
        assert!(matches!(result, Err(TestError::ResultNotAvailable(_))));
    }

    #[test]
    fn test_invocations_from_history() {
        let now = Utc::now();
        let completed = |request_id: &str, error: Option<ErrorObject>| {
            EventDetails::InvocationCompleted(InvocationCompletedDetails {
                start_timestamp: now,
                end_timestamp: now,
                request_id: request_id.to_string(),
                error,
            })
        };
        let events = vec![
            event(2, EventType::InvocationCompleted, completed("req-1", None)),
            event(
                4,
                EventType::InvocationCompleted,
                completed("req-2", Some(ErrorObject::new("Boom", "x"))),
            ),
        ];

        let invocations = invocations_from_history(&events);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].request_id.as_deref(), Some("req-1"));
        assert!(invocations[0].error.is_none());
        assert!(invocations[1].error.is_some());
    }
}
