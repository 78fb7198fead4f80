//! Event processor for generating history events.
//!
//! The processor owns the per-execution event id counter. Ids start at 1 and
//! increase by one for every event produced, whether it came from a handler
//! update ([`EventProcessor::process_update`]) or was synthesized by the
//! server ([`EventProcessor::create_history_event`]).

use chrono::{DateTime, Utc};

use crate::checkpoint_server::history_resolver::{self, DetailMetadata};
use crate::error::TestError;
use crate::history::{EventDetails, EventType, HistoryEvent};
use crate::model::{Operation, OperationAction, OperationType, OperationUpdate};

/// Returns the update's action and type, or a missing action/type error.
pub(crate) fn require_action_and_type(
    update: &OperationUpdate,
) -> Result<(OperationAction, OperationType), TestError> {
    match (update.action, update.operation_type) {
        (Some(action), Some(operation_type)) => Ok((action, operation_type)),
        (action, operation_type) => Err(TestError::missing_action_or_type(
            action.as_ref().map(OperationAction::as_str),
            operation_type.as_ref().map(OperationType::as_str),
        )),
    }
}

/// Produces history events with monotonically increasing ids.
#[derive(Debug, Default)]
pub struct EventProcessor {
    /// Id of the last event produced
    event_counter: u64,
    /// Included in `ExecutionStarted` details
    execution_timeout: Option<u64>,
}

impl EventProcessor {
    /// Create a new event processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution-wide timeout reported in `ExecutionStarted`.
    pub fn set_execution_timeout(&mut self, execution_timeout: Option<u64>) {
        self.execution_timeout = execution_timeout;
    }

    /// Creates an event from already computed details.
    ///
    /// Used for transitions the server performs itself (wait and callback
    /// completion, chained invoke results, invocation bookkeeping).
    pub fn create_history_event(
        &mut self,
        event_type: EventType,
        operation: &Operation,
        details: EventDetails,
    ) -> HistoryEvent {
        self.create_history_event_at(event_type, operation, details, Utc::now())
    }

    fn create_history_event_at(
        &mut self,
        event_type: EventType,
        operation: &Operation,
        details: EventDetails,
        timestamp: DateTime<Utc>,
    ) -> HistoryEvent {
        self.event_counter += 1;
        HistoryEvent {
            event_id: self.event_counter,
            event_type,
            id: Some(operation.id.clone()),
            name: operation.name.clone(),
            parent_id: operation.parent_id.clone(),
            sub_type: operation.sub_type.clone(),
            event_timestamp: timestamp,
            details,
        }
    }

    /// Builds the event for a handler update.
    ///
    /// `operation` is the snapshot after the update was applied and `now` the
    /// time it was applied at; the event is stamped with the same instant.
    ///
    /// # Errors
    ///
    /// * `MissingActionOrType` if the update has no action or no type
    /// * `NoHistoryEvent` if the (action, type) pair has no mapping
    pub fn process_update(
        &mut self,
        update: &OperationUpdate,
        operation: &Operation,
        now: DateTime<Utc>,
    ) -> Result<HistoryEvent, TestError> {
        let (action, operation_type) = require_action_and_type(update)?;
        let resolution = history_resolver::resolve(action, operation_type)
            .ok_or_else(|| TestError::no_history_event(action.as_str(), operation_type.as_str()))?;

        let metadata = DetailMetadata {
            now,
            execution_timeout: self.execution_timeout,
        };
        let details = (resolution.build_details)(update, operation, &metadata);
        Ok(self.create_history_event_at(resolution.event_type, operation, details, now))
    }

    /// Number of events produced so far.
    pub fn event_count(&self) -> u64 {
        self.event_counter
    }
}
