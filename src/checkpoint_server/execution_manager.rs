//! State of all executions hosted by the checkpoint server.
//!
//! Each execution owns a [`CheckpointManager`]. Requests are routed to it by
//! execution id, by decoded checkpoint token, or by callback id.

use std::collections::HashMap;
use std::time::Instant;

use uuid::Uuid;

use super::callback_manager::CompleteCallbackStatus;
use super::checkpoint_manager::CheckpointManager;
use super::checkpoint_token::CheckpointTokenData;
use super::types::{
    CheckpointDurableExecutionStateRequest, CompleteInvocationRequest, ExecutionId,
    GetDurableExecutionStateRequest, InvocationResult, SendCallbackFailureRequest,
    SendCallbackHeartbeatRequest, SendCallbackSuccessRequest, StartDurableExecutionRequest,
    StartDurableExecutionResult, StartInvocationRequest, StopDurableExecutionRequest,
    UpdateCheckpointDataRequest,
};
use crate::client::{CheckpointResponse, GetOperationsResponse};
use crate::error::TestError;
use crate::history::{HistoryEvent, OperationEvents};
use crate::model::Operation;
use crate::types::Invocation;

/// Every execution hosted by one checkpoint server, keyed by execution id.
#[derive(Debug, Default)]
pub struct ExecutionManager {
    executions: HashMap<ExecutionId, CheckpointManager>,
    /// Callback id to the execution that issued it
    callbacks: HashMap<String, ExecutionId>,
}

impl ExecutionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an execution and starts its EXECUTION operation.
    ///
    /// No invocation is started; call [`start_invocation`](Self::start_invocation).
    pub fn start_execution(
        &mut self,
        request: StartDurableExecutionRequest,
    ) -> Result<StartDurableExecutionResult, TestError> {
        let execution_id = Uuid::new_v4().to_string();
        let mut manager = CheckpointManager::new(&execution_id, request.execution_timeout);
        let execution = manager.initialize(request.payload)?;
        self.executions.insert(execution_id.clone(), manager);

        tracing::debug!(execution_id = %execution_id, "Started durable execution");
        Ok(StartDurableExecutionResult {
            execution_id,
            execution_operation_id: execution.id,
        })
    }

    fn execution(&self, execution_id: &str) -> Result<&CheckpointManager, TestError> {
        self.executions
            .get(execution_id)
            .ok_or_else(|| TestError::execution_not_found(execution_id))
    }

    fn execution_mut(&mut self, execution_id: &str) -> Result<&mut CheckpointManager, TestError> {
        self.executions
            .get_mut(execution_id)
            .ok_or_else(|| TestError::execution_not_found(execution_id))
    }

    /// The checkpoint manager of an execution.
    pub fn get_checkpoints_by_execution(&self, execution_id: &str) -> Option<&CheckpointManager> {
        self.executions.get(execution_id)
    }

    /// Starts an invocation and hands back its token and the current operations.
    ///
    /// Fails once the execution has completed.
    pub fn start_invocation(
        &mut self,
        request: StartInvocationRequest,
    ) -> Result<InvocationResult, TestError> {
        let manager = self.execution_mut(&request.execution_id)?;
        if manager.is_execution_completed() {
            return Err(TestError::checkpoint_server_error(format!(
                "Execution {} already completed",
                request.execution_id
            )));
        }
        let checkpoint_token = manager.start_invocation(&request.invocation_id)?;
        Ok(InvocationResult {
            execution_id: request.execution_id,
            invocation_id: request.invocation_id,
            checkpoint_token,
            operations: manager.get_state(),
        })
    }

    /// Ends an invocation with the handler output.
    pub fn complete_invocation(
        &mut self,
        request: CompleteInvocationRequest,
    ) -> Result<Invocation, TestError> {
        self.execution_mut(&request.execution_id)?
            .complete_invocation(&request.invocation_id, &request.output)
    }

    /// Applies a checkpoint routed by its token.
    pub fn checkpoint(
        &mut self,
        request: CheckpointDurableExecutionStateRequest,
    ) -> Result<CheckpointResponse, TestError> {
        let token = CheckpointTokenData::decode(&request.checkpoint_token)?;
        if token.execution_id != request.durable_execution_arn {
            return Err(TestError::invalid_checkpoint_token(format!(
                "token belongs to execution {}",
                token.execution_id
            )));
        }

        let manager = self.execution_mut(&token.execution_id)?;
        let (checkpoint_token, operations) =
            manager.checkpoint(&token, &request.checkpoint_token, &request.operations)?;
        self.index_callbacks(&token.execution_id, &operations);

        Ok(CheckpointResponse::new(checkpoint_token).with_operations(operations))
    }

    fn index_callbacks(&mut self, execution_id: &str, operations: &[Operation]) {
        for callback_id in operations.iter().filter_map(Operation::callback_id) {
            self.callbacks
                .entry(callback_id.to_string())
                .or_insert_with(|| execution_id.to_string());
        }
    }

    /// One page of an execution's operations.
    pub fn get_state(
        &self,
        request: GetDurableExecutionStateRequest,
    ) -> Result<GetOperationsResponse, TestError> {
        let (operations, next_marker) = self
            .execution(&request.durable_execution_arn)?
            .get_operations_page(request.marker.as_deref(), request.max_items)?;
        Ok(GetOperationsResponse {
            operations,
            next_marker,
        })
    }

    pub fn get_history_events(&self, execution_id: &str) -> Result<Vec<HistoryEvent>, TestError> {
        Ok(self.execution(execution_id)?.get_history_events())
    }

    /// Completes an operation on the server's behalf.
    pub fn update_checkpoint_data(
        &mut self,
        request: UpdateCheckpointDataRequest,
    ) -> Result<Operation, TestError> {
        self.execution_mut(&request.execution_id)?.complete_operation(
            &request.operation_id,
            request.status,
            request.result,
            request.error,
        )
    }

    /// Stops an execution as STOPPED or TIMED_OUT.
    pub fn stop_execution(
        &mut self,
        request: StopDurableExecutionRequest,
    ) -> Result<Operation, TestError> {
        self.execution_mut(&request.execution_id)?
            .stop_execution(request.timed_out, request.error)
    }

    fn execution_for_callback(
        &mut self,
        callback_id: &str,
    ) -> Result<&mut CheckpointManager, TestError> {
        let execution_id = self
            .callbacks
            .get(callback_id)
            .cloned()
            .ok_or_else(|| TestError::callback_not_found(callback_id))?;
        self.execution_mut(&execution_id)
    }

    /// Routes a callback success to the execution that issued the callback id.
    pub fn send_callback_success(
        &mut self,
        request: SendCallbackSuccessRequest,
    ) -> Result<Operation, TestError> {
        self.execution_for_callback(&request.callback_id)?.complete_callback(
            &request.callback_id,
            CompleteCallbackStatus::Success,
            request.result,
            None,
        )
    }

    /// Routes a callback failure to the execution that issued the callback id.
    pub fn send_callback_failure(
        &mut self,
        request: SendCallbackFailureRequest,
    ) -> Result<Operation, TestError> {
        self.execution_for_callback(&request.callback_id)?.complete_callback(
            &request.callback_id,
            CompleteCallbackStatus::Failure,
            None,
            Some(request.error),
        )
    }

    pub fn send_callback_heartbeat(
        &mut self,
        request: SendCallbackHeartbeatRequest,
    ) -> Result<(), TestError> {
        self.execution_for_callback(&request.callback_id)?
            .send_callback_heartbeat(&request.callback_id)
    }

    /// Times out expired callbacks across all executions.
    pub fn check_callback_timeouts(&mut self, now: Instant) -> usize {
        self.executions
            .values_mut()
            .map(|manager| manager.check_callback_timeouts(now).len())
            .sum()
    }

    /// Drains the pending batch of every execution that has one.
    pub fn drain_batches(&mut self) -> Vec<(ExecutionId, Vec<OperationEvents>)> {
        self.executions
            .iter_mut()
            .filter(|(_, manager)| manager.has_pending_batch())
            .map(|(id, manager)| (id.clone(), manager.flush_batch()))
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }
}
