//! The checkpoint server thread and the handle that talks to it.
//!
//! The server runs on its own thread with a current-thread tokio runtime.
//! Requests cross the boundary as JSON envelopes over an mpsc channel and are
//! answered through a oneshot. Operation batches produced by each request are
//! pushed to per-execution subscribers before the request is answered.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::execution_manager::ExecutionManager;
use super::types::{
    ApiType, CheckpointDurableExecutionStateRequest, CheckpointWorkerParams,
    CompleteInvocationRequest, ExecutionId, GetDurableExecutionStateRequest, InvocationResult,
    SendCallbackFailureRequest, SendCallbackHeartbeatRequest, SendCallbackSuccessRequest,
    StartDurableExecutionRequest, StartDurableExecutionResult, StartInvocationRequest,
    StopDurableExecutionRequest, UpdateCheckpointDataRequest, WorkerApiRequest,
    WorkerApiResponse,
};
use crate::client::{CheckpointClient, CheckpointResponse, GetOperationsResponse};
use crate::error::TestError;
use crate::history::OperationEvents;
use crate::model::{ErrorObject, Operation, OperationUpdate};
use crate::operation::CallbackSender;
use crate::types::{Invocation, TestResultError};

/// Receives the operation batches of one execution.
pub type BatchReceiver = mpsc::UnboundedReceiver<Vec<OperationEvents>>;
type BatchSender = mpsc::UnboundedSender<Vec<OperationEvents>>;

enum WorkerMessage {
    Command(WorkerApiRequest, oneshot::Sender<WorkerApiResponse>),
    Subscribe {
        execution_id: ExecutionId,
        sender: BatchSender,
        ack: oneshot::Sender<()>,
    },
    Shutdown,
}

/// State owned by the server thread.
struct CheckpointServer {
    execution_manager: ExecutionManager,
    params: CheckpointWorkerParams,
    subscribers: HashMap<ExecutionId, Vec<BatchSender>>,
    /// Batches produced before anyone subscribed
    undelivered: HashMap<ExecutionId, Vec<OperationEvents>>,
}

impl CheckpointServer {
    fn new(params: CheckpointWorkerParams) -> Self {
        Self {
            execution_manager: ExecutionManager::new(),
            params,
            subscribers: HashMap::new(),
            undelivered: HashMap::new(),
        }
    }

    async fn handle(&mut self, request: WorkerApiRequest) -> WorkerApiResponse {
        if let Some(delay_ms) = self.params.checkpoint_delay {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }

        let manager = &mut self.execution_manager;
        match request.api_type {
            ApiType::StartDurableExecution => {
                dispatch(&request, |req: StartDurableExecutionRequest| manager.start_execution(req))
            }
            ApiType::StartInvocation => {
                dispatch(&request, |req: StartInvocationRequest| manager.start_invocation(req))
            }
            ApiType::CompleteInvocation => {
                dispatch(&request, |req: CompleteInvocationRequest| manager.complete_invocation(req))
            }
            ApiType::CheckpointDurableExecutionState => {
                dispatch(&request, |req: CheckpointDurableExecutionStateRequest| manager.checkpoint(req))
            }
            ApiType::GetDurableExecutionState => {
                dispatch(&request, |req: GetDurableExecutionStateRequest| manager.get_state(req))
            }
            ApiType::UpdateCheckpointData => {
                dispatch(&request, |req: UpdateCheckpointDataRequest| manager.update_checkpoint_data(req))
            }
            ApiType::StopDurableExecution => {
                dispatch(&request, |req: StopDurableExecutionRequest| manager.stop_execution(req))
            }
            ApiType::SendDurableExecutionCallbackSuccess => {
                dispatch(&request, |req: SendCallbackSuccessRequest| manager.send_callback_success(req))
            }
            ApiType::SendDurableExecutionCallbackFailure => {
                dispatch(&request, |req: SendCallbackFailureRequest| manager.send_callback_failure(req))
            }
            ApiType::SendDurableExecutionCallbackHeartbeat => {
                dispatch(&request, |req: SendCallbackHeartbeatRequest| {
                    manager.send_callback_heartbeat(req)
                })
            }
        }
    }

    fn subscribe(&mut self, execution_id: ExecutionId, sender: BatchSender) {
        if let Some(batch) = self.undelivered.remove(&execution_id) {
            let _ = sender.send(batch);
        }
        self.subscribers.entry(execution_id).or_default().push(sender);
    }

    fn sweep_callbacks(&mut self) {
        let timed_out = self.execution_manager.check_callback_timeouts(Instant::now());
        if timed_out > 0 {
            tracing::debug!(count = timed_out, "Timed out expired callbacks");
        }
    }

    fn publish_batches(&mut self) {
        for (execution_id, batch) in self.execution_manager.drain_batches() {
            let senders = self.subscribers.entry(execution_id.clone()).or_default();
            senders.retain(|sender| sender.send(batch.clone()).is_ok());
            if senders.is_empty() {
                self.undelivered.entry(execution_id).or_default().extend(batch);
            }
        }
    }
}

/// Decodes a request, runs `handler` and encodes its answer.
fn dispatch<Req, Resp>(
    request: &WorkerApiRequest,
    handler: impl FnOnce(Req) -> Result<Resp, TestError>,
) -> WorkerApiResponse
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let outcome = serde_json::from_str::<Req>(&request.payload)
        .map_err(|e| format!("Failed to parse request: {}", e))
        .and_then(|req| handler(req).map_err(|e| e.to_string()))
        .and_then(|resp| {
            serde_json::to_string(&resp).map_err(|e| format!("Failed to serialize response: {}", e))
        });

    match outcome {
        Ok(payload) => WorkerApiResponse::success(request.api_type, request.request_id.clone(), payload),
        Err(error) => {
            tracing::debug!(api_type = ?request.api_type, error = %error, "Checkpoint server request failed");
            WorkerApiResponse::error(request.api_type, request.request_id.clone(), error)
        }
    }
}

fn run_worker(
    mut command_rx: mpsc::Receiver<WorkerMessage>,
    params: CheckpointWorkerParams,
    ready: oneshot::Sender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create checkpoint server runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut sweep = tokio::time::interval(params.callback_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut server = CheckpointServer::new(params);
        let _ = ready.send(());

        loop {
            tokio::select! {
                message = command_rx.recv() => match message {
                    Some(WorkerMessage::Command(request, reply)) => {
                        let response = server.handle(request).await;
                        server.publish_batches();
                        let _ = reply.send(response);
                    }
                    Some(WorkerMessage::Subscribe { execution_id, sender, ack }) => {
                        server.subscribe(execution_id, sender);
                        let _ = ack.send(());
                    }
                    Some(WorkerMessage::Shutdown) | None => break,
                },
                _ = sweep.tick() => {
                    server.sweep_callbacks();
                    server.publish_batches();
                }
            }
        }
        tracing::debug!("Checkpoint server stopped");
    });
}

struct WorkerConnection {
    command_tx: mpsc::Sender<WorkerMessage>,
    handle: JoinHandle<()>,
}

/// Handle to the checkpoint server thread.
///
/// Constructed explicitly and driven through [`setup`](Self::setup) and
/// [`teardown`](Self::teardown); every other call fails with
/// `EnvironmentNotSetUp` while the server is not running.
pub struct CheckpointWorkerManager {
    params: CheckpointWorkerParams,
    connection: Mutex<Option<WorkerConnection>>,
}

impl CheckpointWorkerManager {
    /// Creates a manager. The server thread starts on [`setup`](Self::setup).
    pub fn new(params: CheckpointWorkerParams) -> Self {
        Self {
            params,
            connection: Mutex::new(None),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<WorkerConnection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn params(&self) -> &CheckpointWorkerParams {
        &self.params
    }

    /// True between setup and teardown.
    pub fn is_running(&self) -> bool {
        self.connection().is_some()
    }

    /// Starts the server thread and waits until it is ready. Idempotent.
    pub async fn setup(&self) -> Result<(), TestError> {
        if self.is_running() {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel(100);
        let (ready_tx, ready_rx) = oneshot::channel();
        let params = self.params.clone();
        let handle = thread::Builder::new()
            .name("checkpoint-server".to_string())
            .spawn(move || run_worker(command_rx, params, ready_tx))
            .map_err(|e| {
                TestError::checkpoint_server_error(format!("Failed to spawn worker: {}", e))
            })?;

        ready_rx.await.map_err(|_| {
            TestError::checkpoint_server_error("Checkpoint server exited before becoming ready")
        })?;

        let mut connection = self.connection();
        if connection.is_none() {
            *connection = Some(WorkerConnection { command_tx, handle });
            tracing::debug!("Checkpoint server started");
        }
        Ok(())
    }

    /// Stops the server thread and waits for it to exit.
    pub async fn teardown(&self) -> Result<(), TestError> {
        let Some(connection) = self.connection().take() else {
            return Ok(());
        };

        let _ = connection.command_tx.send(WorkerMessage::Shutdown).await;
        tokio::task::spawn_blocking(move || connection.handle.join())
            .await
            .map_err(|e| TestError::checkpoint_server_error(format!("Join failed: {}", e)))?
            .map_err(|_| TestError::checkpoint_server_error("Worker thread panicked"))
    }

    fn sender(&self) -> Result<mpsc::Sender<WorkerMessage>, TestError> {
        self.connection()
            .as_ref()
            .map(|connection| connection.command_tx.clone())
            .ok_or(TestError::EnvironmentNotSetUp)
    }

    /// Sends a raw request envelope and waits for the response.
    pub async fn send_api_request(
        &self,
        api_type: ApiType,
        payload: String,
    ) -> Result<WorkerApiResponse, TestError> {
        let request = WorkerApiRequest {
            api_type,
            request_id: Uuid::new_v4().to_string(),
            payload,
        };
        let (response_tx, response_rx) = oneshot::channel();

        self.sender()?
            .send(WorkerMessage::Command(request, response_tx))
            .await
            .map_err(|e| {
                TestError::checkpoint_communication_error(format!("Failed to send command: {}", e))
            })?;

        response_rx.await.map_err(|e| {
            TestError::checkpoint_communication_error(format!("Failed to receive response: {}", e))
        })
    }

    async fn call<Req, Resp>(&self, api_type: ApiType, request: &Req) -> Result<Resp, TestError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .send_api_request(api_type, serde_json::to_string(request)?)
            .await?;
        if let Some(error) = response.error {
            return Err(TestError::checkpoint_server_error(error));
        }
        let payload = response
            .payload
            .ok_or_else(|| TestError::checkpoint_server_error("Empty response payload"))?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Receives every operation batch the execution produces from now on,
    /// plus any batch produced before the subscription.
    pub async fn subscribe(&self, execution_id: &str) -> Result<BatchReceiver, TestError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender()?
            .send(WorkerMessage::Subscribe {
                execution_id: execution_id.to_string(),
                sender,
                ack: ack_tx,
            })
            .await
            .map_err(|e| {
                TestError::checkpoint_communication_error(format!("Failed to subscribe: {}", e))
            })?;
        ack_rx.await.map_err(|e| {
            TestError::checkpoint_communication_error(format!("Subscription not acknowledged: {}", e))
        })?;
        Ok(receiver)
    }

    /// Starts an execution.
    pub async fn start_execution(
        &self,
        request: StartDurableExecutionRequest,
    ) -> Result<StartDurableExecutionResult, TestError> {
        self.call(ApiType::StartDurableExecution, &request).await
    }

    /// Starts an invocation of a running execution.
    pub async fn start_invocation(
        &self,
        request: StartInvocationRequest,
    ) -> Result<InvocationResult, TestError> {
        self.call(ApiType::StartInvocation, &request).await
    }

    /// Reports how an invocation ended.
    pub async fn complete_invocation(
        &self,
        request: CompleteInvocationRequest,
    ) -> Result<Invocation, TestError> {
        self.call(ApiType::CompleteInvocation, &request).await
    }

    /// Completes an operation on the server's behalf (elapsed wait, chained invoke).
    pub async fn update_checkpoint_data(
        &self,
        request: UpdateCheckpointDataRequest,
    ) -> Result<Operation, TestError> {
        self.call(ApiType::UpdateCheckpointData, &request).await
    }

    /// Stops an execution.
    pub async fn stop_execution(
        &self,
        request: StopDurableExecutionRequest,
    ) -> Result<Operation, TestError> {
        self.call(ApiType::StopDurableExecution, &request).await
    }
}

#[async_trait]
impl CheckpointClient for CheckpointWorkerManager {
    async fn checkpoint(
        &self,
        durable_execution_arn: &str,
        checkpoint_token: &str,
        operations: Vec<OperationUpdate>,
    ) -> Result<CheckpointResponse, TestError> {
        let request = CheckpointDurableExecutionStateRequest {
            durable_execution_arn: durable_execution_arn.to_string(),
            checkpoint_token: checkpoint_token.to_string(),
            operations,
        };
        self.call(ApiType::CheckpointDurableExecutionState, &request).await
    }

    async fn get_operations(
        &self,
        durable_execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<GetOperationsResponse, TestError> {
        let request = GetDurableExecutionStateRequest {
            durable_execution_arn: durable_execution_arn.to_string(),
            marker: marker.map(str::to_string),
            max_items: None,
        };
        self.call(ApiType::GetDurableExecutionState, &request).await
    }
}

#[async_trait]
impl CallbackSender for CheckpointWorkerManager {
    async fn send_success(&self, callback_id: &str, result: &str) -> Result<(), TestError> {
        let request = SendCallbackSuccessRequest {
            callback_id: callback_id.to_string(),
            result: Some(result.to_string()),
        };
        let _: Operation = self
            .call(ApiType::SendDurableExecutionCallbackSuccess, &request)
            .await?;
        Ok(())
    }

    async fn send_failure(&self, callback_id: &str, error: &TestResultError) -> Result<(), TestError> {
        let request = SendCallbackFailureRequest {
            callback_id: callback_id.to_string(),
            error: ErrorObject::from(error.clone()),
        };
        let _: Operation = self
            .call(ApiType::SendDurableExecutionCallbackFailure, &request)
            .await?;
        Ok(())
    }

    async fn send_heartbeat(&self, callback_id: &str) -> Result<(), TestError> {
        let request = SendCallbackHeartbeatRequest {
            callback_id: callback_id.to_string(),
        };
        self.call(ApiType::SendDurableExecutionCallbackHeartbeat, &request)
            .await
    }
}

impl std::fmt::Debug for CheckpointWorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointWorkerManager")
            .field("params", &self.params)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationStatus, OperationType};
    use std::time::Duration;

    async fn running_manager() -> CheckpointWorkerManager {
        let manager = CheckpointWorkerManager::new(CheckpointWorkerParams::default());
        manager.setup().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_calls_before_setup_fail() {
        let manager = CheckpointWorkerManager::new(CheckpointWorkerParams::default());
        let result = manager
            .start_execution(StartDurableExecutionRequest {
                payload: None,
                execution_timeout: None,
            })
            .await;
        assert!(matches!(result, Err(TestError::EnvironmentNotSetUp)));
    }

    #[tokio::test]
    async fn test_setup_and_teardown_are_idempotent() {
        let manager = running_manager().await;
        manager.setup().await.unwrap();
        assert!(manager.is_running());
        manager.teardown().await.unwrap();
        manager.teardown().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_checkpoint_workflow_publishes_batches() {
        let manager = running_manager().await;
        let started = manager
            .start_execution(StartDurableExecutionRequest {
                payload: Some("{}".to_string()),
                execution_timeout: None,
            })
            .await
            .unwrap();
        let mut batches = manager.subscribe(&started.execution_id).await.unwrap();

        let first = batches.recv().await.unwrap();
        assert_eq!(first[0].operation.operation_type, OperationType::Execution);

        let invocation = manager
            .start_invocation(StartInvocationRequest {
                execution_id: started.execution_id.clone(),
                invocation_id: "inv-1".to_string(),
            })
            .await
            .unwrap();
        let response = manager
            .checkpoint(
                &invocation.execution_id,
                &invocation.checkpoint_token,
                vec![OperationUpdate::start("op-1", OperationType::Step).with_name("test-step")],
            )
            .await
            .unwrap();
        assert_ne!(response.checkpoint_token, invocation.checkpoint_token);

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch[0].operation.name.as_deref(), Some("test-step"));
        assert_eq!(batch[0].events.len(), 1);

        manager.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_heartbeat_timeout_is_swept() {
        let manager = CheckpointWorkerManager::new(CheckpointWorkerParams {
            checkpoint_delay: None,
            callback_sweep_interval: Duration::from_millis(10),
        });
        manager.setup().await.unwrap();
        let started = manager
            .start_execution(StartDurableExecutionRequest {
                payload: None,
                execution_timeout: None,
            })
            .await
            .unwrap();
        let invocation = manager
            .start_invocation(StartInvocationRequest {
                execution_id: started.execution_id.clone(),
                invocation_id: "inv-1".to_string(),
            })
            .await
            .unwrap();
        let mut batches = manager.subscribe(&started.execution_id).await.unwrap();

        manager
            .checkpoint(
                &invocation.execution_id,
                &invocation.checkpoint_token,
                vec![OperationUpdate::start("cb", OperationType::Callback)
                    .with_callback_options(None, Some(0))],
            )
            .await
            .unwrap();

        let timed_out = loop {
            let batch = batches.recv().await.unwrap();
            if let Some(pair) = batch
                .into_iter()
                .find(|pair| pair.operation.status == OperationStatus::TimedOut)
            {
                break pair;
            }
        };
        assert_eq!(timed_out.operation.id, "cb");
        assert_eq!(
            timed_out
                .operation
                .callback_details
                .and_then(|d| d.error)
                .and_then(|e| e.error_type),
            Some("CallbackHeartbeatTimeout".to_string())
        );

        manager.teardown().await.unwrap();
    }
}
