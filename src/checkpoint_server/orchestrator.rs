//! Drives one local execution from start to a terminal status.
//!
//! The orchestrator consumes the checkpoint batches published by the
//! checkpoint server, feeds them to the [`OperationTracker`] and decides
//! which continuations to schedule:
//!
//! - a started WAIT completes at its scheduled end and the handler resumes
//! - a PENDING STEP resumes the handler when its next attempt is due
//! - a completed CALLBACK resumes the handler
//! - a started INVOKE of a registered function runs that function, records
//!   its outcome and resumes the handler
//!
//! Handler invocations never overlap. A continuation that fires while an
//! invocation is active makes that invocation run once more when it ends.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::scheduler::{BoxedAsyncFn, CheckpointUpdateFn, ErrorHandler, QueueScheduler, Scheduler, TimerScheduler};
use super::types::{
    CompleteInvocationRequest, ExecutionId, StartDurableExecutionRequest, StartInvocationRequest,
    StopDurableExecutionRequest, UpdateCheckpointDataRequest,
};
use super::worker_manager::CheckpointWorkerManager;
use crate::client::SharedCheckpointClient;
use crate::error::TestError;
use crate::history::{EventDetails, HistoryEvent, OperationEvents};
use crate::invocation::{InvocationContext, InvocationOutput};
use crate::model::{ErrorObject, Operation, OperationStatus, OperationType};
use crate::wait_manager::{lock_tracker, SharedTracker};

/// A type-erased handler: receives the invocation context, returns its outcome.
pub type BoxedHandler = Arc<
    dyn Fn(Arc<InvocationContext>) -> Pin<Box<dyn Future<Output = InvocationOutput> + Send>>
        + Send
        + Sync,
>;

/// A locally registered target for chained invokes.
///
/// Receives the serialized input and returns the serialized result.
pub type RegisteredFunction = Arc<
    dyn Fn(Option<String>) -> Pin<Box<dyn Future<Output = Result<Option<String>, ErrorObject>> + Send>>
        + Send
        + Sync,
>;

/// Configuration for time skipping behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipTimeConfig {
    /// Run continuations in FIFO order without waiting for their timestamps
    pub enabled: bool,
}

/// Terminal state of an execution driven by the orchestrator.
#[derive(Debug, Clone)]
pub struct TestExecutionResult {
    pub execution_id: ExecutionId,
    /// The EXECUTION operation in its terminal status
    pub execution: Operation,
    pub history_events: Vec<HistoryEvent>,
}

type SharedScheduler = Arc<Mutex<Box<dyn Scheduler>>>;

fn lock_scheduler(scheduler: &Mutex<Box<dyn Scheduler>>) -> MutexGuard<'_, Box<dyn Scheduler>> {
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by every continuation of one execution.
struct RunState {
    execution_id: ExecutionId,
    worker: Arc<CheckpointWorkerManager>,
    handler: BoxedHandler,
    active: AtomicBool,
    reinvoke: AtomicBool,
    completed: AtomicBool,
    errors: mpsc::UnboundedSender<TestError>,
}

impl RunState {
    /// Runs the handler, or asks the active invocation to run once more.
    async fn invoke(&self) {
        loop {
            if self.completed.load(Ordering::SeqCst) {
                return;
            }
            if self.active.swap(true, Ordering::SeqCst) {
                self.reinvoke.store(true, Ordering::SeqCst);
                return;
            }
            loop {
                self.reinvoke.store(false, Ordering::SeqCst);
                if let Err(e) = self.run_invocation().await {
                    let _ = self.errors.send(e);
                }
                if !self.reinvoke.load(Ordering::SeqCst) || self.completed.load(Ordering::SeqCst) {
                    break;
                }
            }
            self.active.store(false, Ordering::SeqCst);
            if !self.reinvoke.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn run_invocation(&self) -> Result<(), TestError> {
        let invocation_id = Uuid::new_v4().to_string();
        let started = self
            .worker
            .start_invocation(StartInvocationRequest {
                execution_id: self.execution_id.clone(),
                invocation_id: invocation_id.clone(),
            })
            .await?;
        tracing::debug!(
            execution_id = %self.execution_id,
            invocation_id = %invocation_id,
            operations = started.operations.len(),
            "Invoking handler"
        );

        let client: SharedCheckpointClient = self.worker.clone();
        let context = Arc::new(InvocationContext::new(
            client,
            started.execution_id,
            started.checkpoint_token,
            started.operations,
        ));
        let output = (self.handler)(context).await;
        tracing::debug!(
            execution_id = %self.execution_id,
            invocation_id = %invocation_id,
            terminal = output.is_terminal(),
            "Handler returned"
        );

        self.worker
            .complete_invocation(CompleteInvocationRequest {
                execution_id: self.execution_id.clone(),
                invocation_id,
                output,
            })
            .await?;
        Ok(())
    }
}

fn invocation_fn(run: &Arc<RunState>) -> BoxedAsyncFn {
    let run = Arc::clone(run);
    Box::new(move || Box::pin(async move { run.invoke().await }))
}

fn report_errors(run: &Arc<RunState>) -> ErrorHandler {
    let errors = run.errors.clone();
    Box::new(move |e| {
        tracing::error!(error = %e, "Scheduled checkpoint update failed");
        let _ = errors.send(e);
    })
}

/// Runs handler invocations for one execution and collects its outcome.
pub struct TestExecutionOrchestrator {
    worker: Arc<CheckpointWorkerManager>,
    handler: BoxedHandler,
    functions: HashMap<String, RegisteredFunction>,
    tracker: SharedTracker,
    skip_time: SkipTimeConfig,
}

impl TestExecutionOrchestrator {
    /// Creates an orchestrator for one run.
    pub fn new(
        worker: Arc<CheckpointWorkerManager>,
        handler: BoxedHandler,
        tracker: SharedTracker,
        skip_time: SkipTimeConfig,
    ) -> Self {
        Self {
            worker,
            handler,
            functions: HashMap::new(),
            tracker,
            skip_time,
        }
    }

    /// Functions available to chained invokes.
    pub fn with_functions(mut self, functions: HashMap<String, RegisteredFunction>) -> Self {
        self.functions = functions;
        self
    }

    pub fn is_time_skipping_enabled(&self) -> bool {
        self.skip_time.enabled
    }

    /// Starts a new execution and returns its id once it is running.
    ///
    /// The returned future resolves when the execution reaches a terminal
    /// status. `on_started` receives the execution id before the first
    /// invocation.
    pub async fn execute(
        &self,
        payload: Option<String>,
        execution_timeout: Option<Duration>,
        on_started: impl FnOnce(&str),
    ) -> Result<TestExecutionResult, TestError> {
        let started = self
            .worker
            .start_execution(StartDurableExecutionRequest {
                payload,
                execution_timeout: execution_timeout.map(|timeout| timeout.as_secs()),
            })
            .await?;
        let execution_id = started.execution_id;
        let mut batches = self.worker.subscribe(&execution_id).await?;
        on_started(&execution_id);

        let scheduler: SharedScheduler = Arc::new(Mutex::new(if self.skip_time.enabled {
            Box::new(QueueScheduler::new())
        } else {
            Box::new(TimerScheduler::new())
        }));
        let (errors_tx, mut errors) = mpsc::unbounded_channel();
        let run = Arc::new(RunState {
            execution_id: execution_id.clone(),
            worker: Arc::clone(&self.worker),
            handler: Arc::clone(&self.handler),
            active: AtomicBool::new(false),
            reinvoke: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            errors: errors_tx,
        });

        lock_scheduler(&scheduler).schedule_function(
            invocation_fn(&run),
            report_errors(&run),
            None,
            None,
        );

        let deadline = execution_timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        let mut timed_out = false;
        let mut scheduled: HashSet<(String, OperationStatus, Option<u32>)> = HashSet::new();

        let outcome = loop {
            let armed = deadline.filter(|_| !timed_out);
            let timeout = async move {
                match armed {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                batch = batches.recv() => {
                    let Some(batch) = batch else {
                        break Err(TestError::checkpoint_communication_error(
                            "Checkpoint server stopped before the execution completed",
                        ));
                    };
                    if let Some(execution) = self.apply_batch(&run, &scheduler, &mut scheduled, batch) {
                        break Ok(execution);
                    }
                }
                Some(error) = errors.recv() => {
                    if let Some(execution) = self.drain_for_completion(&mut batches) {
                        break Ok(execution);
                    }
                    break Err(error);
                }
                _ = timeout => {
                    timed_out = true;
                    tracing::warn!(execution_id = %execution_id, "Execution timed out, stopping");
                    let stopped = self
                        .worker
                        .stop_execution(StopDurableExecutionRequest {
                            execution_id: execution_id.clone(),
                            timed_out: true,
                            error: Some(ErrorObject::new(
                                "ExecutionTimedOut",
                                "Execution exceeded its timeout",
                            )),
                        })
                        .await;
                    if let Err(e) = stopped {
                        tracing::debug!(error = %e, "Stop after timeout was rejected");
                    }
                }
            }
        };

        run.completed.store(true, Ordering::SeqCst);
        lock_scheduler(&scheduler).flush_timers();
        let history_events = {
            let mut tracker = lock_tracker(&self.tracker);
            tracker.complete_execution();
            tracker.history_events()
        };

        let execution = outcome?;
        tracing::debug!(
            execution_id = %execution_id,
            status = %execution.status,
            "Execution completed"
        );
        Ok(TestExecutionResult {
            execution_id,
            execution,
            history_events,
        })
    }

    /// Applies any batches already delivered and reports a terminal execution.
    fn drain_for_completion(
        &self,
        batches: &mut mpsc::UnboundedReceiver<Vec<OperationEvents>>,
    ) -> Option<Operation> {
        let mut terminal = None;
        while let Ok(batch) = batches.try_recv() {
            let mut tracker = lock_tracker(&self.tracker);
            terminal = terminal.or_else(|| terminal_execution(&batch));
            tracker.apply_batch(batch);
        }
        terminal
    }

    /// Feeds a batch to the tracker and schedules its continuations.
    ///
    /// Returns the EXECUTION operation once it is terminal.
    fn apply_batch(
        &self,
        run: &Arc<RunState>,
        scheduler: &SharedScheduler,
        scheduled: &mut HashSet<(String, OperationStatus, Option<u32>)>,
        batch: Vec<OperationEvents>,
    ) -> Option<Operation> {
        let terminal = terminal_execution(&batch);
        if terminal.is_none() {
            for entry in &batch {
                let operation = &entry.operation;
                let attempt = operation.step_details.as_ref().and_then(|d| d.attempt);
                if scheduled.insert((operation.id.clone(), operation.status, attempt)) {
                    self.schedule_continuation(run, scheduler, entry);
                }
            }
        } else {
            run.completed.store(true, Ordering::SeqCst);
        }

        lock_tracker(&self.tracker).apply_batch(batch);
        terminal
    }

    fn schedule_continuation(
        &self,
        run: &Arc<RunState>,
        scheduler: &SharedScheduler,
        entry: &OperationEvents,
    ) {
        let operation = &entry.operation;
        let schedule = |timestamp: Option<DateTime<Utc>>, update: Option<CheckpointUpdateFn>| {
            lock_scheduler(scheduler).schedule_function(
                invocation_fn(run),
                report_errors(run),
                timestamp,
                update,
            );
        };

        match (operation.operation_type, operation.status) {
            (OperationType::Wait, OperationStatus::Started) => {
                let scheduled_end = operation
                    .wait_details
                    .as_ref()
                    .and_then(|d| d.scheduled_end_timestamp);
                schedule(scheduled_end, Some(self.complete_wait(run, &operation.id)));
            }
            (OperationType::Step, OperationStatus::Pending) => {
                let next_attempt = operation
                    .step_details
                    .as_ref()
                    .and_then(|d| d.next_attempt_timestamp);
                schedule(next_attempt, None);
            }
            (OperationType::Callback, status) if status.is_terminal() => schedule(None, None),
            (OperationType::Invoke, OperationStatus::Started) => {
                match self.chained_invoke(run, entry) {
                    Ok(update) => schedule(None, Some(update)),
                    Err(e) => {
                        let _ = run.errors.send(e);
                    }
                }
            }
            _ => {}
        }
    }

    fn complete_wait(&self, run: &Arc<RunState>, operation_id: &str) -> CheckpointUpdateFn {
        let worker = Arc::clone(&run.worker);
        let request = UpdateCheckpointDataRequest {
            execution_id: run.execution_id.clone(),
            operation_id: operation_id.to_string(),
            status: OperationStatus::Succeeded,
            result: None,
            error: None,
        };
        Box::new(move || {
            Box::pin(async move {
                worker.update_checkpoint_data(request).await?;
                Ok(())
            })
        })
    }

    fn chained_invoke(
        &self,
        run: &Arc<RunState>,
        entry: &OperationEvents,
    ) -> Result<CheckpointUpdateFn, TestError> {
        let operation = &entry.operation;
        let function_name = operation
            .invoke_details
            .as_ref()
            .and_then(|d| d.function_name.clone())
            .unwrap_or_default();
        let function = self
            .functions
            .get(&function_name)
            .cloned()
            .ok_or_else(|| TestError::function_not_registered(function_name.clone()))?;
        let input = entry.events.iter().find_map(|event| match &event.details {
            EventDetails::ChainedInvokeStarted(details) => details.input.clone(),
            _ => None,
        });

        let worker = Arc::clone(&run.worker);
        let execution_id = run.execution_id.clone();
        let operation_id = operation.id.clone();
        Ok(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(function_name = %function_name, "Running chained invoke");
                let (status, result, error) = match function(input).await {
                    Ok(result) => (OperationStatus::Succeeded, result, None),
                    Err(error) => (OperationStatus::Failed, None, Some(error)),
                };
                worker
                    .update_checkpoint_data(UpdateCheckpointDataRequest {
                        execution_id,
                        operation_id,
                        status,
                        result,
                        error,
                    })
                    .await?;
                Ok(())
            })
        }))
    }
}

fn terminal_execution(batch: &[OperationEvents]) -> Option<Operation> {
    batch
        .iter()
        .map(|entry| &entry.operation)
        .find(|op| op.operation_type == OperationType::Execution && op.is_completed())
        .cloned()
}

impl std::fmt::Debug for TestExecutionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestExecutionOrchestrator")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("skip_time", &self.skip_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_server::types::CheckpointWorkerParams;
    use crate::invocation::HandlerError;
    use crate::model::OperationUpdate;
    use crate::wait_manager::OperationTracker;

    fn handler<F, Fut>(f: F) -> BoxedHandler
    where
        F: Fn(Arc<InvocationContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, HandlerError>> + Send + 'static,
    {
        Arc::new(move |ctx| {
            let fut = f(ctx);
            Box::pin(async move { InvocationOutput::from_handler_result(fut.await) })
        })
    }

    async fn orchestrator(handler: BoxedHandler) -> (TestExecutionOrchestrator, SharedTracker) {
        let worker = Arc::new(CheckpointWorkerManager::new(CheckpointWorkerParams::default()));
        worker.setup().await.unwrap();
        let tracker = Arc::new(Mutex::new(OperationTracker::new()));
        (
            TestExecutionOrchestrator::new(
                worker,
                handler,
                Arc::clone(&tracker),
                SkipTimeConfig { enabled: true },
            ),
            tracker,
        )
    }

    #[tokio::test]
    async fn test_single_invocation_success() {
        let (orchestrator, tracker) =
            orchestrator(handler(|_ctx| async { Ok("done".to_string()) })).await;

        let result = orchestrator.execute(Some("{}".to_string()), None, |_| {}).await.unwrap();
        assert_eq!(result.execution.status, OperationStatus::Succeeded);
        assert!(lock_tracker(&tracker).is_execution_complete());
    }

    #[tokio::test]
    async fn test_wait_resumes_handler_with_time_skipping() {
        let (orchestrator, tracker) = orchestrator(handler(|ctx| async move {
            match ctx.get_operation("wait-1").await {
                Some(op) if op.status == OperationStatus::Succeeded => Ok("resumed".to_string()),
                Some(_) => Err(HandlerError::Suspend),
                None => {
                    ctx.checkpoint(vec![OperationUpdate::start("wait-1", OperationType::Wait)
                        .with_name("pause")
                        .with_wait_seconds(3600)])
                        .await?;
                    Err(HandlerError::Suspend)
                }
            }
        }))
        .await;

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            orchestrator.execute(None, None, |_| {}),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(result.execution.status, OperationStatus::Succeeded);
        let tracker = lock_tracker(&tracker);
        let wait = tracker.index().get_by_name_and_index("pause", 0).unwrap();
        assert_eq!(wait.operation.status, OperationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unregistered_chained_invoke_fails_run() {
        let (orchestrator, _) = orchestrator(handler(|ctx| async move {
            if ctx.get_operation("invoke-1").await.is_none() {
                ctx.checkpoint(vec![OperationUpdate::start("invoke-1", OperationType::Invoke)
                    .with_function_name("missing")])
                    .await?;
            }
            Err(HandlerError::Suspend)
        }))
        .await;

        let result = orchestrator.execute(None, None, |_| {}).await;
        assert!(matches!(result, Err(TestError::FunctionNotRegistered(_))));
    }

    #[tokio::test]
    async fn test_execution_timeout_stops_as_timed_out() {
        let (orchestrator, _) = orchestrator(handler(|_ctx| async { Err(HandlerError::Suspend) })).await;

        let result = orchestrator
            .execute(None, Some(Duration::from_millis(200)), |_| {})
            .await
            .unwrap();
        assert_eq!(result.execution.status, OperationStatus::TimedOut);
    }
}
