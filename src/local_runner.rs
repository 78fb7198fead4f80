//! Local test runner for durable executions.
//!
//! [`LocalDurableTestRunner`] runs a handler in-process against the
//! checkpoint server owned by a [`TestEnvironment`]. Waits, retries,
//! callbacks and registered chained invokes all resume the handler the way
//! the service would, either on real timers or in strict FIFO order when
//! time skipping is enabled.
//!
//! # Examples
//!
//! ```ignore
//! use durable_execution_testing::{
//!     ExecutionStatus, LocalDurableTestRunner, TestEnvironment, TestEnvironmentConfig,
//! };
//!
//! #[tokio::test]
//! async fn test_workflow() {
//!     let env = TestEnvironment::setup(TestEnvironmentConfig::default()).await.unwrap();
//!
//!     let runner = LocalDurableTestRunner::new(&env, my_workflow);
//!     let result = runner.run("input".to_string()).await.unwrap();
//!
//!     assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
//!
//!     env.teardown().await.unwrap();
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint_server::types::{ExecutionId, StopDurableExecutionRequest};
use crate::checkpoint_server::{
    BoxedHandler, CheckpointWorkerManager, CheckpointWorkerParams, RegisteredFunction,
    SkipTimeConfig, TestExecutionOrchestrator,
};
use crate::error::TestError;
use crate::invocation::{HandlerError, InvocationContext, InvocationOutput};
use crate::model::{ErrorObject, Operation};
use crate::operation::{CallbackSender, DurableOperation};
use crate::operation_storage::OperationLookup;
use crate::result_formatter::{ExecutionRecord, ResultFormatter};
use crate::test_result::TestResult;
use crate::wait_manager::{lock_tracker, OperationTracker, SharedTracker};

/// Configuration for setting up the test environment.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::TestEnvironmentConfig;
///
/// let config = TestEnvironmentConfig::default().with_checkpoint_delay(5);
/// assert!(config.skip_time);
/// assert_eq!(config.checkpoint_delay, Some(5));
/// ```
#[derive(Debug, Clone)]
pub struct TestEnvironmentConfig {
    /// Enable time skipping for faster test execution.
    ///
    /// When enabled, continuations run in FIFO order as soon as they are
    /// scheduled instead of at their timestamps.
    pub skip_time: bool,

    /// Optional simulated checkpoint delay in milliseconds.
    pub checkpoint_delay: Option<u64>,
}

impl Default for TestEnvironmentConfig {
    fn default() -> Self {
        Self {
            skip_time: true,
            checkpoint_delay: None,
        }
    }
}

impl TestEnvironmentConfig {
    /// Resolves waits and retry delays immediately when `true`.
    pub fn with_skip_time(mut self, skip_time: bool) -> Self {
        self.skip_time = skip_time;
        self
    }

    /// Adds `delay_ms` of latency to every checkpoint server request.
    pub fn with_checkpoint_delay(mut self, delay_ms: u64) -> Self {
        self.checkpoint_delay = Some(delay_ms);
        self
    }
}

/// A running checkpoint server shared by the runners of one test.
///
/// There is no global state: each environment owns its server thread and
/// must be torn down explicitly.
#[derive(Debug)]
pub struct TestEnvironment {
    config: TestEnvironmentConfig,
    worker: Arc<CheckpointWorkerManager>,
}

impl TestEnvironment {
    /// Starts the checkpoint server and waits until it is ready.
    pub async fn setup(config: TestEnvironmentConfig) -> Result<Self, TestError> {
        let params = CheckpointWorkerParams {
            checkpoint_delay: config.checkpoint_delay,
            ..CheckpointWorkerParams::default()
        };
        Self::setup_with_params(config, params).await
    }

    /// Like [`setup`](Self::setup), with explicit server parameters.
    pub async fn setup_with_params(
        config: TestEnvironmentConfig,
        params: CheckpointWorkerParams,
    ) -> Result<Self, TestError> {
        let worker = Arc::new(CheckpointWorkerManager::new(params));
        worker.setup().await?;
        tracing::debug!(skip_time = config.skip_time, "Test environment ready");
        Ok(Self { config, worker })
    }

    /// Stops the checkpoint server. Runs in progress fail afterwards.
    pub async fn teardown(&self) -> Result<(), TestError> {
        self.worker.teardown().await
    }

    pub fn config(&self) -> &TestEnvironmentConfig {
        &self.config
    }

    /// True when the environment skips waits.
    pub fn is_time_skipping_enabled(&self) -> bool {
        self.config.skip_time
    }

    /// The checkpoint server handle shared by every runner of this environment.
    pub fn checkpoint_worker(&self) -> &Arc<CheckpointWorkerManager> {
        &self.worker
    }
}

fn deserialize_input<T: DeserializeOwned>(input: Option<&str>) -> Result<T, ErrorObject> {
    serde_json::from_str(input.unwrap_or("null"))
        .map_err(|e| ErrorObject::new("SerializationError", format!("Invalid input: {}", e)))
}

/// Runs a durable handler in-process and exposes its operations to the test.
///
/// # Type Parameters
///
/// * `I` - The handler input type
/// * `O` - The handler output type
pub struct LocalDurableTestRunner<I, O> {
    worker: Arc<CheckpointWorkerManager>,
    skip_time: SkipTimeConfig,
    handler: BoxedHandler,
    functions: Mutex<HashMap<String, RegisteredFunction>>,
    tracker: SharedTracker,
    execution_timeout: Option<Duration>,
    current_execution: Mutex<Option<ExecutionId>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> LocalDurableTestRunner<I, O>
where
    I: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates a runner for `handler` on the environment's checkpoint server.
    ///
    /// The handler receives the deserialized input on every invocation and
    /// replays completed operations through the [`InvocationContext`].
    /// Returning [`HandlerError::Suspend`] ends the invocation until a
    /// pending operation makes progress.
    pub fn new<F, Fut>(env: &TestEnvironment, handler: F) -> Self
    where
        F: Fn(I, Arc<InvocationContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        let handler: BoxedHandler = Arc::new(move |ctx: Arc<InvocationContext>| {
            let input = deserialize_input::<I>(ctx.input_payload());
            let fut = input.map(|input| handler(input, ctx));
            Box::pin(async move {
                match fut {
                    Ok(fut) => InvocationOutput::from_handler_result(fut.await),
                    Err(error) => InvocationOutput::Failed(error),
                }
            })
        });

        Self {
            worker: Arc::clone(&env.worker),
            skip_time: SkipTimeConfig {
                enabled: env.config.skip_time,
            },
            handler,
            functions: Mutex::new(HashMap::new()),
            tracker: Arc::new(Mutex::new(OperationTracker::new())),
            execution_timeout: None,
            current_execution: Mutex::new(None),
            _types: PhantomData,
        }
    }

    /// Bounds every run; an execution still running afterwards is stopped
    /// as timed out.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Runs one execution to a terminal status.
    ///
    /// Operation handles obtained from this runner, before or during the
    /// run, observe the run's operations as they are checkpointed.
    pub async fn run(&self, payload: I) -> Result<TestResult<O>, TestError> {
        lock_tracker(&self.tracker).reset();
        let payload = serde_json::to_string(&payload)?;

        let orchestrator = TestExecutionOrchestrator::new(
            Arc::clone(&self.worker),
            Arc::clone(&self.handler),
            Arc::clone(&self.tracker),
            self.skip_time,
        )
        .with_functions(self.functions_snapshot());

        let outcome = orchestrator
            .execute(Some(payload), self.execution_timeout, |execution_id| {
                tracing::debug!(execution_id = %execution_id, "Execution started");
                *self.lock_current() = Some(execution_id.to_string());
            })
            .await;
        *self.lock_current() = None;
        let execution = outcome?;

        let operations: Vec<Operation> = lock_tracker(&self.tracker)
            .get_operations(None)
            .into_iter()
            .map(|entry| entry.operation)
            .collect();
        let record = ExecutionRecord::from_execution_events(&execution.execution, &execution.history_events);
        ResultFormatter::create_test_result(record, operations, execution.history_events)
    }

    /// Stops the execution currently being run.
    pub async fn stop_execution(&self) -> Result<(), TestError> {
        let execution_id = self
            .lock_current()
            .clone()
            .ok_or_else(|| TestError::invalid_configuration("No execution is running"))?;
        self.worker
            .stop_execution(StopDurableExecutionRequest {
                execution_id,
                timed_out: false,
                error: Some(ErrorObject::new("ExecutionStopped", "Execution stopped by test")),
            })
            .await?;
        Ok(())
    }

    /// Registers a function that chained invokes of `name` run locally.
    ///
    /// The function receives the deserialized invoke input. Its error
    /// fails the INVOKE operation.
    pub fn register_function<F, Fut, A, R>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorObject>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let func = Arc::new(func);
        let registered: RegisteredFunction = Arc::new(move |input: Option<String>| {
            let func = Arc::clone(&func);
            Box::pin(async move {
                let input = deserialize_input::<A>(input.as_deref())?;
                let output = func(input).await?;
                serde_json::to_string(&output)
                    .map(Some)
                    .map_err(|e| ErrorObject::new("SerializationError", e.to_string()))
            })
        });
        self.lock_functions().insert(name.into(), registered);
    }

    /// True if a chained-invoke target named `name` is registered.
    pub fn has_registered_function(&self, name: &str) -> bool {
        self.lock_functions().contains_key(name)
    }

    pub fn registered_function_count(&self) -> usize {
        self.lock_functions().len()
    }

    /// Forgets the operations of the previous run.
    pub fn reset(&self) {
        lock_tracker(&self.tracker).reset();
    }

    /// Tracks the first operation named `name`.
    pub fn get_operation(&self, name: &str) -> DurableOperation {
        self.track(OperationLookup::by_name(name))
    }

    /// Tracks the `index`-th operation of the run, in arrival order.
    pub fn get_operation_by_index(&self, index: usize) -> DurableOperation {
        self.track(OperationLookup::by_index(index))
    }

    /// Tracks the `index`-th (zero-based) operation named `name`.
    pub fn get_operation_by_name_and_index(&self, name: &str, index: usize) -> DurableOperation {
        self.track(OperationLookup::by_name_and_index(name, index))
    }

    /// Tracks the operation with id `id`.
    pub fn get_operation_by_id(&self, id: &str) -> DurableOperation {
        self.track(OperationLookup::by_id(id))
    }

    /// Snapshots of every operation received so far.
    pub fn get_all_operations(&self) -> Vec<Operation> {
        lock_tracker(&self.tracker)
            .get_operations(None)
            .into_iter()
            .map(|entry| entry.operation)
            .collect()
    }

    fn track(&self, lookup: OperationLookup) -> DurableOperation {
        let sender: Arc<dyn CallbackSender> = self.worker.clone();
        DurableOperation::track(Arc::clone(&self.tracker), lookup, Some(sender))
    }

    fn functions_snapshot(&self) -> HashMap<String, RegisteredFunction> {
        self.lock_functions().clone()
    }

    fn lock_functions(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegisteredFunction>> {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<ExecutionId>> {
        self.current_execution.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I, O> std::fmt::Debug for LocalDurableTestRunner<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDurableTestRunner")
            .field("skip_time", &self.skip_time)
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationStatus;
    use crate::types::ExecutionStatus;

    async fn env() -> TestEnvironment {
        TestEnvironment::setup(TestEnvironmentConfig::default()).await.unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TestEnvironmentConfig::default();
        assert!(config.skip_time);
        assert!(config.checkpoint_delay.is_none());
        assert!(!config.with_skip_time(false).skip_time);
    }

    #[tokio::test]
    async fn test_run_returns_handler_output() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |input: String, _ctx| async move {
            Ok::<_, HandlerError>(format!("hello {}", input))
        });

        let result = runner.run("world".to_string()).await.unwrap();
        assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
        assert_eq!(result.get_result().unwrap(), "hello world");
        assert_eq!(result.invocation_count(), 1);
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_surfaces_error() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |_: (), _ctx| async move {
            Err::<String, _>(HandlerError::Failed(ErrorObject::new("Boom", "it broke")))
        });

        let result = runner.run(()).await.unwrap();
        assert_eq!(result.get_status(), ExecutionStatus::Failed);
        assert_eq!(result.get_error().unwrap().error_type.as_deref(), Some("Boom"));
        assert!(matches!(result.get_result(), Err(TestError::ExecutionFailed(_))));
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_function_bookkeeping() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |_: (), _ctx| async move {
            Ok::<_, HandlerError>(())
        });

        runner.register_function("double", |n: u32| async move { Ok::<_, ErrorObject>(n * 2) });
        assert!(runner.has_registered_function("double"));
        assert!(!runner.has_registered_function("triple"));
        assert_eq!(runner.registered_function_count(), 1);
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_running_execution() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |_: (), _ctx| async move {
            Ok::<_, HandlerError>(())
        });

        let err = runner.stop_execution().await.unwrap_err();
        assert!(matches!(err, TestError::InvalidConfiguration(_)));
        env.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_after_teardown_fails() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |_: (), _ctx| async move {
            Ok::<_, HandlerError>(())
        });
        env.teardown().await.unwrap();

        assert!(matches!(runner.run(()).await, Err(TestError::EnvironmentNotSetUp)));
    }

    #[tokio::test]
    async fn test_operations_reset_between_runs() {
        let env = env().await;
        let runner = LocalDurableTestRunner::new(&env, |_: (), ctx: Arc<InvocationContext>| async move {
            if ctx.get_operation("step-1").await.is_none() {
                ctx.checkpoint(vec![
                    crate::model::OperationUpdate::start("step-1", crate::model::OperationType::Step)
                        .with_name("only"),
                    crate::model::OperationUpdate::succeed(
                        "step-1",
                        crate::model::OperationType::Step,
                        Some("1".to_string()),
                    ),
                ])
                .await?;
            }
            Ok::<_, HandlerError>(())
        });
        let handle = runner.get_operation("only");

        runner.run(()).await.unwrap();
        assert_eq!(handle.get_status(), Some(OperationStatus::Succeeded));
        assert_eq!(runner.get_all_operations().len(), 1);

        runner.reset();
        assert!(!handle.is_resolved());
        assert!(runner.get_all_operations().is_empty());
        env.teardown().await.unwrap();
    }
}
