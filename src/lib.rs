//! Test harness for durable execution handlers.
//!
//! A durable handler checkpoints each step, wait, callback and chained
//! invoke it performs. This crate runs such handlers against an in-process
//! checkpoint server, re-invoking them until the execution settles, and lets
//! tests inspect and drive individual operations while the run is in flight.
//!
//! # Features
//!
//! - **LocalDurableTestRunner**: Execute handlers against the local checkpoint server
//! - **CloudDurableTestRunner**: Run deployed functions and replay their history
//! - **MockCheckpointClient**: Scripted checkpoint client for handler unit tests
//! - **DurableOperation**: Inspect, wait on and complete individual operations
//! - **Time skipping**: Resolve waits and retry delays without sleeping
//!
//! # Example
//!
//! ```ignore
//! use durable_execution_testing::{
//!     ExecutionStatus, LocalDurableTestRunner, TestEnvironment, TestEnvironmentConfig,
//! };
//!
//! #[tokio::test]
//! async fn test_workflow() {
//!     let env = TestEnvironment::setup(TestEnvironmentConfig::default()).await.unwrap();
//!     let runner = LocalDurableTestRunner::new(&env, my_workflow);
//!
//!     let result = runner.run("input".to_string()).await.unwrap();
//!     assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
//!
//!     env.teardown().await.unwrap();
//! }
//! ```

pub mod checkpoint_server;
pub mod client;
pub mod cloud_runner;
pub mod error;
pub mod history;
pub mod invocation;
pub mod local_runner;
pub mod mock_client;
pub mod model;
pub mod operation;
pub mod operation_index;
pub mod operation_storage;
pub mod result_formatter;
pub mod test_result;
pub mod types;
pub mod wait_manager;

pub use checkpoint_server::{CheckpointWorkerManager, CheckpointWorkerParams};
pub use client::{CheckpointClient, CheckpointResponse, GetOperationsResponse, SharedCheckpointClient};
pub use cloud_runner::{
    CloudDurableTestRunner, CloudTestRunnerConfig, DurableExecutionBackend, ExecutionDescription,
    HistoryPage, LambdaClientConfig, LambdaDurableBackend,
};
pub use error::TestError;
pub use history::{EventDetails, EventType, HistoryEvent, OperationEvents};
pub use invocation::{HandlerError, InvocationContext, InvocationOutput};
pub use local_runner::{LocalDurableTestRunner, TestEnvironment, TestEnvironmentConfig};
pub use mock_client::{CheckpointCall, GetOperationsCall, MockCheckpointClient};
pub use model::{ErrorObject, Operation, OperationAction, OperationStatus, OperationType, OperationUpdate};
pub use operation::{
    CallbackDetails, CallbackSender, ContextDetails, DurableOperation, InvokeDetails, StepDetails,
    WaitDetails,
};
pub use result_formatter::{ExecutionRecord, ResultFormatter};
pub use test_result::{PrintConfig, TestResult};
pub use types::{ExecutionStatus, Invocation, TestResultError, WaitingOperationStatus};
