//! In-process checkpoint server for local test runs.
//!
//! The server owns all execution state and runs on its own thread. Test
//! code talks to it through [`CheckpointWorkerManager`], which forwards
//! JSON-encoded requests over a channel and exposes the server as a
//! [`CheckpointClient`](crate::client::CheckpointClient).
//!
//! # Architecture
//!
//! - **CheckpointWorkerManager**: lifecycle of the server thread and the request channel
//! - **ExecutionManager**: routes requests by execution id, checkpoint token or callback id
//! - **CheckpointManager**: operation state, invocations and batches of one execution
//! - **CallbackManager**: callback deadlines and heartbeats
//! - **EventProcessor** and the history resolver: history events for each accepted update
//! - **TestExecutionOrchestrator**: consumes batches and schedules handler invocations
//!
//! # Communication
//!
//! Requests travel as [`WorkerApiRequest`] envelopes and are answered with a
//! [`WorkerApiResponse`]. Checkpoint batches are pushed to subscribers of
//! each execution as they are produced.

pub mod callback_manager;
pub mod checkpoint_manager;
pub mod checkpoint_token;
pub mod event_processor;
pub mod execution_manager;
pub mod history_resolver;
pub mod orchestrator;
pub mod scheduler;
pub mod types;
pub mod worker_manager;

pub use callback_manager::{CallbackManager, CallbackState, CompleteCallbackStatus};
pub use checkpoint_manager::CheckpointManager;
pub use checkpoint_token::CheckpointTokenData;
pub use event_processor::EventProcessor;
pub use execution_manager::ExecutionManager;
pub use orchestrator::{
    BoxedHandler, RegisteredFunction, SkipTimeConfig, TestExecutionOrchestrator, TestExecutionResult,
};
pub use scheduler::{BoxedAsyncFn, CheckpointUpdateFn, ErrorHandler, QueueScheduler, Scheduler, TimerScheduler};
pub use types::{
    ApiType, CheckpointWorkerParams, StartDurableExecutionRequest, WorkerApiRequest, WorkerApiResponse,
};
pub use worker_manager::{BatchReceiver, CheckpointWorkerManager};
