//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use durable_execution_testing::{
    ErrorObject, HandlerError, InvocationContext, Operation, OperationStatus, OperationType,
    OperationUpdate, TestEnvironment, TestEnvironmentConfig,
};
use serde::de::DeserializeOwned;

/// Installs a test-writer subscriber; repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn setup() -> TestEnvironment {
    init_tracing();
    TestEnvironment::setup(TestEnvironmentConfig::default())
        .await
        .unwrap()
}

/// An environment whose waits elapse on real timers.
pub async fn setup_real_time() -> TestEnvironment {
    init_tracing();
    TestEnvironment::setup(TestEnvironmentConfig::default().with_skip_time(false))
        .await
        .unwrap()
}

/// Checkpoints `update` unless the operation already exists, then reports
/// its current snapshot.
pub async fn ensure_started(
    ctx: &InvocationContext,
    update: OperationUpdate,
) -> Result<Option<Operation>, HandlerError> {
    match ctx.get_operation(&update.id).await {
        Some(operation) => Ok(Some(operation)),
        None => {
            ctx.checkpoint(vec![update]).await?;
            Ok(None)
        }
    }
}

/// Result of a completed operation, or `Suspend` while it is in flight.
pub fn settled<T: DeserializeOwned>(operation: Option<Operation>) -> Result<T, HandlerError> {
    let Some(operation) = operation.filter(|op| op.status.is_terminal()) else {
        return Err(HandlerError::Suspend);
    };

    let (result, error) = match operation.operation_type {
        OperationType::Callback => operation
            .callback_details
            .map(|d| (d.result, d.error))
            .unwrap_or_default(),
        OperationType::Invoke => operation
            .invoke_details
            .map(|d| (d.result, d.error))
            .unwrap_or_default(),
        OperationType::Step => operation
            .step_details
            .map(|d| (d.result, d.error))
            .unwrap_or_default(),
        _ => (None, None),
    };

    if operation.status != OperationStatus::Succeeded {
        return Err(HandlerError::Failed(error.unwrap_or_else(|| {
            ErrorObject::new("OperationFailed", format!("{} ended as {}", operation.id, operation.status))
        })));
    }
    let json = result.unwrap_or_else(|| "null".to_string());
    serde_json::from_str(&json)
        .map_err(|e| HandlerError::Failed(ErrorObject::new("SerializationError", e.to_string())))
}

/// A handler that opens a callback and never finishes on its own.
pub async fn waiting_on_callback(
    _: (),
    ctx: Arc<InvocationContext>,
) -> Result<String, HandlerError> {
    let callback = ensure_started(
        &ctx,
        OperationUpdate::start("callback-1", OperationType::Callback)
            .with_name("approval")
            .with_callback_options(Some(300), None),
    )
    .await?;
    settled(callback)
}
