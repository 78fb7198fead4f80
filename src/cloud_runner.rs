//! Cloud test runner for testing deployed Lambda functions.
//!
//! [`CloudDurableTestRunner`] invokes a deployed durable function, polls
//! its history and feeds the replayed operations through the same tracking
//! pipeline the local runner uses, so operation handles and waits behave
//! identically against the real service.
//!
//! # Examples
//!
//! ```ignore
//! use durable_execution_testing::{CloudDurableTestRunner, ExecutionStatus};
//!
//! #[tokio::test]
//! async fn test_deployed_workflow() {
//!     let runner = CloudDurableTestRunner::<String, String>::from_env("my-function-name")
//!         .await
//!         .unwrap();
//!
//!     let result = runner.run("input".to_string()).await.unwrap();
//!     assert_eq!(result.get_status(), ExecutionStatus::Succeeded);
//! }
//! ```

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TestError;
use crate::history::{replay_history, HistoryEvent, OperationEvents};
use crate::model::{ErrorObject, Operation};
use crate::operation::{CallbackSender, DurableOperation};
use crate::operation_storage::OperationLookup;
use crate::result_formatter::{ExecutionRecord, ResultFormatter};
use crate::test_result::TestResult;
use crate::types::{ExecutionStatus, TestResultError};
use crate::wait_manager::{lock_tracker, OperationTracker, SharedTracker};

/// Configuration for the cloud test runner.
///
/// # Examples
///
/// ```
/// use durable_execution_testing::CloudTestRunnerConfig;
/// use std::time::Duration;
///
/// let config = CloudTestRunnerConfig::new().with_poll_interval(Duration::from_millis(500));
/// assert_eq!(config.timeout, Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct CloudTestRunnerConfig {
    /// Polling interval when waiting for execution completion.
    ///
    /// Default: 1000ms
    pub poll_interval: Duration,

    /// Maximum wait time for execution completion.
    ///
    /// Default: 300 seconds
    pub timeout: Duration,
}

impl Default for CloudTestRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(300),
        }
    }
}

impl CloudTestRunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay between history polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long to poll before giving up with `WaitTimeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Current state of a remote execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionDescription {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// One page of an execution's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub events: Vec<HistoryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// The remote durable execution API consumed by [`CloudDurableTestRunner`].
#[async_trait]
pub trait DurableExecutionBackend: Send + Sync {
    /// Invokes `function_name` and returns the ARN of the started execution,
    /// if the service reported one.
    async fn invoke(
        &self,
        function_name: &str,
        payload: Option<String>,
    ) -> Result<Option<String>, TestError>;

    async fn get_execution(&self, durable_execution_arn: &str) -> Result<ExecutionDescription, TestError>;

    async fn get_execution_history(
        &self,
        durable_execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<HistoryPage, TestError>;

    async fn stop_execution(
        &self,
        durable_execution_arn: &str,
        error: Option<ErrorObject>,
    ) -> Result<(), TestError>;

    async fn send_callback_success(&self, callback_id: &str, result: &str) -> Result<(), TestError>;

    async fn send_callback_failure(&self, callback_id: &str, error: ErrorObject) -> Result<(), TestError>;

    async fn send_callback_heartbeat(&self, callback_id: &str) -> Result<(), TestError>;
}

/// Shared, type-erased backend.
pub type SharedBackend = Arc<dyn DurableExecutionBackend>;

/// Fetches every page of an execution's history.
pub async fn get_full_history(
    backend: &dyn DurableExecutionBackend,
    durable_execution_arn: &str,
) -> Result<Vec<HistoryEvent>, TestError> {
    let mut events = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let page = backend
            .get_execution_history(durable_execution_arn, marker.as_deref())
            .await?;
        events.extend(page.events);
        match page.next_marker {
            Some(next) if !next.is_empty() => marker = Some(next),
            _ => return Ok(events),
        }
    }
}

/// Configuration for the Lambda client.
#[derive(Debug, Clone)]
pub struct LambdaClientConfig {
    /// AWS region for the Lambda service
    pub region: String,
    /// Optional custom endpoint URL (for testing)
    pub endpoint_url: Option<String>,
}

impl Default for LambdaClientConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
        }
    }
}

impl LambdaClientConfig {
    /// Targets the public endpoint of `region`.
    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url: None,
        }
    }

    /// Overrides the endpoint, for local emulators.
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Takes the region from a loaded AWS configuration.
    pub fn from_aws_config(config: &aws_config::SdkConfig) -> Self {
        Self {
            region: config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint_url: config.endpoint_url().map(str::to_string),
        }
    }

    /// Returns the Lambda service endpoint URL.
    pub fn endpoint(&self) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://lambda.{}.amazonaws.com", self.region))
    }
}

const API_VERSION: &str = "2025-12-01";

fn execution_uri(endpoint: &str, durable_execution_arn: &str, suffix: &str) -> String {
    format!(
        "{}/{}/durable-executions/{}{}",
        endpoint,
        API_VERSION,
        urlencoding::encode(durable_execution_arn),
        suffix
    )
}

fn callback_uri(endpoint: &str, callback_id: &str, action: &str) -> String {
    format!(
        "{}/{}/durable-execution-callbacks/{}/{}",
        endpoint,
        API_VERSION,
        urlencoding::encode(callback_id),
        action
    )
}

fn invoke_uri(endpoint: &str, function_name: &str) -> String {
    format!(
        "{}/2015-03-31/functions/{}/invocations",
        endpoint,
        urlencoding::encode(function_name)
    )
}

#[derive(Debug, Serialize)]
struct StopExecutionBody {
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

struct RawResponse {
    headers: reqwest::header::HeaderMap,
    body: Vec<u8>,
}

/// [`DurableExecutionBackend`] over the Lambda REST API with SigV4 signing.
pub struct LambdaDurableBackend {
    http_client: reqwest::Client,
    credentials_provider: Arc<dyn ProvideCredentials>,
    config: LambdaClientConfig,
}

impl LambdaDurableBackend {
    /// Creates a backend from the default AWS configuration chain.
    pub async fn from_env() -> Result<Self, TestError> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::from_aws_config(&aws_config)
    }

    /// Builds a backend from a loaded AWS configuration.
    ///
    /// Fails with `InvalidConfiguration` when no credentials provider is configured.
    pub fn from_aws_config(aws_config: &aws_config::SdkConfig) -> Result<Self, TestError> {
        let credentials_provider = aws_config
            .credentials_provider()
            .ok_or_else(|| TestError::invalid_configuration("No credentials provider configured"))?;

        Ok(Self {
            http_client: reqwest::Client::new(),
            credentials_provider: Arc::new(credentials_provider),
            config: LambdaClientConfig::from_aws_config(aws_config),
        })
    }

    pub fn with_config(
        credentials_provider: Arc<dyn ProvideCredentials>,
        config: LambdaClientConfig,
    ) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            credentials_provider,
            config,
        }
    }

    pub fn config(&self) -> &LambdaClientConfig {
        &self.config
    }

    /// Signs a request with SigV4 and returns the headers to attach.
    async fn sign_request(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<Vec<(String, String)>, TestError> {
        let credentials = self
            .credentials_provider
            .provide_credentials()
            .await
            .map_err(|e| TestError::aws_error(format!("Failed to get AWS credentials: {}", e)))?;

        let identity = credentials.into();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.config.region)
            .name("lambda")
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|e| TestError::aws_error(format!("Failed to build signing params: {}", e)))?;

        let signable_request = SignableRequest::new(
            method,
            uri,
            std::iter::empty::<(&str, &str)>(),
            SignableBody::Bytes(body),
        )
        .map_err(|e| TestError::aws_error(format!("Failed to create signable request: {}", e)))?;

        let (signing_instructions, _signature) = sign(signable_request, &signing_params.into())
            .map_err(|e| TestError::aws_error(format!("Failed to sign request: {}", e)))?
            .into_parts();

        let mut signed = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .map_err(|e| TestError::aws_error(format!("Failed to build request: {}", e)))?;
        signing_instructions.apply_to_request_http1x(&mut signed);

        Ok(signed
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect())
    }

    async fn send(
        &self,
        operation: &str,
        method: reqwest::Method,
        uri: String,
        body: Vec<u8>,
        extra_headers: &[(&str, &str)],
    ) -> Result<RawResponse, TestError> {
        let signed_headers = self.sign_request(method.as_str(), &uri, &body).await?;

        let mut request = self
            .http_client
            .request(method, &uri)
            .header("Content-Type", "application/json")
            .body(body);
        for (name, value) in signed_headers {
            request = request.header(name, value);
        }
        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TestError::aws_error(format!("{} request failed: {}", operation, e)))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TestError::aws_error(format!("Failed to read {} response: {}", operation, e)))?
            .to_vec();

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body);
            tracing::debug!(operation, status = %status, "Lambda API returned an error");
            if status.as_u16() == 404 || message.contains("ResourceNotFoundException") {
                return Err(TestError::execution_not_found(format!("{}: {}", operation, message)));
            }
            return Err(TestError::aws_error(format!(
                "{} returned {}: {}",
                operation, status, message
            )));
        }
        Ok(RawResponse { headers, body })
    }
}

impl std::fmt::Debug for LambdaDurableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaDurableBackend")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl DurableExecutionBackend for LambdaDurableBackend {
    async fn invoke(
        &self,
        function_name: &str,
        payload: Option<String>,
    ) -> Result<Option<String>, TestError> {
        let uri = invoke_uri(&self.config.endpoint(), function_name);
        let body = payload.unwrap_or_else(|| "null".to_string()).into_bytes();
        let response = self
            .send(
                "Invoke",
                reqwest::Method::POST,
                uri,
                body,
                &[("X-Amz-Invocation-Type", "Event")],
            )
            .await?;

        Ok(response
            .headers
            .get("X-Amz-Durable-Execution-Arn")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }

    async fn get_execution(&self, durable_execution_arn: &str) -> Result<ExecutionDescription, TestError> {
        let uri = execution_uri(&self.config.endpoint(), durable_execution_arn, "");
        let response = self
            .send("GetDurableExecution", reqwest::Method::GET, uri, Vec::new(), &[])
            .await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn get_execution_history(
        &self,
        durable_execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<HistoryPage, TestError> {
        let mut suffix = "/history?IncludeExecutionData=true".to_string();
        if let Some(marker) = marker {
            suffix.push_str(&format!("&Marker={}", urlencoding::encode(marker)));
        }
        let uri = execution_uri(&self.config.endpoint(), durable_execution_arn, &suffix);
        let response = self
            .send("GetDurableExecutionHistory", reqwest::Method::GET, uri, Vec::new(), &[])
            .await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn stop_execution(
        &self,
        durable_execution_arn: &str,
        error: Option<ErrorObject>,
    ) -> Result<(), TestError> {
        let uri = execution_uri(&self.config.endpoint(), durable_execution_arn, "/stop");
        let body = serde_json::to_vec(&StopExecutionBody { error })?;
        self.send("StopDurableExecution", reqwest::Method::POST, uri, body, &[])
            .await?;
        Ok(())
    }

    async fn send_callback_success(&self, callback_id: &str, result: &str) -> Result<(), TestError> {
        let uri = callback_uri(&self.config.endpoint(), callback_id, "succeed");
        self.send(
            "SendDurableExecutionCallbackSuccess",
            reqwest::Method::POST,
            uri,
            result.as_bytes().to_vec(),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn send_callback_failure(&self, callback_id: &str, error: ErrorObject) -> Result<(), TestError> {
        let uri = callback_uri(&self.config.endpoint(), callback_id, "fail");
        let body = serde_json::to_vec(&error)?;
        self.send("SendDurableExecutionCallbackFailure", reqwest::Method::POST, uri, body, &[])
            .await?;
        Ok(())
    }

    async fn send_callback_heartbeat(&self, callback_id: &str) -> Result<(), TestError> {
        let uri = callback_uri(&self.config.endpoint(), callback_id, "heartbeat");
        self.send(
            "SendDurableExecutionCallbackHeartbeat",
            reqwest::Method::POST,
            uri,
            Vec::new(),
            &[],
        )
        .await?;
        Ok(())
    }
}

/// Routes callback completions from operation handles to the backend.
struct BackendCallbackSender(SharedBackend);

#[async_trait]
impl CallbackSender for BackendCallbackSender {
    async fn send_success(&self, callback_id: &str, result: &str) -> Result<(), TestError> {
        self.0.send_callback_success(callback_id, result).await
    }

    async fn send_failure(&self, callback_id: &str, error: &TestResultError) -> Result<(), TestError> {
        self.0
            .send_callback_failure(callback_id, ErrorObject::from(error.clone()))
            .await
    }

    async fn send_heartbeat(&self, callback_id: &str) -> Result<(), TestError> {
        self.0.send_callback_heartbeat(callback_id).await
    }
}

/// Builds the batch for events past the first `seen` of `history`.
///
/// Each touched operation is replayed from the full history and paired
/// with its new events only.
pub fn history_batch(history: &[HistoryEvent], seen: usize) -> Vec<OperationEvents> {
    let Some(new_events) = history.get(seen..).filter(|events| !events.is_empty()) else {
        return Vec::new();
    };
    let touched: HashSet<&str> = new_events.iter().filter_map(|e| e.id.as_deref()).collect();

    replay_history(history)
        .into_iter()
        .filter(|entry| touched.contains(entry.operation.id.as_str()))
        .map(|entry| {
            let events = new_events
                .iter()
                .filter(|e| e.id.as_deref() == Some(entry.operation.id.as_str()))
                .cloned()
                .collect();
            OperationEvents::new(entry.operation, events)
        })
        .collect()
}

/// Runs a deployed durable function and exposes its operations to the test.
pub struct CloudDurableTestRunner<I, O> {
    function_name: String,
    backend: SharedBackend,
    config: CloudTestRunnerConfig,
    tracker: SharedTracker,
    current_execution: Mutex<Option<String>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> CloudDurableTestRunner<I, O>
where
    I: Serialize + Send,
    O: DeserializeOwned + Send,
{
    /// Creates a runner for `function_name` using `backend`.
    pub fn new(function_name: impl Into<String>, backend: SharedBackend) -> Self {
        Self {
            function_name: function_name.into(),
            backend,
            config: CloudTestRunnerConfig::default(),
            tracker: Arc::new(Mutex::new(OperationTracker::new())),
            current_execution: Mutex::new(None),
            _types: PhantomData,
        }
    }

    /// Creates a runner backed by [`LambdaDurableBackend::from_env`].
    pub async fn from_env(function_name: impl Into<String>) -> Result<Self, TestError> {
        let backend: SharedBackend = Arc::new(LambdaDurableBackend::from_env().await?);
        Ok(Self::new(function_name, backend))
    }

    /// Replaces the polling configuration.
    pub fn with_config(mut self, config: CloudTestRunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn config(&self) -> &CloudTestRunnerConfig {
        &self.config
    }

    /// Invokes the function and polls until the execution is terminal.
    ///
    /// Transport failures abort the run. An invocation that does not
    /// report an execution ARN is a setup error.
    pub async fn run(&self, payload: I) -> Result<TestResult<O>, TestError> {
        lock_tracker(&self.tracker).reset();
        let payload = serde_json::to_string(&payload)?;

        let arn = self
            .backend
            .invoke(&self.function_name, Some(payload))
            .await?
            .ok_or_else(|| {
                TestError::invalid_configuration(format!(
                    "Invoking {} did not return a durable execution ARN",
                    self.function_name
                ))
            })?;
        tracing::debug!(durable_execution_arn = %arn, "Cloud execution started");
        *self.lock_current() = Some(arn.clone());

        let outcome = self.poll_until_complete(&arn).await;
        *self.lock_current() = None;
        let description = outcome?;

        let (operations, history_events) = {
            let mut tracker = lock_tracker(&self.tracker);
            tracker.complete_execution();
            let operations: Vec<Operation> = tracker
                .get_operations(None)
                .into_iter()
                .map(|entry| entry.operation)
                .collect();
            (operations, tracker.history_events())
        };

        let record = ExecutionRecord {
            status: description.status,
            result: description.result,
            error: description.error.map(TestResultError::from),
        };
        ResultFormatter::create_test_result(record, operations, history_events)
    }

    async fn poll_until_complete(&self, arn: &str) -> Result<ExecutionDescription, TestError> {
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut seen = 0;

        loop {
            let description = self.backend.get_execution(arn).await?;
            let history = get_full_history(self.backend.as_ref(), arn).await?;
            if history.len() > seen {
                let batch = history_batch(&history, seen);
                seen = history.len();
                lock_tracker(&self.tracker).apply_batch(batch);
            }

            if description.status.is_terminal() {
                tracing::debug!(
                    durable_execution_arn = %arn,
                    status = %description.status,
                    "Cloud execution completed"
                );
                return Ok(description);
            }
            if tokio::time::Instant::now() >= deadline {
                lock_tracker(&self.tracker).complete_execution();
                return Err(TestError::wait_timeout(format!(
                    "execution {} did not complete within {:?}",
                    arn, self.config.timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stops the execution currently being run.
    pub async fn stop_execution(&self) -> Result<(), TestError> {
        let arn = self
            .lock_current()
            .clone()
            .ok_or_else(|| TestError::invalid_configuration("No execution is running"))?;
        self.backend
            .stop_execution(&arn, Some(ErrorObject::new("ExecutionStopped", "Execution stopped by test")))
            .await
    }

    /// Forgets the operations of the previous run.
    pub fn reset(&self) {
        lock_tracker(&self.tracker).reset();
    }

    /// Tracks the first operation named `name`.
    pub fn get_operation(&self, name: &str) -> DurableOperation {
        self.track(OperationLookup::by_name(name))
    }

    /// Tracks the `index`-th operation of the run.
    pub fn get_operation_by_index(&self, index: usize) -> DurableOperation {
        self.track(OperationLookup::by_index(index))
    }

    pub fn get_operation_by_name_and_index(&self, name: &str, index: usize) -> DurableOperation {
        self.track(OperationLookup::by_name_and_index(name, index))
    }

    /// Tracks the operation with id `id`.
    pub fn get_operation_by_id(&self, id: &str) -> DurableOperation {
        self.track(OperationLookup::by_id(id))
    }

    /// Every operation replayed so far, in arrival order.
    pub fn get_all_operations(&self) -> Vec<Operation> {
        lock_tracker(&self.tracker)
            .get_operations(None)
            .into_iter()
            .map(|entry| entry.operation)
            .collect()
    }

    fn track(&self, lookup: OperationLookup) -> DurableOperation {
        let sender: Arc<dyn CallbackSender> = Arc::new(BackendCallbackSender(Arc::clone(&self.backend)));
        DurableOperation::track(Arc::clone(&self.tracker), lookup, Some(sender))
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.current_execution.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I, O> std::fmt::Debug for CloudDurableTestRunner<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudDurableTestRunner")
            .field("function_name", &self.function_name)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EventDetails, EventType, ResultDetails, StepStartedDetails};
    use crate::model::{OperationStatus, OperationType};
    use chrono::Utc;

    fn event(event_id: u64, id: &str, event_type: EventType, details: EventDetails) -> HistoryEvent {
        HistoryEvent {
            event_id,
            event_type,
            id: Some(id.to_string()),
            name: Some(id.to_string()),
            parent_id: None,
            sub_type: None,
            event_timestamp: Utc::now(),
            details,
        }
    }

    fn step_history() -> Vec<HistoryEvent> {
        vec![
            event(
                1,
                "a",
                EventType::StepStarted,
                EventDetails::StepStarted(StepStartedDetails::default()),
            ),
            event(
                2,
                "b",
                EventType::StepStarted,
                EventDetails::StepStarted(StepStartedDetails::default()),
            ),
            event(
                3,
                "a",
                EventType::StepSucceeded,
                EventDetails::Result(ResultDetails {
                    result: Some("1".to_string()),
                }),
            ),
        ]
    }

    #[test]
    fn test_config_defaults() {
        let config = CloudTestRunnerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_endpoint_and_uris() {
        let config = LambdaClientConfig::with_region("eu-west-1");
        assert_eq!(config.endpoint(), "https://lambda.eu-west-1.amazonaws.com");

        let local = LambdaClientConfig::default().with_endpoint_url("http://localhost:9000");
        assert_eq!(local.endpoint(), "http://localhost:9000");

        assert_eq!(
            execution_uri("http://h", "arn:aws:lambda:x", "/history"),
            "http://h/2025-12-01/durable-executions/arn%3Aaws%3Alambda%3Ax/history"
        );
        assert_eq!(
            callback_uri("http://h", "cb-1", "succeed"),
            "http://h/2025-12-01/durable-execution-callbacks/cb-1/succeed"
        );
        assert_eq!(
            invoke_uri("http://h", "my-fn"),
            "http://h/2015-03-31/functions/my-fn/invocations"
        );
    }

    #[test]
    fn test_history_batch_pairs_new_events_with_replayed_state() {
        let history = step_history();

        let first = history_batch(&history[..2], 0);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].operation.status, OperationStatus::Started);

        let second = history_batch(&history, 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].operation.id, "a");
        assert_eq!(second[0].operation.status, OperationStatus::Succeeded);
        assert_eq!(second[0].events.len(), 1);
        assert_eq!(second[0].events[0].event_id, 3);
    }

    #[test]
    fn test_history_batch_without_new_events() {
        let history = step_history();
        assert!(history_batch(&history, 3).is_empty());
        assert!(history_batch(&history, 10).is_empty());
    }

    #[test]
    fn test_batches_accumulate_in_tracker() {
        let history = step_history();
        let mut tracker = OperationTracker::new();
        tracker.apply_batch(history_batch(&history[..2], 0));
        tracker.apply_batch(history_batch(&history, 2));

        let a = tracker.index().get_by_id("a").unwrap();
        assert_eq!(a.operation.operation_type, OperationType::Step);
        assert_eq!(a.events.len(), 2);
        assert_eq!(tracker.history_events().len(), 3);
    }
}
