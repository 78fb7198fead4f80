//! Callback lifecycle: registration, completion, heartbeats and timeouts.
//!
//! A callback is registered when its CALLBACK operation starts. It may then
//! be completed once, by success, failure or timeout. Two independent
//! deadlines apply: the overall timeout counted from registration, and the
//! heartbeat timeout counted from the last heartbeat.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::TestError;
use crate::model::ErrorObject;

/// How a callback was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteCallbackStatus {
    Success,
    Failure,
    TimedOut,
}

/// Deadlines configured by the handler when the callback started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackTimeouts {
    pub timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
}

impl CallbackTimeouts {
    /// Builds timeouts from whole seconds.
    pub fn from_seconds(timeout: Option<u64>, heartbeat_timeout: Option<u64>) -> Self {
        Self {
            timeout: timeout.map(Duration::from_secs),
            heartbeat_timeout: heartbeat_timeout.map(Duration::from_secs),
        }
    }
}

/// Internal state of a callback.
#[derive(Debug, Clone)]
pub struct CallbackState {
    pub callback_id: String,
    /// The CALLBACK operation this callback completes
    pub operation_id: String,
    pub timeouts: CallbackTimeouts,
    pub registered_at: Instant,
    pub last_heartbeat: Instant,
    /// None while the callback is pending
    pub completion_status: Option<CompleteCallbackStatus>,
}

impl CallbackState {
    fn new(callback_id: &str, operation_id: &str, timeouts: CallbackTimeouts) -> Self {
        let now = Instant::now();
        Self {
            callback_id: callback_id.to_string(),
            operation_id: operation_id.to_string(),
            timeouts,
            registered_at: now,
            last_heartbeat: now,
            completion_status: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion_status.is_some()
    }

    /// Returns the expired deadline, if any, as of `now`.
    pub fn expired_deadline(&self, now: Instant) -> Option<TimeoutKind> {
        if let Some(timeout) = self.timeouts.timeout {
            if now.saturating_duration_since(self.registered_at) > timeout {
                return Some(TimeoutKind::Overall);
            }
        }
        match self.timeouts.heartbeat_timeout {
            Some(timeout) if now.saturating_duration_since(self.last_heartbeat) > timeout => {
                Some(TimeoutKind::Heartbeat)
            }
            _ => None,
        }
    }
}

/// Which deadline a callback missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Overall,
    Heartbeat,
}

impl TimeoutKind {
    /// The error recorded on the timed out operation.
    pub fn to_error(self) -> ErrorObject {
        match self {
            Self::Overall => ErrorObject::new("CallbackTimeout", "Callback timed out"),
            Self::Heartbeat => {
                ErrorObject::new("CallbackHeartbeatTimeout", "Callback heartbeat timed out")
            }
        }
    }
}

/// A callback that missed a deadline during [`CallbackManager::check_timeouts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOutCallback {
    pub callback_id: String,
    pub operation_id: String,
    pub kind: TimeoutKind,
}

/// Tracks the callbacks of one execution.
#[derive(Debug, Default)]
pub struct CallbackManager {
    execution_id: String,
    callbacks: HashMap<String, CallbackState>,
}

impl CallbackManager {
    /// Creates a manager for one execution.
    pub fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            callbacks: HashMap::new(),
        }
    }

    /// Registers a new pending callback for `operation_id`.
    pub fn register_callback(
        &mut self,
        callback_id: &str,
        operation_id: &str,
        timeouts: CallbackTimeouts,
    ) -> Result<(), TestError> {
        if self.callbacks.contains_key(callback_id) {
            return Err(TestError::callback_already_completed(format!(
                "Callback {} already registered",
                callback_id
            )));
        }
        self.callbacks.insert(
            callback_id.to_string(),
            CallbackState::new(callback_id, operation_id, timeouts),
        );
        Ok(())
    }

    fn pending_mut(&mut self, callback_id: &str) -> Result<&mut CallbackState, TestError> {
        let state = self
            .callbacks
            .get_mut(callback_id)
            .ok_or_else(|| TestError::callback_not_found(callback_id))?;
        if state.is_completed() {
            return Err(TestError::callback_already_completed(callback_id));
        }
        Ok(state)
    }

    /// Marks the callback completed and returns its operation id.
    pub fn complete(
        &mut self,
        callback_id: &str,
        status: CompleteCallbackStatus,
    ) -> Result<String, TestError> {
        let state = self.pending_mut(callback_id)?;
        state.completion_status = Some(status);
        Ok(state.operation_id.clone())
    }

    /// Records a heartbeat, resetting the heartbeat deadline.
    pub fn send_heartbeat(&mut self, callback_id: &str) -> Result<(), TestError> {
        let state = self.pending_mut(callback_id)?;
        state.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Marks every pending callback past a deadline as timed out.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<TimedOutCallback> {
        let mut timed_out = Vec::new();
        for state in self.callbacks.values_mut() {
            if state.is_completed() {
                continue;
            }
            if let Some(kind) = state.expired_deadline(now) {
                state.completion_status = Some(CompleteCallbackStatus::TimedOut);
                timed_out.push(TimedOutCallback {
                    callback_id: state.callback_id.clone(),
                    operation_id: state.operation_id.clone(),
                    kind,
                });
            }
        }
        timed_out
    }

    /// True if `callback_id` was ever registered here.
    pub fn contains(&self, callback_id: &str) -> bool {
        self.callbacks.contains_key(callback_id)
    }

    /// How the callback completed, or `None` while pending.
    pub fn get_callback_status(&self, callback_id: &str) -> Option<CompleteCallbackStatus> {
        self.callbacks
            .get(callback_id)
            .and_then(|state| state.completion_status)
    }

    pub fn get_callback_state(&self, callback_id: &str) -> Option<&CallbackState> {
        self.callbacks.get(callback_id)
    }

    /// Number of callbacks still waiting for completion.
    pub fn pending_count(&self) -> usize {
        self.callbacks.values().filter(|s| !s.is_completed()).count()
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}
