//! Opaque checkpoint tokens.
//!
//! A token is URL-safe base64 (no padding) over the JSON of
//! [`CheckpointTokenData`]. Handlers treat it as opaque; the server decodes it
//! to route a checkpoint to its execution and to reject tokens from
//! invocations that already completed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::TestError;

use super::types::{CheckpointToken, ExecutionId, InvocationId};

/// Decoded contents of a checkpoint token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointTokenData {
    pub execution_id: ExecutionId,
    pub invocation_id: InvocationId,
    /// Distinguishes successive tokens handed to the same invocation
    pub nonce: String,
}

impl CheckpointTokenData {
    /// Creates token data with a fresh nonce.
    pub fn new(execution_id: &str, invocation_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            invocation_id: invocation_id.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Encodes as URL-safe base64 of the JSON form.
    pub fn encode(&self) -> Result<CheckpointToken, TestError> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Reverses [`encode`](Self::encode). Any malformed input is an
    /// `InvalidCheckpointToken` error.
    pub fn decode(token: &str) -> Result<Self, TestError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| TestError::invalid_checkpoint_token(format!("base64 decode error: {}", e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| TestError::invalid_checkpoint_token(format!("utf8 decode error: {}", e)))?;
        serde_json::from_str(&json)
            .map_err(|e| TestError::invalid_checkpoint_token(format!("json parse error: {}", e)))
    }
}
