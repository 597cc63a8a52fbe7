//! Agent Core error types.

use thiserror::Error;

/// Errors that end a turn early. They are rendered into the turn's answer
/// rather than returned to the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The completion engine failed before producing any text.
    #[error("completion engine failed: {reason}")]
    UpstreamGeneration { reason: String },
}

impl From<crate::inference::InferenceError> for AgentError {
    fn from(e: crate::inference::InferenceError) -> Self {
        AgentError::UpstreamGeneration {
            reason: e.to_string(),
        }
    }
}
