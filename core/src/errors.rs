//! Errors surfaced by the coordinator.

use envoy_providers::ProviderError;

use crate::parser::CallOutcome;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Handle resolution or generation failed. Carried unmodified.
    #[error(transparent)]
    Transport(#[from] ProviderError),
    /// The model answered, but not with the structured data that was asked for.
    #[error("{outcome} from {model}: {message}")]
    InvalidResponse {
        model: String,
        outcome: CallOutcome,
        message: String,
        raw_response: String,
    },
}

impl CoordinatorError {
    /// The underlying transport error, if that is what this is.
    #[must_use]
    pub fn as_transport(&self) -> Option<&ProviderError> {
        match self {
            Self::Transport(err) => Some(err),
            Self::InvalidResponse { .. } => None,
        }
    }

    #[must_use]
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Self::Transport(_) => None,
            Self::InvalidResponse { raw_response, .. } => Some(raw_response),
        }
    }
}
