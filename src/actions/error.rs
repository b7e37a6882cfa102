// ABOUTME: Error type returned by actions and the action invoker
// ABOUTME: Distinguishes unknown actions, bad parameters, failures and cancellation

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid parameters for '{action}': {message}")]
    InvalidParams { action: String, message: String },

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl ActionError {
    pub fn invalid_params(action: &str, message: impl std::fmt::Display) -> Self {
        ActionError::InvalidParams {
            action: action.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ActionError>;
