//! Error taxonomy shared by every workflow.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaitlistError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("already on the waitlist")]
    AlreadyOnWaitlist,
    #[error("subject is in stock")]
    InStock,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        message: String,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T, E = WaitlistError> = std::result::Result<T, E>;

impl WaitlistError {
    pub fn unavailable(collaborator: &'static str, err: anyhow::Error) -> Self {
        WaitlistError::CollaboratorUnavailable {
            collaborator,
            message: format!("{err:#}"),
        }
    }

    /// Text safe to show to the customer who triggered the failing request.
    pub fn user_message(&self) -> &'static str {
        match self {
            WaitlistError::AlreadyOnWaitlist => "You are already on the waitlist for this product.",
            WaitlistError::InStock => "This item is in stock. Please add it to your cart.",
            WaitlistError::ValidationFailed(_) => "Please check your details and try again.",
            WaitlistError::NotFound(_) => "We could not find that item.",
            WaitlistError::InvalidState(_) => "This waitlist entry can no longer be changed.",
            WaitlistError::CollaboratorUnavailable { .. }
            | WaitlistError::Storage(_)
            | WaitlistError::Corrupt(_) => "Something went wrong. Please try again shortly.",
        }
    }

    /// True for failures worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WaitlistError::CollaboratorUnavailable { .. } | WaitlistError::Storage(_)
        )
    }
}
