use thiserror::Error;
use ulid::Ulid;

use crate::gateway::GatewayError;
use crate::model::Ms;

#[derive(Debug, Error)]
pub enum BlockError {
    /// `end <= start`. Surfaced as a validation message, never retried.
    #[error("invalid range: end ({end}) must be after start ({start})")]
    InvalidRange { start: Ms, end: Ms },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("block {0} belongs to a booking and cannot be modified")]
    BookingImmutable(Ulid),
    #[error("time period overlaps booking {0}")]
    BookingConflict(Ulid),
    #[error("persistence failure: {0}")]
    Persistence(#[from] GatewayError),
}

impl BlockError {
    /// Validation errors block submission; they are the caller's to fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BlockError::InvalidRange { .. }
                | BlockError::LimitExceeded(_)
                | BlockError::BookingImmutable(_)
                | BlockError::BookingConflict(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BlockError::Persistence(e) => e.is_retryable(),
            _ => false,
        }
    }
}
