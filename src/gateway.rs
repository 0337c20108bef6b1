//! The persistence boundary used by the calendar service.
//!
//! Implementations own id and timestamp assignment. They are expected to
//! serialize writes per resource; the calendar service additionally holds a
//! per-resource lock across each read-resolve-write sequence.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BlockedInterval, Candidate};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection failed, timed out, or the body could not be read.
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("limit exceeded: {0}")]
    Limit(&'static str),
    /// The store refused the record itself.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Transient failures worth offering a retry for.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Wal(_) => true,
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            GatewayError::InvalidResponse(_) | GatewayError::Limit(_) | GatewayError::Rejected(_) => false,
        }
    }
}

/// Result of a delete. Deleting an id that is already gone is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Deletion {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn list_intervals(&self, resource_id: Ulid) -> Result<Vec<BlockedInterval>, GatewayError>;

    /// Persist a candidate as a new record; the gateway assigns id and timestamps.
    async fn create_interval(
        &self,
        resource_id: Ulid,
        candidate: &Candidate,
    ) -> Result<BlockedInterval, GatewayError>;

    async fn delete_interval(&self, id: Ulid) -> Result<Deletion, GatewayError>;
}
