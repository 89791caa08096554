//! Error types for admission control.

use std::time::Duration;

use thiserror::Error;

use crate::types::NodeId;

/// Errors that can occur in admission-control operations.
///
/// A request rejected because every node is at its limit is *not* an error;
/// see [`AdmissionDecision::Rejected`](crate::dispatcher::AdmissionDecision).
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A registration supplied a zero limit.
    #[error("invalid limits for node {node}: rpm_limit={rpm_limit}, bpm_limit={bpm_limit} (both must be > 0)")]
    InvalidLimit {
        /// The node being registered.
        node: NodeId,
        /// Requested RPM limit.
        rpm_limit: u64,
        /// Requested BPM limit.
        bpm_limit: u64,
    },

    /// A node identifier failed validation.
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    /// Lookup of a node that is not registered.
    #[error("node {0} not found")]
    NotFound(NodeId),

    /// The usage store could not complete an operation.
    #[error("usage store unavailable: {0}")]
    StoreUnavailable(String),

    /// The usage store did not answer within the allotted time.
    #[error("usage store timed out during {operation} after {}ms", .timeout.as_millis())]
    StoreTimeout {
        /// The store operation that timed out.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdmissionError {
    /// Returns true for failures of the backing store.
    #[must_use]
    pub const fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::StoreTimeout { .. })
    }
}

impl From<std::io::Error> for AdmissionError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AdmissionError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("journal encoding: {err}"))
    }
}

/// Result type for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;
