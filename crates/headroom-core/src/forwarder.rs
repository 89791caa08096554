//! Delivery of admitted requests to their node.
//!
//! Forwarding happens after the admission decision has been committed;
//! a delivery failure never rolls back the recorded usage.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::types::{NodeId, WorkRequest};

/// Failure to hand a request to its node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The node could not be reached.
    #[error("node {node} unreachable: {reason}")]
    Unreachable {
        /// Target node.
        node: NodeId,
        /// Transport detail.
        reason: String,
    },
}

/// Sends admitted requests downstream.
pub trait Forwarder: Send + Sync + fmt::Debug {
    /// Delivers `request` to `node`.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError` if the node cannot take the request.
    fn deliver(&self, node: &NodeId, request: &WorkRequest) -> Result<(), ForwardError>;
}

/// Simulated forwarder that only logs the hand-off.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingForwarder;

impl Forwarder for LoggingForwarder {
    fn deliver(&self, node: &NodeId, request: &WorkRequest) -> Result<(), ForwardError> {
        info!(node = %node, bpm = request.workload, "Forwarding request to node");
        Ok(())
    }
}

/// Forwarder that records deliveries, for tests.
#[derive(Debug, Default)]
pub struct RecordingForwarder {
    delivered: Mutex<Vec<(NodeId, WorkRequest)>>,
    failing: AtomicBool,
}

impl RecordingForwarder {
    /// Creates a forwarder that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Deliveries accepted so far, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<(NodeId, WorkRequest)> {
        self.delivered.lock().clone()
    }

    /// Number of deliveries accepted for `node`.
    #[must_use]
    pub fn count_for(&self, node: &NodeId) -> usize {
        self.delivered.lock().iter().filter(|(n, _)| n == node).count()
    }
}

impl Forwarder for RecordingForwarder {
    fn deliver(&self, node: &NodeId, request: &WorkRequest) -> Result<(), ForwardError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ForwardError::Unreachable {
                node: node.clone(),
                reason: "forwarder set to fail".to_string(),
            });
        }
        self.delivered.lock().push((node.clone(), *request));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_logging_forwarder_accepts() {
        assert!(LoggingForwarder.deliver(&node("a"), &WorkRequest::new(30)).is_ok());
    }

    #[test]
    fn test_recording_forwarder() {
        let forwarder = RecordingForwarder::new();
        forwarder.deliver(&node("a"), &WorkRequest::new(1)).unwrap();
        forwarder.deliver(&node("b"), &WorkRequest::new(2)).unwrap();
        forwarder.deliver(&node("a"), &WorkRequest::new(3)).unwrap();

        assert_eq!(forwarder.count_for(&node("a")), 2);
        assert_eq!(forwarder.delivered()[1], (node("b"), WorkRequest::new(2)));
    }

    #[test]
    fn test_recording_forwarder_failure() {
        let forwarder = RecordingForwarder::new();
        forwarder.set_failing(true);

        let err = forwarder.deliver(&node("a"), &WorkRequest::new(1)).unwrap_err();
        assert!(err.to_string().contains("unreachable"));
        assert!(forwarder.delivered().is_empty());
    }
}
