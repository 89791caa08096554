//! Per-node capacity limits.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{AdmissionError, AdmissionResult};
use crate::types::{CapacityLimit, NodeId};

/// Registry of configured limits, keyed by node.
///
/// Reads take a shared lock; registration serializes writers. Entries are
/// kept in node-id order so that iteration is deterministic.
#[derive(Debug, Default)]
pub struct CapacityTable {
    limits: RwLock<BTreeMap<NodeId, CapacityLimit>>,
}

impl CapacityTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or updates a node's limits.
    ///
    /// Registering the same node with the same limits twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidLimit` if either limit is zero.
    pub fn register(&self, node: NodeId, rpm_limit: u64, bpm_limit: u64) -> AdmissionResult<()> {
        let limit = CapacityLimit::new(rpm_limit, bpm_limit);
        if !limit.is_valid() {
            return Err(AdmissionError::InvalidLimit {
                node,
                rpm_limit,
                bpm_limit,
            });
        }

        let mut limits = self.limits.write();
        match limits.insert(node.clone(), limit) {
            Some(previous) if previous == limit => {
                debug!(node = %node, "Node re-registered with unchanged limits");
            }
            Some(previous) => {
                info!(
                    node = %node,
                    old_rpm = previous.rpm_limit,
                    old_bpm = previous.bpm_limit,
                    rpm_limit,
                    bpm_limit,
                    "Node limits updated"
                );
            }
            None => {
                info!(node = %node, rpm_limit, bpm_limit, "Node registered");
            }
        }
        Ok(())
    }

    /// Looks up a node's limits.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::NotFound` if the node is not registered.
    pub fn get(&self, node: &NodeId) -> AdmissionResult<CapacityLimit> {
        self.limits
            .read()
            .get(node)
            .copied()
            .ok_or_else(|| AdmissionError::NotFound(node.clone()))
    }

    /// Removes a node, returning its former limits.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::NotFound` if the node is not registered.
    pub fn deregister(&self, node: &NodeId) -> AdmissionResult<CapacityLimit> {
        let removed = self.limits.write().remove(node);
        removed.map_or_else(
            || Err(AdmissionError::NotFound(node.clone())),
            |limit| {
                info!(node = %node, "Node deregistered");
                Ok(limit)
            },
        )
    }

    /// Returns true if the node is registered.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.limits.read().contains_key(node)
    }

    /// Copies all entries in node-id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(NodeId, CapacityLimit)> {
        self.limits
            .read()
            .iter()
            .map(|(node, limit)| (node.clone(), *limit))
            .collect()
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.limits.read().len()
    }

    /// Returns true if no node is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let table = CapacityTable::new();
        table.register(node("a"), 2, 100).unwrap();

        let limit = table.get(&node("a")).unwrap();
        assert_eq!(limit.rpm_limit, 2);
        assert_eq!(limit.bpm_limit, 100);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&node("a")));
    }

    #[test]
    fn test_register_rejects_zero_limits() {
        let table = CapacityTable::new();

        let result = table.register(node("a"), 0, 100);
        assert!(matches!(result, Err(AdmissionError::InvalidLimit { rpm_limit: 0, .. })));

        let result = table.register(node("a"), 5, 0);
        assert!(matches!(result, Err(AdmissionError::InvalidLimit { bpm_limit: 0, .. })));

        assert!(table.is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let table = CapacityTable::new();
        table.register(node("a"), 2, 100).unwrap();
        let before = table.snapshot();

        table.register(node("a"), 2, 100).unwrap();
        assert_eq!(table.snapshot(), before);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_register_upserts() {
        let table = CapacityTable::new();
        table.register(node("a"), 2, 100).unwrap();
        table.register(node("a"), 5, 500).unwrap();

        assert_eq!(table.get(&node("a")).unwrap(), CapacityLimit::new(5, 500));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_failed_update_keeps_previous_limits() {
        let table = CapacityTable::new();
        table.register(node("a"), 2, 100).unwrap();
        assert!(table.register(node("a"), 0, 0).is_err());

        assert_eq!(table.get(&node("a")).unwrap(), CapacityLimit::new(2, 100));
    }

    #[test]
    fn test_get_unknown_node() {
        let table = CapacityTable::new();
        let result = table.get(&node("ghost"));
        assert!(matches!(result, Err(AdmissionError::NotFound(ref n)) if n.as_str() == "ghost"));
    }

    #[test]
    fn test_deregister() {
        let table = CapacityTable::new();
        table.register(node("a"), 1, 1).unwrap();

        assert_eq!(table.deregister(&node("a")).unwrap(), CapacityLimit::new(1, 1));
        assert!(table.is_empty());
        assert!(table.deregister(&node("a")).is_err());
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let table = CapacityTable::new();
        table.register(node("c"), 1, 1).unwrap();
        table.register(node("a"), 1, 1).unwrap();
        table.register(node("b"), 1, 1).unwrap();

        let ids: Vec<_> = table
            .snapshot()
            .into_iter()
            .map(|(n, _)| n.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
