//! In-memory usage store.
//!
//! Events are grouped by node; each node's events sit in a `VecDeque` kept in
//! timestamp order (ties in insertion order), so a window query is one binary
//! search plus a scan of the events inside the window.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::AdmissionResult;
use crate::store::UsageStore;
use crate::types::{shift_back, EventHandle, NodeId, TimeWindow, UsageEvent, WindowAggregate};

#[derive(Debug, Default)]
struct Series {
    by_node: HashMap<NodeId, VecDeque<UsageEvent>>,
    owners: HashMap<EventHandle, NodeId>,
}

impl Series {
    fn aggregate(&self, node: &NodeId, window: TimeWindow) -> WindowAggregate {
        let mut aggregate = WindowAggregate::default();
        let Some(events) = self.by_node.get(node) else {
            return aggregate;
        };

        let lo = events.partition_point(|e| e.timestamp <= window.start);
        for event in events.range(lo..).take_while(|e| window.contains(e.timestamp)) {
            aggregate.record(event.workload);
        }
        aggregate
    }

    fn prune_node(&mut self, node: &NodeId, cutoff: DateTime<Utc>) -> usize {
        let Some(events) = self.by_node.get_mut(node) else {
            return 0;
        };
        let mut removed = 0;
        while events.front().is_some_and(|e| e.timestamp <= cutoff) {
            if let Some(event) = events.pop_front() {
                self.owners.remove(&event.handle);
                removed += 1;
            }
        }
        if events.is_empty() {
            self.by_node.remove(node);
        }
        removed
    }
}

/// Thread-safe in-memory store with on-insert pruning.
///
/// Durability is relaxed: events live only as long as the process.
#[derive(Debug)]
pub struct MemoryUsageStore {
    retention: Duration,
    series: RwLock<Series>,
}

impl MemoryUsageStore {
    /// Creates a store that prunes events older than `retention` relative
    /// to each inserted event's timestamp.
    ///
    /// Insert timestamps must not run behind the instants later queried;
    /// the dispatcher guarantees this by never admitting at an earlier time
    /// than its previous admission.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            series: RwLock::new(Series::default()),
        }
    }

    /// Returns the retention horizon.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }

    /// Inserts an event, keeping the node's series ordered.
    #[allow(clippy::significant_drop_tightening)] // insert + prune is one step
    pub fn insert_event(&self, event: UsageEvent) {
        let cutoff = shift_back(event.timestamp, self.retention);
        let node = event.node.clone();

        let mut series = self.series.write();
        series.owners.insert(event.handle, node.clone());
        let events = series.by_node.entry(node.clone()).or_default();
        if events.back().is_none_or(|last| last.timestamp <= event.timestamp) {
            events.push_back(event);
        } else {
            let pos = events.partition_point(|e| e.timestamp <= event.timestamp);
            events.insert(pos, event);
        }

        let pruned = series.prune_node(&node, cutoff);
        if pruned > 0 {
            debug!(node = %node, pruned, "Pruned expired usage events on insert");
        }
    }

    /// Aggregate for one node.
    #[must_use]
    pub fn aggregate_window(&self, node: &NodeId, window: TimeWindow) -> WindowAggregate {
        self.series.read().aggregate(node, window)
    }

    /// Aggregates for several nodes under one read lock.
    #[must_use]
    pub fn aggregate_window_many(&self, nodes: &[NodeId], window: TimeWindow) -> Vec<WindowAggregate> {
        let series = self.series.read();
        nodes.iter().map(|node| series.aggregate(node, window)).collect()
    }

    /// Removes one event by handle.
    #[allow(clippy::significant_drop_tightening)]
    pub fn retract_event(&self, handle: EventHandle) -> bool {
        let mut series = self.series.write();
        let Some(node) = series.owners.remove(&handle) else {
            return false;
        };
        let mut removed = false;
        if let Some(events) = series.by_node.get_mut(&node) {
            if let Some(pos) = events.iter().position(|e| e.handle == handle) {
                events.remove(pos);
                removed = true;
            }
            if events.is_empty() {
                series.by_node.remove(&node);
            }
        }
        removed
    }

    /// Drops every event with `timestamp <= cutoff` across all nodes.
    #[allow(clippy::significant_drop_tightening)]
    pub fn prune_events(&self, cutoff: DateTime<Utc>) -> usize {
        let mut series = self.series.write();
        let nodes: Vec<NodeId> = series.by_node.keys().cloned().collect();
        nodes.iter().map(|node| series.prune_node(node, cutoff)).sum()
    }

    /// Copies all events, ordered by node then time.
    #[must_use]
    pub fn events(&self) -> Vec<UsageEvent> {
        let series = self.series.read();
        let mut nodes: Vec<&NodeId> = series.by_node.keys().collect();
        nodes.sort();
        nodes
            .into_iter()
            .filter_map(|node| series.by_node.get(node))
            .flat_map(|events| events.iter().cloned())
            .collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.series.read().owners.len()
    }

    /// Number of nodes with at least one stored event.
    #[must_use]
    pub fn tracked_nodes(&self) -> usize {
        self.series.read().by_node.len()
    }
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_WINDOW_SECS))
    }
}

impl UsageStore for MemoryUsageStore {
    fn insert(&self, event: UsageEvent) -> impl Future<Output = AdmissionResult<()>> + Send {
        async move {
            self.insert_event(event);
            Ok(())
        }
    }

    fn aggregate(
        &self,
        node: &NodeId,
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<WindowAggregate>> + Send {
        async move { Ok(self.aggregate_window(node, window)) }
    }

    fn aggregate_many(
        &self,
        nodes: &[NodeId],
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<Vec<WindowAggregate>>> + Send {
        async move { Ok(self.aggregate_window_many(nodes, window)) }
    }

    fn retract(&self, handle: EventHandle) -> impl Future<Output = AdmissionResult<bool>> + Send {
        async move { Ok(self.retract_event(handle)) }
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> impl Future<Output = AdmissionResult<usize>> + Send {
        async move { Ok(self.prune_events(cutoff)) }
    }

    fn len(&self) -> usize {
        self.event_count()
    }
}
