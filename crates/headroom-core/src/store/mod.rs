//! Storage backends for usage events.
//!
//! The [`UsageStore`] trait is the persistence seam of the ledger: a store
//! must be able to insert timestamped, node-tagged records and to compute
//! count/sum over a time-bounded, node-filtered subset.
//!
//! - [`MemoryUsageStore`] keeps a per-node, time-ordered index in memory
//! - [`JournalUsageStore`] adds an fsynced JSON-lines journal on top of it

mod journal;
mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::AdmissionResult;
use crate::types::{EventHandle, NodeId, TimeWindow, UsageEvent, WindowAggregate};

pub use journal::JournalUsageStore;
pub use memory::MemoryUsageStore;

/// Backing store for usage events.
///
/// All methods are async so that remote stores fit behind the same seam.
/// Callers bound every call with a timeout; implementations should not
/// retry internally.
pub trait UsageStore: Send + Sync + 'static {
    /// Inserts an event. The event is durable (per the store's own
    /// durability mode) once the future resolves successfully.
    fn insert(&self, event: UsageEvent) -> impl Future<Output = AdmissionResult<()>> + Send;

    /// Count and workload sum for one node over `window`.
    fn aggregate(
        &self,
        node: &NodeId,
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<WindowAggregate>> + Send;

    /// Aggregates for several nodes, taken from one consistent snapshot.
    ///
    /// The result is index-aligned with `nodes`.
    fn aggregate_many(
        &self,
        nodes: &[NodeId],
        window: TimeWindow,
    ) -> impl Future<Output = AdmissionResult<Vec<WindowAggregate>>> + Send;

    /// Removes a single event. Returns false if the handle is unknown.
    fn retract(&self, handle: EventHandle) -> impl Future<Output = AdmissionResult<bool>> + Send;

    /// Discards every event with `timestamp <= cutoff`, returning how many
    /// were removed.
    fn prune_before(&self, cutoff: DateTime<Utc>) -> impl Future<Output = AdmissionResult<usize>> + Send;

    /// Number of stored events.
    fn len(&self) -> usize;

    /// Returns true if no events are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
