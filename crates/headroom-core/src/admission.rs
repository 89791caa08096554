//! Eligibility computation over the capacity table and the usage ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::capacity::CapacityTable;
use crate::error::AdmissionResult;
use crate::ledger::UsageLedger;
use crate::store::UsageStore;
use crate::types::{CapacityLimit, HeadroomCheck, NodeId, Remaining, WindowAggregate};

/// A node that may receive the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The node.
    pub node: NodeId,
    /// Its configured limits.
    pub limit: CapacityLimit,
    /// Its usage in the current window.
    pub usage: WindowAggregate,
}

impl Candidate {
    /// Smaller of the remaining RPM and BPM fractions.
    #[must_use]
    pub fn headroom_fraction(&self) -> f64 {
        self.limit.headroom_fraction(&self.usage)
    }
}

/// Nodes with headroom at one instant, in node-id order.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilitySet {
    evaluated_at: DateTime<Utc>,
    candidates: Vec<Candidate>,
}

impl EligibilitySet {
    /// Builds a set from candidates already in node-id order.
    #[must_use]
    pub const fn new(evaluated_at: DateTime<Utc>, candidates: Vec<Candidate>) -> Self {
        Self {
            evaluated_at,
            candidates,
        }
    }

    /// The instant the set was computed for.
    #[must_use]
    pub const fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }

    /// The candidates.
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Candidate node ids.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.candidates.iter().map(|c| &c.node)
    }

    /// Returns true if `node` is eligible.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.candidates.iter().any(|c| &c.node == node)
    }

    /// Number of eligible nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns true if no node is eligible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Usage and headroom of one node, as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUsage {
    /// The node.
    pub node: NodeId,
    /// Configured limits.
    pub limit: CapacityLimit,
    /// Usage in the current window.
    pub usage: WindowAggregate,
    /// Budget left in the current window.
    pub remaining: Remaining,
    /// Smaller of the remaining RPM and BPM fractions.
    pub headroom: f64,
    /// Whether the node currently has headroom.
    pub eligible: bool,
}

impl NodeUsage {
    fn new(node: NodeId, limit: CapacityLimit, usage: WindowAggregate) -> Self {
        Self {
            remaining: limit.remaining(&usage),
            headroom: limit.headroom_fraction(&usage),
            eligible: limit.has_headroom(&usage),
            node,
            limit,
            usage,
        }
    }
}

/// Computes which nodes have headroom.
#[derive(Debug)]
pub struct AdmissionEngine<S> {
    capacity: Arc<CapacityTable>,
    ledger: Arc<UsageLedger<S>>,
    check: HeadroomCheck,
}

impl<S: UsageStore> AdmissionEngine<S> {
    /// Creates an engine over shared capacity and ledger instances.
    #[must_use]
    pub const fn new(capacity: Arc<CapacityTable>, ledger: Arc<UsageLedger<S>>, check: HeadroomCheck) -> Self {
        Self {
            capacity,
            ledger,
            check,
        }
    }

    /// The capacity table.
    #[must_use]
    pub const fn capacity(&self) -> &Arc<CapacityTable> {
        &self.capacity
    }

    /// The usage ledger.
    #[must_use]
    pub const fn ledger(&self) -> &Arc<UsageLedger<S>> {
        &self.ledger
    }

    /// How the incoming workload takes part in eligibility.
    #[must_use]
    pub const fn headroom_check(&self) -> HeadroomCheck {
        self.check
    }

    /// Every registered node strictly below both limits at `now`.
    ///
    /// An empty set is not an error.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced, never read as zero usage.
    pub async fn eligible_nodes(&self, now: DateTime<Utc>) -> AdmissionResult<EligibilitySet> {
        self.evaluate(now, |limit, usage| limit.has_headroom(usage)).await
    }

    /// Nodes that may take a request carrying `workload` at `now`, per the
    /// configured [`HeadroomCheck`].
    ///
    /// # Errors
    ///
    /// Store failures are surfaced, never read as zero usage.
    pub async fn eligible_for(&self, now: DateTime<Utc>, workload: u64) -> AdmissionResult<EligibilitySet> {
        let check = self.check;
        self.evaluate(now, |limit, usage| limit.admits(usage, workload, check)).await
    }

    async fn evaluate<F>(&self, now: DateTime<Utc>, admits: F) -> AdmissionResult<EligibilitySet>
    where
        F: Fn(&CapacityLimit, &WindowAggregate) -> bool,
    {
        let table = self.capacity.snapshot();
        let nodes: Vec<NodeId> = table.iter().map(|(node, _)| node.clone()).collect();
        let aggregates = self.ledger.aggregate_many(&nodes, now).await?;

        let candidates: Vec<Candidate> = table
            .into_iter()
            .zip(aggregates)
            .filter(|((_, limit), usage)| admits(limit, usage))
            .map(|((node, limit), usage)| Candidate { node, limit, usage })
            .collect();

        trace!(registered = nodes.len(), eligible = candidates.len(), "Eligibility evaluated");
        Ok(EligibilitySet::new(now, candidates))
    }

    /// Usage of every registered node at `now`, in node-id order.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced.
    pub async fn usage_report(&self, now: DateTime<Utc>) -> AdmissionResult<Vec<NodeUsage>> {
        let table = self.capacity.snapshot();
        let nodes: Vec<NodeId> = table.iter().map(|(node, _)| node.clone()).collect();
        let aggregates = self.ledger.aggregate_many(&nodes, now).await?;

        Ok(table
            .into_iter()
            .zip(aggregates)
            .map(|((node, limit), usage)| NodeUsage::new(node, limit, usage))
            .collect())
    }

    /// Usage of one node at `now`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unregistered node; store failures are surfaced.
    pub async fn node_usage(&self, node: &NodeId, now: DateTime<Utc>) -> AdmissionResult<NodeUsage> {
        let limit = self.capacity.get(node)?;
        let usage = self.ledger.window_aggregate(node, now).await?;
        Ok(NodeUsage::new(node.clone(), limit, usage))
    }
}
