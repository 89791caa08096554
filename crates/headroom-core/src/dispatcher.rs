//! Request-handling entry point.
//!
//! The dispatcher runs eligibility, selection and the ledger append as one
//! critical section under a single async mutex, so two concurrent requests
//! can never both claim the last unit of a node's headroom. Forwarding
//! happens after the lock is released.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionEngine;
use crate::capacity::CapacityTable;
use crate::clock::Clock;
use crate::config::HeadroomConfig;
use crate::error::AdmissionResult;
use crate::forwarder::Forwarder;
use crate::ledger::UsageLedger;
use crate::selection::{policy_from_config, SelectionPolicy};
use crate::store::UsageStore;
use crate::types::{EventHandle, NodeId, UsageEvent, WorkRequest};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Every registered node is at one of its limits.
    AllNodesAtLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllNodesAtLimit => f.write_str("All nodes are currently at rate limit. Retry later."),
        }
    }
}

/// A committed admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// Node the request was routed to.
    pub node: NodeId,
    /// Handle of the recorded usage event.
    pub handle: EventHandle,
    /// Admission time, as recorded in the ledger.
    pub timestamp: DateTime<Utc>,
    /// Whether the forwarder accepted the request.
    pub delivered: bool,
}

/// Outcome of [`Dispatcher::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The request was admitted and recorded.
    Admitted(Admission),
    /// No node had headroom; nothing was recorded.
    Rejected {
        /// Why.
        reason: RejectReason,
    },
}

impl AdmissionDecision {
    /// Check if the request was admitted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// Check if the request was rejected.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The chosen node, if admitted.
    #[must_use]
    pub const fn node(&self) -> Option<&NodeId> {
        match self {
            Self::Admitted(admission) => Some(&admission.node),
            Self::Rejected { .. } => None,
        }
    }
}

/// Decision counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    store_failures: AtomicU64,
    forward_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Requests admitted.
    pub admitted: u64,
    /// Requests rejected for lack of headroom.
    pub rejected: u64,
    /// Requests aborted by a store failure.
    pub store_failures: u64,
    /// Admitted requests the forwarder failed to deliver.
    pub forward_failures: u64,
}

impl DispatcherStats {
    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Admits, routes and records incoming requests.
#[derive(Debug)]
pub struct Dispatcher<S> {
    engine: AdmissionEngine<S>,
    policy: Box<dyn SelectionPolicy>,
    forwarder: Arc<dyn Forwarder>,
    clock: Arc<dyn Clock>,
    /// Guards the admission critical section and holds the latest
    /// admission instant, so event timestamps never move backwards.
    admission_lock: Mutex<DateTime<Utc>>,
    stats: DispatcherStats,
}

impl<S: UsageStore> Dispatcher<S> {
    /// Assembles a dispatcher from its parts.
    #[must_use]
    pub fn new(
        engine: AdmissionEngine<S>,
        policy: Box<dyn SelectionPolicy>,
        forwarder: Arc<dyn Forwarder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            policy,
            forwarder,
            clock,
            admission_lock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            stats: DispatcherStats::default(),
        }
    }

    /// Builds the ledger, engine and policy described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::Config` if the configuration is invalid.
    pub fn from_config(
        config: &HeadroomConfig,
        capacity: Arc<CapacityTable>,
        store: S,
        forwarder: Arc<dyn Forwarder>,
        clock: Arc<dyn Clock>,
    ) -> AdmissionResult<Self> {
        config.validate()?;
        let ledger = Arc::new(UsageLedger::new(store, config.ledger.clone()));
        let engine = AdmissionEngine::new(capacity, ledger, config.admission.headroom_check);
        let policy = policy_from_config(&config.admission);
        info!(
            window_secs = config.ledger.window_secs,
            selection = policy.name(),
            headroom_check = ?config.admission.headroom_check,
            "Dispatcher configured"
        );
        Ok(Self::new(engine, policy, forwarder, clock))
    }

    /// The admission engine.
    #[must_use]
    pub const fn engine(&self) -> &AdmissionEngine<S> {
        &self.engine
    }

    /// The capacity table.
    #[must_use]
    pub fn capacity(&self) -> &Arc<CapacityTable> {
        self.engine.capacity()
    }

    /// The usage ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<UsageLedger<S>> {
        self.engine.ledger()
    }

    /// The current time according to the dispatcher's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decision counters.
    #[must_use]
    pub const fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Starts the background pruner on this dispatcher's ledger and clock.
    pub fn spawn_pruner(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.ledger().spawn_pruner(Arc::clone(&self.clock), shutdown)
    }

    /// Admits and routes one request, bounding the ledger append by the
    /// configured store timeout.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` or `StoreTimeout` if the ledger cannot be read or
    /// written; no usage is recorded in that case.
    pub async fn handle(&self, request: WorkRequest) -> AdmissionResult<AdmissionDecision> {
        let deadline = self.ledger().config().store_timeout();
        self.handle_with_deadline(request, deadline).await
    }

    /// Admits and routes one request with a caller-supplied bound on the
    /// ledger append.
    ///
    /// A failed or timed-out append is retracted before the lock is
    /// released. Admission time is the clock's reading, held at the latest
    /// admission instant if the clock stepped backwards.
    ///
    /// # Errors
    ///
    /// As for [`handle`](Self::handle).
    pub async fn handle_with_deadline(
        &self,
        request: WorkRequest,
        deadline: Duration,
    ) -> AdmissionResult<AdmissionDecision> {
        let (node, handle, timestamp) = {
            let mut last_admission = self.admission_lock.lock().await;
            let now = self.clock.now().max(*last_admission);
            *last_admission = now;

            let eligible = match self.engine.eligible_for(now, request.workload).await {
                Ok(eligible) => eligible,
                Err(err) => {
                    if err.is_store_failure() {
                        DispatcherStats::bump(&self.stats.store_failures);
                    }
                    warn!(error = %err, bpm = request.workload, "Eligibility check failed");
                    return Err(err);
                }
            };

            let Some(node) = self.policy.select(&eligible) else {
                DispatcherStats::bump(&self.stats.rejected);
                info!(
                    bpm = request.workload,
                    registered = self.capacity().len(),
                    "Request rejected: all nodes at limit"
                );
                return Ok(AdmissionDecision::Rejected {
                    reason: RejectReason::AllNodesAtLimit,
                });
            };

            let event = UsageEvent::new(node.clone(), now, request.workload);
            let handle = event.handle;
            if let Err(err) = self.ledger().append_within(event, deadline).await {
                if err.is_store_failure() {
                    DispatcherStats::bump(&self.stats.store_failures);
                }
                // The write may have landed even though it failed or timed out.
                self.roll_back(handle).await;
                error!(node = %node, error = %err, "Usage append failed, request not admitted");
                return Err(err);
            }
            (node, handle, now)
        };

        let delivered = match self.forwarder.deliver(&node, &request) {
            Ok(()) => true,
            Err(err) => {
                DispatcherStats::bump(&self.stats.forward_failures);
                warn!(node = %node, error = %err, "Forwarding failed after admission");
                false
            }
        };

        DispatcherStats::bump(&self.stats.admitted);
        debug!(node = %node, handle = %handle, bpm = request.workload, delivered, "Request admitted");
        Ok(AdmissionDecision::Admitted(Admission {
            node,
            handle,
            timestamp,
            delivered,
        }))
    }

    async fn roll_back(&self, handle: EventHandle) {
        match self.ledger().retract(handle).await {
            Ok(true) => info!(handle = %handle, "Rolled back failed usage append"),
            Ok(false) => debug!(handle = %handle, "Failed usage append never landed"),
            Err(err) => error!(handle = %handle, error = %err, "Rollback of failed usage append failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{LedgerConfig, SelectionStrategy};
    use crate::error::AdmissionError;
    use crate::forwarder::RecordingForwarder;
    use crate::store::MemoryUsageStore;
    use crate::types::HeadroomCheck;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    struct Harness {
        dispatcher: Dispatcher<MemoryUsageStore>,
        clock: Arc<ManualClock>,
        forwarder: Arc<RecordingForwarder>,
    }

    fn harness(check: HeadroomCheck) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let forwarder = Arc::new(RecordingForwarder::new());
        let config = HeadroomConfig::builder()
            .headroom_check(check)
            .selection(SelectionStrategy::UniformRandom)
            .seed(1)
            .build();
        let dispatcher = Dispatcher::from_config(
            &config,
            Arc::new(CapacityTable::new()),
            MemoryUsageStore::new(config.ledger.retention()),
            forwarder.clone(),
            clock.clone(),
        )
        .unwrap();
        Harness {
            dispatcher,
            clock,
            forwarder,
        }
    }

    #[tokio::test]
    async fn test_no_nodes_rejects() {
        let h = harness(HeadroomCheck::Projected);
        let decision = h.dispatcher.handle(WorkRequest::new(1)).await.unwrap();
        assert_eq!(
            decision,
            AdmissionDecision::Rejected {
                reason: RejectReason::AllNodesAtLimit
            }
        );
        assert_eq!(h.dispatcher.stats().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_admission_records_and_forwards() {
        let h = harness(HeadroomCheck::Projected);
        h.dispatcher.capacity().register(node("a"), 5, 100).unwrap();

        let decision = h.dispatcher.handle(WorkRequest::new(30)).await.unwrap();
        let AdmissionDecision::Admitted(admission) = decision else {
            panic!("expected admission");
        };
        assert_eq!(admission.node, node("a"));
        assert_eq!(admission.timestamp, start());
        assert!(admission.delivered);

        assert_eq!(h.dispatcher.ledger().event_count(), 1);
        assert_eq!(h.forwarder.delivered(), vec![(node("a"), WorkRequest::new(30))]);
        assert_eq!(h.dispatcher.stats().snapshot().admitted, 1);
    }

    #[tokio::test]
    async fn test_rejection_writes_nothing() {
        let h = harness(HeadroomCheck::Projected);
        h.dispatcher.capacity().register(node("a"), 1, 100).unwrap();

        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_admitted());
        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_rejected());
        assert_eq!(h.dispatcher.ledger().event_count(), 1);
        assert_eq!(h.forwarder.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_returns_after_window() {
        let h = harness(HeadroomCheck::Projected);
        h.dispatcher.capacity().register(node("a"), 1, 100).unwrap();

        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_admitted());
        h.clock.advance(Duration::from_secs(59));
        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_rejected());
        h.clock.advance(Duration::from_secs(1));
        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_clock_stepping_back_cannot_reopen_capacity() {
        let h = harness(HeadroomCheck::Projected);
        h.dispatcher.capacity().register(node("a"), 1, 100).unwrap();

        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_admitted());

        // Jump forward: the first event expires and is pruned on the next insert.
        h.clock.advance(Duration::from_secs(90));
        let decision = h.dispatcher.handle(WorkRequest::new(1)).await.unwrap();
        let AdmissionDecision::Admitted(second) = decision else {
            panic!("expected admission after the window");
        };

        // Step back inside the first event's window.
        h.clock.set(start() + chrono::Duration::seconds(10));
        assert!(h.dispatcher.handle(WorkRequest::new(1)).await.unwrap().is_rejected());
        assert_eq!(second.timestamp, start() + chrono::Duration::seconds(90));
        assert_eq!(h.dispatcher.ledger().event_count(), 1);
    }

    #[tokio::test]
    async fn test_forward_failure_keeps_admission() {
        let h = harness(HeadroomCheck::Projected);
        h.dispatcher.capacity().register(node("a"), 5, 100).unwrap();
        h.forwarder.set_failing(true);

        let decision = h.dispatcher.handle(WorkRequest::new(10)).await.unwrap();
        let AdmissionDecision::Admitted(admission) = decision else {
            panic!("expected admission");
        };
        assert!(!admission.delivered);
        assert_eq!(h.dispatcher.ledger().event_count(), 1);

        let stats = h.dispatcher.stats().snapshot();
        assert_eq!(stats.admitted, 1);
        assert_eq!(stats.forward_failures, 1);
    }

    #[tokio::test]
    async fn test_projected_vs_current_check() {
        let projected = harness(HeadroomCheck::Projected);
        projected.dispatcher.capacity().register(node("a"), 10, 50).unwrap();
        assert!(projected.dispatcher.handle(WorkRequest::new(30)).await.unwrap().is_admitted());
        assert!(projected.dispatcher.handle(WorkRequest::new(30)).await.unwrap().is_rejected());

        let current = harness(HeadroomCheck::Current);
        current.dispatcher.capacity().register(node("a"), 10, 50).unwrap();
        assert!(current.dispatcher.handle(WorkRequest::new(30)).await.unwrap().is_admitted());
        assert!(current.dispatcher.handle(WorkRequest::new(30)).await.unwrap().is_admitted());
        assert!(current.dispatcher.handle(WorkRequest::new(30)).await.unwrap().is_rejected());
    }

    #[test]
    fn test_reject_reason_message() {
        assert_eq!(
            RejectReason::AllNodesAtLimit.to_string(),
            "All nodes are currently at rate limit. Retry later."
        );
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = HeadroomConfig::builder()
            .ledger(LedgerConfig::default().with_window_secs(0))
            .build();
        let result = Dispatcher::from_config(
            &config,
            Arc::new(CapacityTable::new()),
            MemoryUsageStore::default(),
            Arc::new(RecordingForwarder::new()),
            Arc::new(ManualClock::new(start())),
        );
        assert!(matches!(result, Err(AdmissionError::Config(_))));
    }
}
