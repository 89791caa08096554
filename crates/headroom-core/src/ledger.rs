//! Rolling-window usage ledger.
//!
//! The ledger records one [`UsageEvent`] per admitted request and answers
//! window aggregates over `(now - window, now]`. Every call into the backing
//! [`UsageStore`] is bounded by the configured store timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{AdmissionError, AdmissionResult};
use crate::store::UsageStore;
use crate::types::{shift_back, EventHandle, NodeId, TimeWindow, UsageEvent, WindowAggregate};

/// Runs a store call under `limit`, mapping expiry to `StoreTimeout`.
async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = AdmissionResult<T>>,
) -> AdmissionResult<T> {
    if let Ok(result) = tokio::time::timeout(limit, call).await {
        result
    } else {
        warn!(operation, timeout_ms = limit.as_millis(), "Usage store call timed out");
        Err(AdmissionError::StoreTimeout {
            operation,
            timeout: limit,
        })
    }
}

/// Append-only log of admitted requests, queryable by rolling window.
#[derive(Debug)]
pub struct UsageLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S: UsageStore> UsageLedger<S> {
    /// Creates a ledger over `store`.
    #[must_use]
    pub const fn new(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The ledger configuration.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The window ending at `now`.
    #[must_use]
    pub fn window_at(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::ending_at(now, self.config.window())
    }

    /// Records an event.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store rejects the write, `StoreTimeout` if it
    /// does not answer in time. After a timeout the outcome is unknown; the
    /// caller decides whether to retract the handle.
    pub async fn append(&self, event: UsageEvent) -> AdmissionResult<EventHandle> {
        self.append_within(event, self.config.store_timeout()).await
    }

    /// Records an event with an explicit bound instead of the configured one.
    ///
    /// # Errors
    ///
    /// As for [`append`](Self::append).
    pub async fn append_within(&self, event: UsageEvent, limit: Duration) -> AdmissionResult<EventHandle> {
        let handle = event.handle;
        let node = event.node.clone();
        bounded("insert", limit, self.store.insert(event)).await?;
        debug!(node = %node, handle = %handle, "Usage event appended");
        Ok(handle)
    }

    /// Count and workload sum for `node` over the window ending at `now`.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced, never read as zero usage.
    pub async fn window_aggregate(&self, node: &NodeId, now: DateTime<Utc>) -> AdmissionResult<WindowAggregate> {
        let window = self.window_at(now);
        bounded("aggregate", self.config.store_timeout(), self.store.aggregate(node, window)).await
    }

    /// Aggregates for several nodes from one store snapshot, index-aligned
    /// with `nodes`.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced, never read as zero usage.
    pub async fn aggregate_many(&self, nodes: &[NodeId], now: DateTime<Utc>) -> AdmissionResult<Vec<WindowAggregate>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let window = self.window_at(now);
        let aggregates = bounded(
            "aggregate_many",
            self.config.store_timeout(),
            self.store.aggregate_many(nodes, window),
        )
        .await?;
        if aggregates.len() != nodes.len() {
            return Err(AdmissionError::StoreUnavailable(format!(
                "store returned {} aggregates for {} nodes",
                aggregates.len(),
                nodes.len()
            )));
        }
        Ok(aggregates)
    }

    /// Removes one event. Used only to undo an append whose outcome is unknown.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced.
    pub async fn retract(&self, handle: EventHandle) -> AdmissionResult<bool> {
        bounded("retract", self.config.store_timeout(), self.store.retract(handle)).await
    }

    /// Discards events that fell out of the retention horizon at `now`.
    ///
    /// # Errors
    ///
    /// Store failures are surfaced.
    pub async fn prune(&self, now: DateTime<Utc>) -> AdmissionResult<usize> {
        let cutoff = shift_back(now, self.config.retention());
        bounded("prune", self.config.store_timeout(), self.store.prune_before(cutoff)).await
    }

    /// Number of stored events, including ones outside the current window.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.store.len()
    }

    /// Spawns a background task pruning every `prune_interval` until
    /// `shutdown` flips to true or its sender is dropped.
    pub fn spawn_pruner(self: &Arc<Self>, clock: Arc<dyn Clock>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        let period = ledger.config.prune_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Usage pruner started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match ledger.prune(clock.now()).await {
                            Ok(0) => {}
                            Ok(pruned) => debug!(pruned, remaining = ledger.event_count(), "Pruned usage events"),
                            Err(err) => warn!(error = %err, "Usage prune failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Usage pruner stopped");
        })
    }
}
