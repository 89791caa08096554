//! # headroom-core
//!
//! Rolling-window admission control and node selection.
//!
//! Each backend node has two ceilings over a rolling window (60 seconds by
//! default): accepted requests (RPM) and accumulated workload (BPM). A request
//! is routed to a node only while that node is below both.
//!
//! ## Components
//!
//! - [`CapacityTable`] - per-node limits, read-mostly
//! - [`UsageLedger`] - admitted-request events over a [`UsageStore`]
//! - [`AdmissionEngine`] - eligibility from a consistent snapshot
//! - [`SelectionPolicy`] - picks one eligible node
//! - [`Dispatcher`] - eligibility, selection and append as one critical section
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use headroom_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), AdmissionError> {
//! let config = HeadroomConfig::default();
//! let capacity = Arc::new(CapacityTable::new());
//! capacity.register(NodeId::new("node-a")?, 2, 100)?;
//!
//! let dispatcher = Dispatcher::from_config(
//!     &config,
//!     capacity,
//!     MemoryUsageStore::new(config.ledger.retention()),
//!     Arc::new(LoggingForwarder),
//!     Arc::new(SystemClock),
//! )?;
//!
//! match dispatcher.handle(WorkRequest::new(30)).await? {
//!     AdmissionDecision::Admitted(admission) => println!("routed to {}", admission.node),
//!     AdmissionDecision::Rejected { reason } => println!("{reason}"),
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod capacity;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod ledger;
pub mod selection;
pub mod store;
pub mod types;

// Re-export main types
pub use admission::{AdmissionEngine, Candidate, EligibilitySet, NodeUsage};
pub use capacity::CapacityTable;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, HeadroomConfig, HeadroomConfigBuilder, LedgerConfig, SelectionStrategy};
pub use dispatcher::{Admission, AdmissionDecision, Dispatcher, DispatcherStats, RejectReason, StatsSnapshot};
pub use error::{AdmissionError, AdmissionResult};
pub use forwarder::{ForwardError, Forwarder, LoggingForwarder, RecordingForwarder};
pub use ledger::UsageLedger;
pub use selection::{policy_from_config, RoundRobin, SelectionPolicy, UniformRandom, WeightedHeadroom};
pub use store::{JournalUsageStore, MemoryUsageStore, UsageStore};
pub use types::{
    CapacityLimit, EventHandle, HeadroomCheck, NodeId, Remaining, TimeWindow, UsageEvent, WindowAggregate,
    WorkRequest,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::admission::{AdmissionEngine, EligibilitySet, NodeUsage};
    pub use crate::capacity::CapacityTable;
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::HeadroomConfig;
    pub use crate::dispatcher::{AdmissionDecision, Dispatcher, RejectReason};
    pub use crate::error::{AdmissionError, AdmissionResult};
    pub use crate::forwarder::{Forwarder, LoggingForwarder};
    pub use crate::store::{JournalUsageStore, MemoryUsageStore, UsageStore};
    pub use crate::types::{CapacityLimit, NodeId, WorkRequest};
}
