//! Core domain types: node identifiers, limits, usage events and aggregates.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AdmissionError, AdmissionResult};

/// Maximum length of a node identifier.
pub const MAX_NODE_ID_LEN: usize = 128;

/// Opaque, validated identifier of a backend node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidNodeId` if the id is empty, too long, or
    /// contains characters other than ASCII alphanumerics, `-`, `_`, `.` and `:`.
    pub fn new(id: impl Into<String>) -> AdmissionResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(AdmissionError::InvalidNodeId("node id cannot be empty".to_string()));
        }
        if id.len() > MAX_NODE_ID_LEN {
            return Err(AdmissionError::InvalidNodeId(format!(
                "node id exceeds {MAX_NODE_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(AdmissionError::InvalidNodeId(format!(
                "node id '{id}' contains invalid characters"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = AdmissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::str::FromStr for NodeId {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Handle identifying a single recorded usage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHandle(Uuid);

impl EventHandle {
    /// Generates a fresh random handle.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the incoming request's own workload takes part in eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadroomCheck {
    /// Only the current aggregate is compared with the limits.
    Current,
    /// The aggregate plus the incoming workload must also fit the BPM limit.
    #[default]
    Projected,
}

/// Configured ceilings for one node over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimit {
    /// Maximum accepted requests per window.
    pub rpm_limit: u64,
    /// Maximum accumulated workload per window.
    pub bpm_limit: u64,
}

impl CapacityLimit {
    /// Creates a limit pair without validation.
    #[must_use]
    pub const fn new(rpm_limit: u64, bpm_limit: u64) -> Self {
        Self {
            rpm_limit,
            bpm_limit,
        }
    }

    /// Returns true if both limits are positive.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.rpm_limit > 0 && self.bpm_limit > 0
    }

    /// Returns true if the aggregate is strictly below both limits.
    ///
    /// A node exactly at a limit has no headroom.
    #[must_use]
    pub const fn has_headroom(&self, aggregate: &WindowAggregate) -> bool {
        aggregate.count < self.rpm_limit && aggregate.total_workload < self.bpm_limit
    }

    /// Returns true if a request carrying `workload` may be admitted.
    #[must_use]
    pub const fn admits(&self, aggregate: &WindowAggregate, workload: u64, check: HeadroomCheck) -> bool {
        if !self.has_headroom(aggregate) {
            return false;
        }
        match check {
            HeadroomCheck::Current => true,
            HeadroomCheck::Projected => {
                aggregate.total_workload.saturating_add(workload) <= self.bpm_limit
            }
        }
    }

    /// Remaining request and workload budget in the current window.
    #[must_use]
    pub const fn remaining(&self, aggregate: &WindowAggregate) -> Remaining {
        Remaining {
            requests: self.rpm_limit.saturating_sub(aggregate.count),
            workload: self.bpm_limit.saturating_sub(aggregate.total_workload),
        }
    }

    /// Smaller of the remaining RPM and BPM fractions, in `[0.0, 1.0]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // limits far below 2^52 in practice
    pub fn headroom_fraction(&self, aggregate: &WindowAggregate) -> f64 {
        if !self.is_valid() {
            return 0.0;
        }
        let remaining = self.remaining(aggregate);
        let rpm = remaining.requests as f64 / self.rpm_limit as f64;
        let bpm = remaining.workload as f64 / self.bpm_limit as f64;
        rpm.min(bpm)
    }
}

/// Budget left for a node in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Remaining {
    /// Requests that may still be admitted.
    pub requests: u64,
    /// Workload units that may still be admitted.
    pub workload: u64,
}

/// One admitted request, attributed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Unique handle of this event.
    pub handle: EventHandle,
    /// Node the request was routed to.
    pub node: NodeId,
    /// Admission time.
    pub timestamp: DateTime<Utc>,
    /// Workload carried by the request.
    pub workload: u64,
}

impl UsageEvent {
    /// Creates an event with a fresh handle.
    #[must_use]
    pub fn new(node: NodeId, timestamp: DateTime<Utc>, workload: u64) -> Self {
        Self {
            handle: EventHandle::new(),
            node,
            timestamp,
            workload,
        }
    }
}

/// Request count and workload sum for one node over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowAggregate {
    /// Number of events in the window.
    pub count: u64,
    /// Sum of workload over those events.
    pub total_workload: u64,
}

impl WindowAggregate {
    /// Folds one event's workload into the aggregate.
    pub fn record(&mut self, workload: u64) {
        self.count = self.count.saturating_add(1);
        self.total_workload = self.total_workload.saturating_add(workload);
    }
}

/// The interval `(start, end]` of a rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Exclusive lower bound.
    pub start: DateTime<Utc>,
    /// Inclusive upper bound.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The window of length `length` ending at `now`.
    #[must_use]
    pub fn ending_at(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: shift_back(now, length),
            end: now,
        }
    }

    /// Returns true if `timestamp` lies in `(start, end]`.
    #[must_use]
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp > self.start && timestamp <= self.end
    }
}

/// `instant - length`, saturating at the earliest representable time.
#[must_use]
pub fn shift_back(instant: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(length)
        .ok()
        .and_then(|delta| instant.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A unit of work to be routed.
///
/// On the wire the workload is the `bpm` field; a missing field means zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Workload metric carried by the request.
    #[serde(rename = "bpm", default)]
    pub workload: u64,
}

impl WorkRequest {
    /// Creates a request with the given workload.
    #[must_use]
    pub const fn new(workload: u64) -> Self {
        Self { workload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    // ==================== NodeId Tests ====================

    #[test_case("node-a" ; "hyphen")]
    #[test_case("10.0.0.1:8080" ; "address")]
    #[test_case("worker_7" ; "underscore")]
    fn test_node_id_valid(id: &str) {
        let node = NodeId::new(id).unwrap();
        assert_eq!(node.as_str(), id);
        assert_eq!(node.to_string(), id);
    }

    #[test_case("" ; "empty")]
    #[test_case("node a" ; "space")]
    #[test_case("node/a" ; "slash")]
    fn test_node_id_invalid(id: &str) {
        assert!(matches!(NodeId::new(id), Err(AdmissionError::InvalidNodeId(_))));
    }

    #[test]
    fn test_node_id_too_long() {
        let id = "n".repeat(MAX_NODE_ID_LEN + 1);
        assert!(NodeId::new(id).is_err());
        assert!(NodeId::new("n".repeat(MAX_NODE_ID_LEN)).is_ok());
    }

    #[test]
    fn test_node_id_serde_validates() {
        let node: NodeId = serde_json::from_str("\"node-b\"").unwrap();
        assert_eq!(node.as_str(), "node-b");
        assert!(serde_json::from_str::<NodeId>("\"bad id\"").is_err());
        assert_eq!(serde_json::to_string(&node).unwrap(), "\"node-b\"");
    }

    // ==================== CapacityLimit Tests ====================

    #[test_case(1 ; "rpm one")]
    #[test_case(2 ; "rpm two")]
    #[test_case(60 ; "rpm sixty")]
    fn test_rpm_boundary_is_strict(rpm_limit: u64) {
        let limit = CapacityLimit::new(rpm_limit, u64::MAX);
        let below = WindowAggregate {
            count: rpm_limit - 1,
            total_workload: 0,
        };
        let at = WindowAggregate {
            count: rpm_limit,
            total_workload: 0,
        };
        assert!(limit.has_headroom(&below));
        assert!(!limit.has_headroom(&at));
    }

    #[test]
    fn test_bpm_boundary_is_strict() {
        let limit = CapacityLimit::new(10, 100);
        let below = WindowAggregate {
            count: 1,
            total_workload: 99,
        };
        let at = WindowAggregate {
            count: 1,
            total_workload: 100,
        };
        assert!(limit.has_headroom(&below));
        assert!(!limit.has_headroom(&at));
    }

    #[test]
    fn test_admits_projected_vs_current() {
        let limit = CapacityLimit::new(10, 100);
        let agg = WindowAggregate {
            count: 3,
            total_workload: 90,
        };
        assert!(limit.admits(&agg, 30, HeadroomCheck::Current));
        assert!(!limit.admits(&agg, 30, HeadroomCheck::Projected));
        assert!(limit.admits(&agg, 10, HeadroomCheck::Projected));
    }

    #[test]
    fn test_remaining_and_fraction() {
        let limit = CapacityLimit::new(4, 200);
        let agg = WindowAggregate {
            count: 1,
            total_workload: 150,
        };
        assert_eq!(
            limit.remaining(&agg),
            Remaining {
                requests: 3,
                workload: 50
            }
        );
        assert!((limit.headroom_fraction(&agg) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remaining_saturates_when_over() {
        let limit = CapacityLimit::new(1, 10);
        let agg = WindowAggregate {
            count: 5,
            total_workload: 50,
        };
        assert_eq!(limit.remaining(&agg), Remaining::default());
        assert!(limit.headroom_fraction(&agg).abs() < f64::EPSILON);
    }

    // ==================== Window Tests ====================

    #[test]
    fn test_window_bounds() {
        let window = TimeWindow::ending_at(ts(60), Duration::from_secs(60));
        assert!(!window.contains(ts(0)));
        assert!(window.contains(ts(1)));
        assert!(window.contains(ts(60)));
        assert!(!window.contains(ts(61)));
    }

    #[test]
    fn test_aggregate_record() {
        let mut agg = WindowAggregate::default();
        agg.record(30);
        agg.record(12);
        assert_eq!(agg.count, 2);
        assert_eq!(agg.total_workload, 42);
    }

    // ==================== WorkRequest Tests ====================

    #[test]
    fn test_work_request_wire_format() {
        let req: WorkRequest = serde_json::from_str(r#"{"bpm": 30}"#).unwrap();
        assert_eq!(req.workload, 30);

        let req: WorkRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.workload, 0);

        assert!(serde_json::from_str::<WorkRequest>(r#"{"bpm": -1}"#).is_err());
        assert!(serde_json::from_str::<WorkRequest>(r#"{"bpm": "x"}"#).is_err());
    }
}
