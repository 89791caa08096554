//! Server configuration.
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! bind_addr = "0.0.0.0:8080"
//! journal_path = "/var/lib/headroom/usage.jsonl"
//!
//! [ledger]
//! window_secs = 60
//! store_timeout_ms = 2000
//!
//! [admission]
//! selection = "uniform_random"
//!
//! [[nodes]]
//! id = "A"
//! rpm_limit = 2
//! bpm_limit = 100
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use headroom_core::{AdmissionConfig, HeadroomConfig, LedgerConfig, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Default listen address, matching the historical deployment.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// One backend node and its limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identifier.
    pub id: NodeId,
    /// Requests per window.
    pub rpm_limit: u64,
    /// Workload per window.
    pub bpm_limit: u64,
}

impl NodeSpec {
    /// Creates a node spec.
    #[must_use]
    pub const fn new(id: NodeId, rpm_limit: u64, bpm_limit: u64) -> Self {
        Self {
            id,
            rpm_limit,
            bpm_limit,
        }
    }
}

/// Parses `ID=RPM,BPM`, as accepted by `--node`.
impl FromStr for NodeSpec {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ServerError::Config(format!("invalid node '{s}', expected ID=RPM,BPM"));

        let (id, limits) = s.split_once('=').ok_or_else(invalid)?;
        let (rpm, bpm) = limits.split_once(',').ok_or_else(invalid)?;
        let id = NodeId::new(id.trim()).map_err(|e| ServerError::Config(e.to_string()))?;
        let rpm_limit = rpm.trim().parse().map_err(|_| invalid())?;
        let bpm_limit = bpm.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(id, rpm_limit, bpm_limit))
    }
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// Usage journal; usage is kept in memory only when unset.
    pub journal_path: Option<PathBuf>,
    /// Ledger settings.
    pub ledger: LedgerConfig,
    /// Admission settings.
    pub admission: AdmissionConfig,
    /// Nodes registered at startup.
    pub nodes: Vec<NodeSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            journal_path: None,
            ledger: LedgerConfig::default(),
            admission: AdmissionConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ServerError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Add a node.
    #[must_use]
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Persist usage to a journal file.
    #[must_use]
    pub fn with_journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Core admission-control configuration.
    #[must_use]
    pub fn headroom(&self) -> HeadroomConfig {
        HeadroomConfig {
            ledger: self.ledger.clone(),
            admission: self.admission.clone(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid ledger settings, zero limits or duplicate
    /// node ids.
    pub fn validate(&self) -> ServerResult<()> {
        self.headroom().validate()?;

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.rpm_limit == 0 || node.bpm_limit == 0 {
                return Err(ServerError::Config(format!(
                    "node {} must have rpm_limit and bpm_limit > 0",
                    node.id
                )));
            }
            if !seen.insert(&node.id) {
                return Err(ServerError::Config(format!("node {} is listed twice", node.id)));
            }
        }
        Ok(())
    }
}
