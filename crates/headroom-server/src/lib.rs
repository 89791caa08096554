//! # headroom-server
//!
//! HTTP front end for Headroom admission control.
//!
//! ## Endpoints
//!
//! - `POST /request` - admit and route `{"bpm": N}`; 429 when every node is at its limit
//! - `GET /health` - liveness and uptime
//! - `GET /nodes`, `GET /nodes/{id}` - per-node usage and headroom
//! - `GET /stats` - decision counters

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use config::{NodeSpec, ServerConfig, DEFAULT_BIND_ADDR};
pub use error::{ServerError, ServerResult};
pub use routes::create_router;
pub use server::HeadroomServer;
pub use state::AppState;
