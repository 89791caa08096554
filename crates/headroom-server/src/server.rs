//! HTTP server wrapper.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use headroom_core::{Dispatcher, UsageStore};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

/// Admission-control HTTP server.
#[derive(Debug)]
pub struct HeadroomServer<S> {
    state: Arc<AppState<S>>,
}

impl<S> Clone for HeadroomServer<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: UsageStore> HeadroomServer<S> {
    /// Create a server around a configured dispatcher.
    #[must_use]
    pub fn new(dispatcher: Dispatcher<S>) -> Self {
        Self {
            state: Arc::new(AppState::new(dispatcher)),
        }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState<S>> {
        Arc::clone(&self.state)
    }

    /// Start the server and listen for connections.
    ///
    /// Runs until the server encounters a fatal error.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve(&self, addr: SocketAddr) -> ServerResult<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server stops accepting connections when `shutdown` completes and
    /// returns once in-flight requests are done.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn serve_with_shutdown<F>(&self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;
        let local = listener.local_addr().unwrap_or(addr);

        info!(addr = %local, "Server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("Server shut down");
        Ok(())
    }

    /// Create the router without starting the server.
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state))
    }
}
