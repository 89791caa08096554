//! Shared state for the HTTP server.

use std::time::Instant;

use headroom_core::{Dispatcher, UsageStore};

/// State shared by all request handlers.
#[derive(Debug)]
pub struct AppState<S> {
    dispatcher: Dispatcher<S>,
    start_time: Instant,
}

impl<S: UsageStore> AppState<S> {
    /// Wraps a dispatcher built at startup.
    #[must_use]
    pub fn new(dispatcher: Dispatcher<S>) -> Self {
        Self {
            dispatcher,
            start_time: Instant::now(),
        }
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
