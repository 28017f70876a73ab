//! Server state management.

use std::sync::Arc;

use crate::Nimbus;

use super::RateLimiter;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared state of every request handler.
#[derive(Clone)]
pub struct ServerState {
    nimbus: Nimbus,
    limiter: Arc<RateLimiter>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates the state, limiting requests at the configured per-team rate.
    pub fn new(nimbus: Nimbus) -> Self {
        let limiter = Arc::new(RateLimiter::new(*nimbus.config().get_rate_limit_per_sec()));
        Self { nimbus, limiter }
    }

    /// The service context.
    pub fn nimbus(&self) -> &Nimbus {
        &self.nimbus
    }

    /// The request rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The secret bearer tokens are signed with, if the server runs in secure mode.
    pub fn server_key(&self) -> Option<&str> {
        self.nimbus.config().get_server_key().as_deref()
    }
}
