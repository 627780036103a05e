//! Shared application state

use dummybridge_auth::{BrokerConfig, RendezvousBroker};
use dummybridge_core::Config;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Credential rendezvous shared with in-process login attempts
    pub broker: Arc<RendezvousBroker>,
}

impl AppState {
    /// Create state around an existing broker
    pub fn new(config: Config, broker: Arc<RendezvousBroker>) -> Self {
        Self { config, broker }
    }

    /// Create state with a fresh broker sized from `config`
    pub fn from_config(config: Config) -> Self {
        let broker = Arc::new(RendezvousBroker::new(BrokerConfig::from(&config)));
        Self::new(config, broker)
    }
}
