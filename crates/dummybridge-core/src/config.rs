//! Configuration types for the login helper

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default deadline for a single wait on the broker
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of outstanding waits allowed per client identity
pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;

/// Portal generation performed after a successful login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalAutomation {
    /// Number of portals to generate
    pub count: usize,
    /// Members per generated portal
    pub members: usize,
}

impl Default for PortalAutomation {
    fn default() -> Self {
        Self {
            count: 0,
            members: 2,
        }
    }
}

/// Post-login automation settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub portals: PortalAutomation,
}

/// Main configuration for the login helper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind: String,
    /// Server port
    pub port: u16,
    /// Externally reachable base URL, used in login instructions
    pub public_url: String,
    /// How long a waiter blocks before giving up
    pub wait_timeout: Duration,
    /// Outstanding waits allowed per client identity
    pub max_in_flight: usize,
    /// Lifetime of cookies set through the cookie helper endpoint
    pub cookie_max_age: Duration,
    /// Post-login automation
    pub automation: AutomationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            cookie_max_age: Duration::from_secs(60 * 60),
            automation: AutomationConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: set bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set public URL (trailing slashes are dropped)
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Builder pattern: set wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Builder pattern: set the per-client admission ceiling
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Builder pattern: set cookie lifetime
    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Builder pattern: set portal automation
    pub fn with_portals(mut self, count: usize, members: usize) -> Self {
        self.automation.portals = PortalAutomation { count, members };
        self
    }

    /// Socket address string for the HTTP listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Absolute URL of one of the embedded pages
    pub fn page_url(&self, page: &str) -> String {
        format!("{}/pages/{}", self.public_url, page.trim_start_matches('/'))
    }
}
