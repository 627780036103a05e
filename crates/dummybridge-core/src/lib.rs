//! dummybridge Core - Shared types for the login helper
//!
//! This crate provides the configuration, error type and payload types used
//! across all dummybridge components.

pub mod config;
pub mod error;
pub mod fields;

pub use config::{AutomationConfig, Config, PortalAutomation};
pub use error::{Error, Result};
pub use fields::LoginFields;
