//! dummybridge Auth - Credential acquisition for the test bridge
//!
//! Provides pairing codes, the credential rendezvous broker and the login
//! flow state machine that consumes it.
//!
//! # Display-and-wait flow
//!
//! 1. `LoginAttempt::start(FlowKind::DisplayAndWait)` generates a pairing code
//!    and registers it with the `RendezvousBroker`
//! 2. The code is shown to the user, who enters it with their credentials on
//!    the submit page
//! 3. The page posts the fields to `POST /submit/{code}`, which calls
//!    `RendezvousBroker::submit`
//! 4. `LoginAttempt::wait` wakes with the fields and finalizes the login
//!    through the `SessionFactory`
//!
//! # Example
//!
//! ```no_run
//! use dummybridge_auth::{BrokerConfig, FlowKind, LoginAttempt, LoginStore, RendezvousBroker};
//! use dummybridge_core::Config;
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let config = Config::default();
//!     let broker = Arc::new(RendezvousBroker::new(BrokerConfig::from(&config)));
//!     let store = Arc::new(LoginStore::in_memory());
//!
//!     let mut attempt = LoginAttempt::new(broker, store, config, "127.0.0.1");
//!     let step = attempt.start(FlowKind::DisplayAndWait).unwrap();
//!     println!("{:?}", step);
//!
//!     // Blocks for up to 30 seconds; retry on timeout
//!     while let Err(e) = attempt.wait().await {
//!         if !e.is_retryable() {
//!             break;
//!         }
//!     }
//! }
//! ```

pub mod automation;
pub mod broker;
pub mod login;
pub mod pairing;
pub mod session;

pub use automation::{AutomationOutcome, PostLoginAutomation};
pub use broker::{
    BrokerConfig, BrokerError, BrokerResult, DeliverySlot, RendezvousBroker, WaitTicket,
};
pub use login::{
    available_flows, CookieField, CookieSource, FlowInfo, FlowKind, InputField, InputFieldKind,
    LoginAttempt, LoginError, LoginResult, LoginState, LoginStep,
};
pub use pairing::{correlation_id, InvalidPairingCode, PairingCode};
pub use session::{
    BridgeState, LoginStore, SessionError, SessionFactory, SessionResult, UserLogin, UserLoginId,
};
