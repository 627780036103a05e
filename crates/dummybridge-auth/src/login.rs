//! Login flow state machine
//!
//! A [`LoginAttempt`] picks one of the supported credential flows and drives
//! it to a logged-in session:
//!
//! ```text
//! Init -> AwaitingUserInput -> Submitted -> Complete
//! Init -> CodeDisplayed -> Polling -> Submitted -> Complete
//! ```
//!
//! `Cancelled` is reachable from every non-terminal state. The displayed-code
//! flow registers its pairing code with the [`RendezvousBroker`] and polls it
//! until a web page submits the credentials.

use crate::automation::{AutomationOutcome, PostLoginAutomation};
use crate::broker::{BrokerError, RendezvousBroker, WaitTicket};
use crate::pairing::PairingCode;
use crate::session::{SessionError, SessionFactory, UserLogin};
use dummybridge_core::fields::{PASSWORD_FIELD, USERNAME_FIELD};
use dummybridge_core::{Config, LoginFields};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Prefix for login step identifiers
pub const STEP_ID_PREFIX: &str = "dummybridge";

/// Attempts at finding an unused pairing code before giving up
const CODE_ATTEMPTS: usize = 3;

/// Pause before reporting a rejected re-registration, so retry loops
/// cannot spin
const ADMISSION_BACKOFF: Duration = Duration::from_secs(2);

/// Login errors
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Unknown flow ID {0:?}")]
    UnknownFlow(String),
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: LoginState,
        action: &'static str,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("Login failed: {0}")]
    LoginCreationFailed(#[source] SessionError),
}

impl LoginError {
    /// Whether the user should simply try the same step again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoginError::Broker(BrokerError::Timeout | BrokerError::AdmissionRejected)
        )
    }
}

pub type LoginResult<T> = Result<T, LoginError>;

/// Supported credential acquisition flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    /// Username and password typed directly
    Password,
    /// Values extracted from cookies set by a web page
    Cookies,
    /// Values extracted from a web page's local storage
    LocalStorage,
    /// A pairing code is displayed and a web page submits the credentials
    DisplayAndWait,
}

impl FlowKind {
    pub const ALL: [FlowKind; 4] = [
        FlowKind::Password,
        FlowKind::Cookies,
        FlowKind::LocalStorage,
        FlowKind::DisplayAndWait,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            FlowKind::Password => "password",
            FlowKind::Cookies => "cookies",
            FlowKind::LocalStorage => "localstorage",
            FlowKind::DisplayAndWait => "displayandwait",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowKind::Password => "Password",
            FlowKind::Cookies => "Cookies",
            FlowKind::LocalStorage => "Local storage",
            FlowKind::DisplayAndWait => "Display and wait",
        }
    }

    fn step_id(&self) -> String {
        format!("{}.{}", STEP_ID_PREFIX, self.id())
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FlowKind {
    type Err = LoginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlowKind::ALL
            .into_iter()
            .find(|flow| flow.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LoginError::UnknownFlow(s.to_string()))
    }
}

/// Flow listing entry
#[derive(Debug, Clone, Serialize)]
pub struct FlowInfo {
    pub id: &'static str,
    pub name: &'static str,
}

/// All flows a login can be started with
pub fn available_flows() -> Vec<FlowInfo> {
    FlowKind::ALL
        .iter()
        .map(|flow| FlowInfo {
            id: flow.id(),
            name: flow.name(),
        })
        .collect()
}

/// Login attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    Init,
    AwaitingUserInput,
    CodeDisplayed,
    Polling,
    Submitted,
    Complete,
    Cancelled,
}

impl LoginState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::Complete | LoginState::Cancelled)
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginState::Init => "not started",
            LoginState::AwaitingUserInput => "awaiting user input",
            LoginState::CodeDisplayed => "displaying a code",
            LoginState::Polling => "polling",
            LoginState::Submitted => "submitted",
            LoginState::Complete => "complete",
            LoginState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFieldKind {
    Username,
    Password,
}

/// A field the user is asked to fill in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub id: String,
    pub kind: InputFieldKind,
    pub name: String,
}

/// Where a cookie-flow value is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CookieSource {
    Cookie { name: String, domain: String },
    LocalStorage { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieField {
    pub id: String,
    pub required: bool,
    pub source: CookieSource,
}

/// What the client should do next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginStep {
    UserInput {
        step_id: String,
        fields: Vec<InputField>,
    },
    Cookies {
        step_id: String,
        url: String,
        fields: Vec<CookieField>,
    },
    DisplayAndWait {
        step_id: String,
        instructions: String,
        code: String,
    },
    Complete {
        step_id: String,
        instructions: String,
        login: UserLogin,
    },
}

/// Host part of a URL, for cookie domains. Input that is not an absolute
/// URL is taken to be a bare host.
fn url_host(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// One user-facing login session.
pub struct LoginAttempt<F: SessionFactory> {
    broker: Arc<RendezvousBroker>,
    factory: Arc<F>,
    config: Config,
    client: String,
    flow: Option<FlowKind>,
    code: Option<PairingCode>,
    ticket: Option<WaitTicket>,
    state: LoginState,
    transitions: Vec<LoginState>,
    cancel: CancellationToken,
    automation: Option<JoinHandle<AutomationOutcome>>,
}

impl<F: SessionFactory> LoginAttempt<F> {
    /// Create an attempt on behalf of `client` (used for broker admission)
    pub fn new(
        broker: Arc<RendezvousBroker>,
        factory: Arc<F>,
        config: Config,
        client: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            factory,
            config,
            client: client.into(),
            flow: None,
            code: None,
            ticket: None,
            state: LoginState::Init,
            transitions: vec![LoginState::Init],
            cancel: CancellationToken::new(),
            automation: None,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn flow(&self) -> Option<FlowKind> {
        self.flow
    }

    /// Pairing code currently displayed, if any
    pub fn pairing_code(&self) -> Option<&PairingCode> {
        self.code.as_ref()
    }

    /// Every state entered so far, in order
    pub fn transitions(&self) -> &[LoginState] {
        &self.transitions
    }

    /// Token cancelled when this attempt is cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand over the post-login automation task, once started
    pub fn take_automation(&mut self) -> Option<JoinHandle<AutomationOutcome>> {
        self.automation.take()
    }

    fn transition(&mut self, to: LoginState) {
        debug!("Login attempt for {}: {:?} -> {:?}", self.client, self.state, to);
        self.state = to;
        self.transitions.push(to);
    }

    fn require(&self, allowed: &[LoginState], action: &'static str) -> LoginResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(LoginError::InvalidTransition {
                state: self.state,
                action,
            })
        }
    }

    fn release_code(&mut self) {
        if let Some(mut ticket) = self.ticket.take() {
            ticket.release();
        }
        self.code = None;
    }

    /// Select a flow and return the first step.
    ///
    /// Selecting the displayed-code flow again always issues a fresh code.
    pub fn start(&mut self, flow: FlowKind) -> LoginResult<LoginStep> {
        self.require(
            &[
                LoginState::Init,
                LoginState::AwaitingUserInput,
                LoginState::CodeDisplayed,
            ],
            "select a flow",
        )?;
        self.release_code();
        self.flow = Some(flow);

        let step = match flow {
            FlowKind::Password => LoginStep::UserInput {
                step_id: flow.step_id(),
                fields: vec![
                    InputField {
                        id: USERNAME_FIELD.to_string(),
                        kind: InputFieldKind::Username,
                        name: "username, anything goes and it's used as the ID".to_string(),
                    },
                    InputField {
                        id: PASSWORD_FIELD.to_string(),
                        kind: InputFieldKind::Password,
                        name: "password, anything goes".to_string(),
                    },
                ],
            },
            FlowKind::Cookies => {
                let domain = url_host(&self.config.public_url);
                LoginStep::Cookies {
                    step_id: flow.step_id(),
                    url: self.config.page_url("cookies.html"),
                    fields: [USERNAME_FIELD, PASSWORD_FIELD]
                        .into_iter()
                        .map(|id| CookieField {
                            id: id.to_string(),
                            required: true,
                            source: CookieSource::Cookie {
                                name: id.to_string(),
                                domain: domain.clone(),
                            },
                        })
                        .collect(),
                }
            }
            FlowKind::LocalStorage => LoginStep::Cookies {
                step_id: flow.step_id(),
                url: self.config.page_url("localstorage.html"),
                fields: [USERNAME_FIELD, PASSWORD_FIELD]
                    .into_iter()
                    .map(|id| CookieField {
                        id: id.to_string(),
                        required: true,
                        source: CookieSource::LocalStorage { key: id.to_string() },
                    })
                    .collect(),
            },
            FlowKind::DisplayAndWait => {
                let (code, ticket) = match self.register_code() {
                    Ok(registered) => registered,
                    Err(e) => {
                        if self.state != LoginState::Init {
                            self.transition(LoginState::Init);
                        }
                        return Err(e);
                    }
                };
                let step = LoginStep::DisplayAndWait {
                    step_id: flow.step_id(),
                    instructions: format!(
                        "Enter the code on {}",
                        self.config.page_url("daw_submit.html")
                    ),
                    code: code.to_string(),
                };
                info!("Displaying pairing code for {}", self.client);
                self.code = Some(code);
                self.ticket = Some(ticket);
                self.transition(LoginState::CodeDisplayed);
                return Ok(step);
            }
        };

        self.transition(LoginState::AwaitingUserInput);
        Ok(step)
    }

    fn register_code(&self) -> LoginResult<(PairingCode, WaitTicket)> {
        let mut last = BrokerError::AlreadyWaiting;
        for _ in 0..CODE_ATTEMPTS {
            let code = PairingCode::generate();
            match self.broker.register(&self.client, code.as_str()) {
                Ok(ticket) => return Ok((code, ticket)),
                Err(BrokerError::AlreadyWaiting) => continue,
                Err(e) => {
                    last = e;
                    break;
                }
            }
        }
        Err(last.into())
    }

    /// Submit fields for the direct-input flow.
    ///
    /// Any non-empty username is accepted.
    pub async fn submit_user_input(&mut self, fields: LoginFields) -> LoginResult<LoginStep> {
        self.require(&[LoginState::AwaitingUserInput], "submit input")?;
        self.transition(LoginState::Submitted);
        self.finalize(fields).await
    }

    /// Submit values extracted by the cookie and local storage flows
    pub async fn submit_cookies(&mut self, fields: LoginFields) -> LoginResult<LoginStep> {
        self.submit_user_input(fields).await
    }

    /// Poll the broker once for the displayed code.
    ///
    /// On timeout the attempt goes back to `CodeDisplayed` and the caller
    /// should poll again; the code stays valid.
    pub async fn wait(&mut self) -> LoginResult<LoginStep> {
        // Polling is accepted too: a previous poll may have been dropped
        // mid-wait, which already released its registration.
        self.require(
            &[LoginState::CodeDisplayed, LoginState::Polling],
            "wait for a submission",
        )?;
        let Some(code) = self.code.clone() else {
            return Err(LoginError::InvalidTransition {
                state: self.state,
                action: "wait without a code",
            });
        };

        let ticket = match self.ticket.take() {
            Some(ticket) => ticket,
            None => match self.broker.register(&self.client, code.as_str()) {
                Ok(ticket) => ticket,
                Err(BrokerError::AdmissionRejected) => {
                    debug!(
                        "Too many waits in flight for {}, backing off {:?}",
                        self.client, ADMISSION_BACKOFF
                    );
                    tokio::time::sleep(ADMISSION_BACKOFF).await;
                    return Err(BrokerError::AdmissionRejected.into());
                }
                Err(e) => return Err(e.into()),
            },
        };

        self.transition(LoginState::Polling);
        match ticket.wait(self.config.wait_timeout).await {
            Ok(fields) => {
                self.code = None;
                self.transition(LoginState::Submitted);
                self.finalize(fields).await
            }
            Err(e) => {
                debug!("Poll for {} ended: {}", self.client, e);
                self.transition(LoginState::CodeDisplayed);
                Err(e.into())
            }
        }
    }

    async fn finalize(&mut self, fields: LoginFields) -> LoginResult<LoginStep> {
        match self.factory.create_login(&fields).await {
            Ok(login) => {
                let automation = PostLoginAutomation::new(self.config.automation);
                self.automation = Some(automation.spawn(
                    Arc::clone(&self.factory),
                    login.clone(),
                    self.cancel.child_token(),
                ));
                self.transition(LoginState::Complete);
                info!("Login {} complete", login.id);
                Ok(LoginStep::Complete {
                    step_id: format!("{}.complete", STEP_ID_PREFIX),
                    instructions: "Successfully logged in with whatever you provided".to_string(),
                    login,
                })
            }
            Err(e) => {
                warn!("Failed to create login for {}: {}", self.client, e);
                self.cancel.cancel();
                self.transition(LoginState::Cancelled);
                Err(LoginError::LoginCreationFailed(e))
            }
        }
    }

    /// Abandon the attempt, releasing any broker registration.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.release_code();
        self.cancel.cancel();
        self.transition(LoginState::Cancelled);
        info!("Login attempt for {} cancelled", self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::session::{BridgeState, LoginStore, SessionResult, UserLoginId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const CLIENT: &str = "192.0.2.10";

    fn fields(username: &str, password: &str) -> LoginFields {
        LoginFields::from([
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ])
    }

    fn setup() -> (Arc<RendezvousBroker>, Arc<LoginStore>) {
        (
            Arc::new(RendezvousBroker::new(BrokerConfig::default())),
            Arc::new(LoginStore::in_memory()),
        )
    }

    fn attempt<F: SessionFactory>(
        broker: &Arc<RendezvousBroker>,
        factory: &Arc<F>,
    ) -> LoginAttempt<F> {
        LoginAttempt::new(
            Arc::clone(broker),
            Arc::clone(factory),
            Config::new().with_public_url("https://helper.test:8443"),
            CLIENT,
        )
    }

    /// Records every call and fails on demand
    #[derive(Default)]
    struct RecordingFactory {
        calls: Mutex<Vec<LoginFields>>,
        fail: bool,
        states: AtomicUsize,
    }

    impl SessionFactory for RecordingFactory {
        async fn create_login(&self, fields: &LoginFields) -> SessionResult<UserLogin> {
            self.calls.lock().unwrap().push(fields.clone());
            if self.fail {
                return Err(SessionError::NoConfigDir);
            }
            LoginStore::in_memory().create_login(fields).await
        }

        async fn set_bridge_state(&self, _id: &UserLoginId, _state: BridgeState) -> SessionResult<()> {
            self.states.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_flow_ids() {
        for flow in FlowKind::ALL {
            assert_eq!(flow.id().parse::<FlowKind>().unwrap(), flow);
        }
        assert_eq!(" LocalStorage ".parse::<FlowKind>().unwrap(), FlowKind::LocalStorage);
        assert!(matches!(
            "qr".parse::<FlowKind>(),
            Err(LoginError::UnknownFlow(_))
        ));
        assert_eq!(available_flows().len(), 4);
    }

    #[test]
    fn test_url_host() {
        assert_eq!(url_host("https://helper.test:8443/dummy"), "helper.test");
        assert_eq!(url_host("http://user@localhost"), "localhost");
        assert_eq!(url_host("example.org"), "example.org");
        assert_eq!(url_host("http://[::1]:8080/"), "[::1]");
    }

    #[tokio::test]
    async fn test_cookie_domain_for_ipv6_public_url() {
        let (broker, store) = setup();
        let config = Config::new().with_public_url("http://[::1]:8080");
        let mut login = LoginAttempt::new(broker, store, config, CLIENT);

        let LoginStep::Cookies { fields, .. } = login.start(FlowKind::Cookies).unwrap() else {
            panic!("expected cookie step");
        };
        for field in fields {
            assert_eq!(
                field.source,
                CookieSource::Cookie {
                    name: field.id.clone(),
                    domain: "[::1]".to_string(),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_password_flow() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        let step = login.start(FlowKind::Password).unwrap();
        assert!(matches!(step, LoginStep::UserInput { ref fields, .. } if fields.len() == 2));
        assert_eq!(login.state(), LoginState::AwaitingUserInput);

        let step = login.submit_user_input(fields("alice", "p1")).await.unwrap();
        let LoginStep::Complete { login: user_login, .. } = step else {
            panic!("expected completion, got {step:?}");
        };
        assert_eq!(user_login.id.0, "alice");
        assert_eq!(
            login.transitions(),
            &[
                LoginState::Init,
                LoginState::AwaitingUserInput,
                LoginState::Submitted,
                LoginState::Complete
            ]
        );

        let outcome = login.take_automation().unwrap().await.unwrap();
        assert_eq!(outcome, AutomationOutcome::Completed { portals: 0 });
        let stored = store.get_login(&user_login.id).await.unwrap();
        assert_eq!(stored.bridge_state, BridgeState::Connected);
    }

    #[tokio::test]
    async fn test_cookie_flows_describe_sources() {
        let (broker, store) = setup();

        let mut login = attempt(&broker, &store);
        let step = login.start(FlowKind::Cookies).unwrap();
        let LoginStep::Cookies { url, fields: sources, .. } = step else {
            panic!("expected cookies step");
        };
        assert_eq!(url, "https://helper.test:8443/pages/cookies.html");
        assert_eq!(
            sources[0].source,
            CookieSource::Cookie {
                name: "username".to_string(),
                domain: "helper.test".to_string()
            }
        );

        let mut login = attempt(&broker, &store);
        let step = login.start(FlowKind::LocalStorage).unwrap();
        let LoginStep::Cookies { fields: sources, .. } = step else {
            panic!("expected cookies step");
        };
        assert_eq!(
            sources[1].source,
            CookieSource::LocalStorage {
                key: "password".to_string()
            }
        );

        let step = login.submit_cookies(fields("dave", "p4")).await.unwrap();
        assert!(matches!(step, LoginStep::Complete { .. }));
    }

    #[tokio::test]
    async fn test_display_and_wait_end_to_end() {
        let broker = Arc::new(RendezvousBroker::new(BrokerConfig::default()));
        let factory = Arc::new(RecordingFactory::default());
        let mut login = attempt(&broker, &factory);

        let step = login.start(FlowKind::DisplayAndWait).unwrap();
        let LoginStep::DisplayAndWait { code, instructions, .. } = step else {
            panic!("expected display and wait step");
        };
        assert!(instructions.ends_with("/pages/daw_submit.html"));
        assert_eq!(login.pairing_code().unwrap().as_str(), code);
        assert!(broker.is_waiting(&code));

        let waiter = tokio::spawn(async move {
            let step = login.wait().await;
            (login, step)
        });

        // The page posts the credentials tagged with the displayed code
        broker.submit(&code, fields("alice", "p1")).unwrap();

        let (mut login, step) = waiter.await.unwrap();
        assert!(matches!(step, Ok(LoginStep::Complete { .. })));
        assert_eq!(
            login.transitions(),
            &[
                LoginState::Init,
                LoginState::CodeDisplayed,
                LoginState::Polling,
                LoginState::Submitted,
                LoginState::Complete
            ]
        );
        assert_eq!(*factory.calls.lock().unwrap(), vec![fields("alice", "p1")]);
        assert_eq!(broker.in_flight(CLIENT), 0);

        login.take_automation().unwrap().await.unwrap();
        assert_eq!(factory.states.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_and_wait_timeout() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        login.start(FlowKind::DisplayAndWait).unwrap();
        let code = login.pairing_code().unwrap().clone();

        let started = tokio::time::Instant::now();
        let result = login.wait().await;
        assert!(matches!(result, Err(LoginError::Broker(BrokerError::Timeout))));
        assert!(result.unwrap_err().is_retryable());
        assert!(started.elapsed() >= Duration::from_secs(30));

        assert_eq!(login.state(), LoginState::CodeDisplayed);
        assert_eq!(broker.in_flight(CLIENT), 0);
        assert!(!broker.is_waiting(code.as_str()));

        // Polling again re-registers the same code
        let retry = tokio::spawn(async move {
            let result = login.wait().await;
            (login, result)
        });
        while broker.submit(code.as_str(), fields("bob", "p2")).is_err() {
            tokio::task::yield_now().await;
        }
        let (login, result) = retry.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(login.state(), LoginState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_repoll_backs_off() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        login.start(FlowKind::DisplayAndWait).unwrap();
        assert!(login.wait().await.unwrap_err().is_retryable());

        let _held: Vec<_> = (0..5)
            .map(|i| broker.register(CLIENT, &format!("held-{i}")).unwrap())
            .collect();

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            let err = login.wait().await.unwrap_err();
            assert!(matches!(err, LoginError::Broker(BrokerError::AdmissionRejected)));
            assert_eq!(login.state(), LoginState::CodeDisplayed);
        }
        assert!(started.elapsed() >= ADMISSION_BACKOFF * 3);
        assert_eq!(broker.in_flight(CLIENT), 5);
    }

    #[tokio::test]
    async fn test_reselecting_code_flow_regenerates() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        login.start(FlowKind::DisplayAndWait).unwrap();
        let first = login.pairing_code().unwrap().clone();
        login.start(FlowKind::DisplayAndWait).unwrap();
        let second = login.pairing_code().unwrap().clone();

        assert_ne!(first, second);
        assert!(!broker.is_waiting(first.as_str()));
        assert!(broker.is_waiting(second.as_str()));
        assert_eq!(broker.in_flight(CLIENT), 1);
    }

    #[tokio::test]
    async fn test_admission_rejection_surfaces() {
        let (broker, store) = setup();
        let _held: Vec<_> = (0..5)
            .map(|i| broker.register(CLIENT, &format!("held-{i}")).unwrap())
            .collect();

        let mut login = attempt(&broker, &store);
        let err = login.start(FlowKind::DisplayAndWait).unwrap_err();
        assert!(matches!(err, LoginError::Broker(BrokerError::AdmissionRejected)));
        assert!(err.is_retryable());
        assert_eq!(login.state(), LoginState::Init);
        assert!(login.pairing_code().is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_registration() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);
        let token = login.cancellation_token();

        login.start(FlowKind::DisplayAndWait).unwrap();
        assert_eq!(broker.in_flight(CLIENT), 1);

        login.cancel();
        assert_eq!(login.state(), LoginState::Cancelled);
        assert_eq!(broker.in_flight(CLIENT), 0);
        assert!(token.is_cancelled());

        // Terminal: no further transitions
        assert!(matches!(
            login.start(FlowKind::Password),
            Err(LoginError::InvalidTransition { .. })
        ));
        login.cancel();
        assert_eq!(login.transitions().last(), Some(&LoginState::Cancelled));
        assert_eq!(
            login
                .transitions()
                .iter()
                .filter(|s| **s == LoginState::Cancelled)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_login_creation_failure_cancels() {
        let broker = Arc::new(RendezvousBroker::new(BrokerConfig::default()));
        let factory = Arc::new(RecordingFactory {
            fail: true,
            ..Default::default()
        });
        let mut login = attempt(&broker, &factory);

        login.start(FlowKind::Password).unwrap();
        let err = login
            .submit_user_input(fields("alice", "p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::LoginCreationFailed(_)));
        assert!(!err.is_retryable());
        assert_eq!(login.state(), LoginState::Cancelled);
        assert!(login.take_automation().is_none());
    }

    #[tokio::test]
    async fn test_missing_username_fails_login() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        login.start(FlowKind::Password).unwrap();
        let err = login
            .submit_user_input(LoginFields::from([(
                "password".to_string(),
                "p1".to_string(),
            )]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoginError::LoginCreationFailed(SessionError::MissingIdentity)
        ));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (broker, store) = setup();
        let mut login = attempt(&broker, &store);

        assert!(matches!(
            login.wait().await,
            Err(LoginError::InvalidTransition { .. })
        ));
        assert!(matches!(
            login.submit_user_input(fields("alice", "p1")).await,
            Err(LoginError::InvalidTransition { .. })
        ));

        login.start(FlowKind::Password).unwrap();
        assert!(matches!(
            login.wait().await,
            Err(LoginError::InvalidTransition { .. })
        ));
        assert_eq!(login.state(), LoginState::AwaitingUserInput);
    }
}
