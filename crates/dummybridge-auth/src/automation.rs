//! Work performed in the background after a login completes

use crate::session::{BridgeState, SessionFactory, UserLogin};
use dummybridge_core::{AutomationConfig, PortalAutomation};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a post-login automation run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationOutcome {
    /// All portals simulated and the login reported as connected
    Completed { portals: usize },
    /// The owning login attempt was cancelled first
    Cancelled { portals: usize },
    /// The bridge state could not be recorded
    Failed { portals: usize },
}

/// Post-login automation driven by [`AutomationConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostLoginAutomation {
    portals: PortalAutomation,
}

impl PostLoginAutomation {
    pub fn new(config: AutomationConfig) -> Self {
        Self {
            portals: config.portals,
        }
    }

    /// Run the automation for `login` as a tracked task.
    pub fn spawn<F: SessionFactory>(
        self,
        factory: Arc<F>,
        login: UserLogin,
        cancel: CancellationToken,
    ) -> JoinHandle<AutomationOutcome> {
        tokio::spawn(async move { self.run(factory, login, cancel).await })
    }

    async fn run<F: SessionFactory>(
        self,
        factory: Arc<F>,
        login: UserLogin,
        cancel: CancellationToken,
    ) -> AutomationOutcome {
        info!(
            "Simulating {} portals after login for {}",
            self.portals.count, login.id
        );

        let mut simulated = 0;
        for index in 0..self.portals.count {
            if cancel.is_cancelled() {
                info!("Automation for {} cancelled after {} portals", login.id, simulated);
                return AutomationOutcome::Cancelled { portals: simulated };
            }
            debug!(
                "Simulating portal {} for {} with {} members",
                index, login.id, self.portals.members
            );
            simulated += 1;
            tokio::task::yield_now().await;
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Automation for {} cancelled before connecting", login.id);
                return AutomationOutcome::Cancelled { portals: simulated };
            }
            result = factory.set_bridge_state(&login.id, BridgeState::Connected) => result,
        };

        match connected {
            Ok(()) => {
                info!("Login {} connected", login.id);
                AutomationOutcome::Completed { portals: simulated }
            }
            Err(e) => {
                warn!("Failed to report bridge state for {}: {}", login.id, e);
                AutomationOutcome::Failed { portals: simulated }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::LoginStore;
    use dummybridge_core::LoginFields;

    async fn login_in(store: &LoginStore) -> UserLogin {
        store
            .create_login(&LoginFields::from([(
                "username".to_string(),
                "alice".to_string(),
            )]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_automation_marks_login_connected() {
        let store = Arc::new(LoginStore::in_memory());
        let login = login_in(&store).await;

        let automation = PostLoginAutomation::new(AutomationConfig {
            portals: PortalAutomation {
                count: 3,
                members: 2,
            },
        });
        let outcome = automation
            .spawn(store.clone(), login.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, AutomationOutcome::Completed { portals: 3 });
        let stored = store.get_login(&login.id).await.unwrap();
        assert_eq!(stored.bridge_state, BridgeState::Connected);
    }

    #[tokio::test]
    async fn test_cancelled_automation_leaves_state() {
        let store = Arc::new(LoginStore::in_memory());
        let login = login_in(&store).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = PostLoginAutomation::default()
            .spawn(store.clone(), login.clone(), cancel)
            .await
            .unwrap();

        assert_eq!(outcome, AutomationOutcome::Cancelled { portals: 0 });
        let stored = store.get_login(&login.id).await.unwrap();
        assert_eq!(stored.bridge_state, BridgeState::Connecting);
    }
}
