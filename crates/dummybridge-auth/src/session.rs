//! Login sessions created once credentials have been obtained
//!
//! [`SessionFactory`] is the seam the login flow finalizes through.
//! [`LoginStore`] is the in-process implementation: logins are keyed by the
//! submitted username and kept in memory, optionally mirrored to a JSON file.

use chrono::{DateTime, Utc};
use dummybridge_core::fields::{identity, LoginFields, PASSWORD_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Identity field is missing")]
    MissingIdentity,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Login not found: {0}")]
    NotFound(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Remote identity of a login, taken from the submitted username
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserLoginId(pub String);

impl std::fmt::Display for UserLoginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state reported for a login
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    #[default]
    Connecting,
    Connected,
    LoggedOut,
}

/// A logged-in session on the simulated remote network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    pub id: UserLoginId,
    /// Display name on the remote side
    pub remote_name: String,
    pub bridge_state: BridgeState,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl UserLogin {
    fn from_fields(fields: &LoginFields) -> SessionResult<Self> {
        let username = identity(fields).ok_or(SessionError::MissingIdentity)?;
        let remote_name = fields
            .get(PASSWORD_FIELD)
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| username.to_string());
        let now = Utc::now();

        Ok(Self {
            id: UserLoginId(username.to_string()),
            remote_name,
            bridge_state: BridgeState::Connecting,
            created_at: now,
            last_seen: now,
        })
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Creates or looks up logins from submitted credentials.
pub trait SessionFactory: Send + Sync + 'static {
    /// Create the login identified by `fields`, or return the existing one.
    fn create_login(
        &self,
        fields: &LoginFields,
    ) -> impl Future<Output = SessionResult<UserLogin>> + Send;

    /// Record a new bridge state for a login.
    fn set_bridge_state(
        &self,
        id: &UserLoginId,
        state: BridgeState,
    ) -> impl Future<Output = SessionResult<()>> + Send;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    logins: HashMap<String, UserLogin>,
}

/// Login store with optional file persistence
pub struct LoginStore {
    /// Backing file; `None` keeps everything in memory
    path: Option<PathBuf>,
    data: Arc<RwLock<StoredData>>,
}

impl LoginStore {
    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Arc::new(RwLock::new(StoredData::default())),
        }
    }

    /// Store at the default path (~/.config/dummybridge/logins.json)
    pub async fn new() -> SessionResult<Self> {
        let config_dir = dirs::config_dir().ok_or(SessionError::NoConfigDir)?;
        Self::with_path(config_dir.join("dummybridge").join("logins.json")).await
    }

    /// Store backed by a specific file, loading it if present.
    ///
    /// An unreadable file is kept aside as `<name>.corrupt` and the store
    /// starts empty.
    pub async fn with_path(path: PathBuf) -> SessionResult<Self> {
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StoredData>(&bytes) {
                Ok(data) => {
                    info!("Loaded {} logins from {:?}", data.logins.len(), path);
                    data
                }
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!("Unreadable login store {:?} ({}), moving to {:?}", path, e, aside);
                    tokio::fs::rename(&path, &aside).await?;
                    StoredData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                debug!("Starting empty login store at {:?}", path);
                StoredData::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Write the store through a sibling temp file so readers never see a
    /// partial document.
    async fn save(&self) -> SessionResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&*self.data.read().await)?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    pub async fn get_login(&self, id: &UserLoginId) -> Option<UserLogin> {
        let data = self.data.read().await;
        data.logins.get(&id.0).cloned()
    }

    pub async fn list_logins(&self) -> Vec<UserLogin> {
        let data = self.data.read().await;
        data.logins.values().cloned().collect()
    }

    pub async fn remove_login(&self, id: &UserLoginId) -> SessionResult<()> {
        {
            let mut data = self.data.write().await;
            if data.logins.remove(&id.0).is_none() {
                return Err(SessionError::NotFound(id.to_string()));
            }
        }
        self.save().await?;
        info!("Removed login {}", id);
        Ok(())
    }
}

impl SessionFactory for LoginStore {
    async fn create_login(&self, fields: &LoginFields) -> SessionResult<UserLogin> {
        let candidate = UserLogin::from_fields(fields)?;
        let (login, created) = {
            let mut data = self.data.write().await;
            match data.logins.entry(candidate.id.0.clone()) {
                Entry::Occupied(mut existing) => {
                    existing.get_mut().touch();
                    (existing.get().clone(), false)
                }
                Entry::Vacant(slot) => {
                    slot.insert(candidate.clone());
                    (candidate, true)
                }
            }
        };
        self.save().await?;

        if created {
            info!("Created login {}", login.id);
        } else {
            info!("Reusing existing login {}", login.id);
        }
        Ok(login)
    }

    async fn set_bridge_state(&self, id: &UserLoginId, state: BridgeState) -> SessionResult<()> {
        {
            let mut data = self.data.write().await;
            let login = data
                .logins
                .get_mut(&id.0)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            login.bridge_state = state;
            login.touch();
        }
        self.save().await?;
        debug!("Login {} is now {:?}", id, state);
        Ok(())
    }
}
