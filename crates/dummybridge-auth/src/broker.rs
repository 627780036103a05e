//! Credential rendezvous between a waiting login flow and a submitting page
//!
//! A login flow registers a correlation ID (usually a pairing code) and
//! blocks until a web page submits fields tagged with the same ID, or until
//! the deadline passes. Each registration accepts exactly one submission.
//!
//! Registrations are held through a [`WaitTicket`]. The ticket releases its
//! registry entry and the client's admission slot when it is waited on,
//! released explicitly, or dropped, so every exit path frees resources.

use dummybridge_core::{Config, LoginFields};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Broker errors. Display texts are shown to users as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Too many in-flight requests")]
    AdmissionRejected,
    #[error("Request already being waited on")]
    AlreadyWaiting,
    #[error("Wait timeout")]
    Timeout,
    #[error("Request not found")]
    NotFound,
    #[error("Wait cancelled")]
    Cancelled,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Outstanding registrations allowed per client identity
    pub max_in_flight: usize,
    /// Deadline applied by [`RendezvousBroker::wait_for`]
    pub wait_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            wait_timeout: config.wait_timeout,
        }
    }
}

/// Single-use delivery slot.
///
/// The sender is taken on the first delivery attempt, so the slot can be
/// resolved at most once regardless of how many callers race on it.
#[derive(Debug)]
pub struct DeliverySlot {
    sender: Mutex<Option<oneshot::Sender<LoginFields>>>,
}

impl DeliverySlot {
    pub fn new() -> (Self, oneshot::Receiver<LoginFields>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            sender: Mutex::new(Some(tx)),
        };
        (slot, rx)
    }

    /// Hand `fields` to the receiver. Returns `false` if the slot was already
    /// resolved or the receiver is gone.
    pub fn deliver(&self, fields: LoginFields) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(fields).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug)]
struct Registration {
    client: String,
    seq: u64,
    slot: DeliverySlot,
}

#[derive(Debug, Default)]
struct Registry {
    waiters: HashMap<String, Registration>,
    in_flight: HashMap<String, usize>,
    next_seq: u64,
}

impl Registry {
    fn remove_if(&mut self, id: &str, owned: impl FnOnce(&Registration) -> bool) -> bool {
        if !self.waiters.get(id).is_some_and(owned) {
            return false;
        }
        if let Some(registration) = self.waiters.remove(id) {
            if let Entry::Occupied(mut count) = self.in_flight.entry(registration.client) {
                let remaining = count.get().saturating_sub(1);
                if remaining == 0 {
                    count.remove();
                } else {
                    *count.get_mut() = remaining;
                }
            }
        }
        true
    }
}

/// Process-wide registry of outstanding waits.
///
/// Construct once and share through `Arc`. All state lives behind one
/// reader/writer lock: submissions look up under the read lock, everything
/// that adds or removes registrations takes the write lock.
#[derive(Debug)]
pub struct RendezvousBroker {
    registry: RwLock<Registry>,
    config: BrokerConfig,
}

impl RendezvousBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            config,
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a wait for `id` on behalf of `client`.
    pub fn register(self: &Arc<Self>, client: &str, id: &str) -> BrokerResult<WaitTicket> {
        let (receiver, seq) = {
            let mut registry = self.write();

            let outstanding = registry.in_flight.get(client).copied().unwrap_or(0);
            if outstanding >= self.config.max_in_flight {
                warn!(
                    "Rejecting wait for {} from {}: {} already in flight",
                    id, client, outstanding
                );
                return Err(BrokerError::AdmissionRejected);
            }
            if registry.waiters.contains_key(id) {
                warn!("Rejecting duplicate wait for {}", id);
                return Err(BrokerError::AlreadyWaiting);
            }

            registry.next_seq += 1;
            let seq = registry.next_seq;
            let (slot, receiver) = DeliverySlot::new();
            registry.waiters.insert(
                id.to_string(),
                Registration {
                    client: client.to_string(),
                    seq,
                    slot,
                },
            );
            *registry.in_flight.entry(client.to_string()).or_insert(0) += 1;
            (receiver, seq)
        };

        debug!("Registered wait for {} from {}", id, client);

        Ok(WaitTicket {
            broker: Arc::clone(self),
            client: client.to_string(),
            id: id.to_string(),
            seq,
            receiver,
            released: false,
        })
    }

    /// Register and wait with the configured deadline.
    pub async fn wait_for(self: &Arc<Self>, client: &str, id: &str) -> BrokerResult<LoginFields> {
        let ticket = self.register(client, id)?;
        ticket.wait(self.config.wait_timeout).await
    }

    /// Deliver `fields` to the waiter registered under `id`.
    ///
    /// Only the first submission for a registration can succeed; later ones,
    /// and submissions for unknown or expired IDs, get `NotFound`.
    pub fn submit(&self, id: &str, fields: LoginFields) -> BrokerResult<()> {
        let registry = self.read();
        match registry.waiters.get(id) {
            Some(registration) if registration.slot.deliver(fields) => {
                info!("Delivered submission for {}", id);
                Ok(())
            }
            _ => {
                debug!("No waiter for submission {}", id);
                Err(BrokerError::NotFound)
            }
        }
    }

    /// Remove the registration for `id` held by `client`, if any.
    ///
    /// Idempotent. A waiter whose registration is removed this way wakes
    /// with [`BrokerError::Cancelled`].
    pub fn unregister(&self, client: &str, id: &str) -> bool {
        let removed = self
            .write()
            .remove_if(id, |registration| registration.client == client);
        if removed {
            debug!("Unregistered wait for {} from {}", id, client);
        }
        removed
    }

    fn release(&self, id: &str, seq: u64) -> bool {
        self.write()
            .remove_if(id, |registration| registration.seq == seq)
    }

    /// Outstanding registrations held by `client`
    pub fn in_flight(&self, client: &str) -> usize {
        self.read().in_flight.get(client).copied().unwrap_or(0)
    }

    /// Whether `id` is registered and still accepting a submission
    pub fn is_waiting(&self, id: &str) -> bool {
        self.read()
            .waiters
            .get(id)
            .is_some_and(|registration| !registration.slot.is_resolved())
    }
}

/// Scoped ownership of one broker registration.
#[derive(Debug)]
pub struct WaitTicket {
    broker: Arc<RendezvousBroker>,
    client: String,
    id: String,
    seq: u64,
    receiver: oneshot::Receiver<LoginFields>,
    released: bool,
}

impl WaitTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Block until a submission arrives or `timeout` elapses, then release
    /// the registration.
    pub async fn wait(mut self, timeout: Duration) -> BrokerResult<LoginFields> {
        let outcome = match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(_)) => Err(BrokerError::Cancelled),
            Err(_) => Err(BrokerError::Timeout),
        };
        self.settle(outcome)
    }

    /// Release the registration and decide the final outcome. A submission
    /// that won the lock before the release is already in the channel and
    /// takes precedence over a timeout.
    fn settle(&mut self, outcome: BrokerResult<LoginFields>) -> BrokerResult<LoginFields> {
        self.release();
        match outcome {
            Err(BrokerError::Timeout) => match self.receiver.try_recv() {
                Ok(fields) => {
                    debug!("Submission for {} landed at the deadline", self.id);
                    Ok(fields)
                }
                Err(_) => {
                    debug!("Wait for {} timed out", self.id);
                    Err(BrokerError::Timeout)
                }
            },
            other => other,
        }
    }

    /// Release the registration without waiting. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.broker.release(&self.id, self.seq) {
            debug!("Released wait for {} from {}", self.id, self.client);
        }
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        self.release();
    }
}
