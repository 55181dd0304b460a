//! Identity and connectivity collaborators.
//!
//! The engine only needs to ask "who is signed in" and "are we online". The
//! monitors in this module are watch-channel backed implementations that a
//! host can feed from its auth SDK and network listener; they also provide
//! the bounded waits used during start-up.

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Supplies the current user.
pub trait Identity: Send + Sync {
    /// Stable identifier of the signed-in user, if any.
    fn current_user_id(&self) -> Option<String>;

    /// Whether an authenticated session exists.
    fn is_authenticated(&self) -> bool {
        self.current_user_id().is_some()
    }
}

/// Supplies network reachability.
pub trait Connectivity: Send + Sync {
    /// Whether the device has a network connection.
    fn is_online(&self) -> bool;

    /// Whether the remote store answers.
    fn is_store_reachable(&self) -> bool;
}

/// Namespace under which a user's collection is stored, locally and remotely.
///
/// Anonymous and authenticated sessions resolve to different keys, so they
/// never read each other's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey(String);

impl UserKey {
    /// Key for an authenticated user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    /// Resolve the key for whoever is signed in right now.
    pub fn resolve(identity: &dyn Identity, anonymous_key: &str) -> Self {
        match identity.current_user_id().filter(|id| !id.is_empty()) {
            Some(id) => Self(id),
            None => Self(anonymous_key.to_string()),
        }
    }

    /// The key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication state as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// The provider has not reported yet.
    Unknown,
    /// No user is signed in.
    SignedOut,
    /// A user is signed in.
    SignedIn(String),
}

/// Watch-channel backed [`Identity`].
#[derive(Debug)]
pub struct AuthMonitor {
    tx: watch::Sender<AuthState>,
}

impl AuthMonitor {
    /// Create a monitor whose state is not yet known.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AuthState::Unknown);
        Self { tx }
    }

    /// Create a monitor with a signed-in user.
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let monitor = Self::new();
        monitor.sign_in(user_id);
        monitor
    }

    /// Record a sign-in.
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        tracing::info!(user = %user_id, "Session signed in");
        self.tx.send_replace(AuthState::SignedIn(user_id));
    }

    /// Record a sign-out.
    pub fn sign_out(&self) {
        tracing::info!("Session signed out");
        self.tx.send_replace(AuthState::SignedOut);
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.tx.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    /// Wait until the provider has reported a definitive state.
    ///
    /// Returns the signed-in user id, or `None` when signed out. Fails with
    /// [`Error::Timeout`] if the state is still unknown after `timeout`.
    pub async fn wait_for_auth(&self, timeout: Duration) -> Result<Option<String>> {
        let mut rx = self.subscribe();
        let state = tokio::time::timeout(timeout, rx.wait_for(|s| *s != AuthState::Unknown))
            .await
            .map_err(|_| Error::Timeout("waiting for auth state".into()))?
            .map(|state| (*state).clone())
            .map_err(|_| Error::Cancelled)?;

        Ok(match state {
            AuthState::SignedIn(user_id) => Some(user_id),
            _ => None,
        })
    }
}

impl Default for AuthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Identity for AuthMonitor {
    fn current_user_id(&self) -> Option<String> {
        match &*self.tx.borrow() {
            AuthState::SignedIn(user_id) => Some(user_id.clone()),
            _ => None,
        }
    }
}

/// Reachability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    /// Device has a network connection
    pub online: bool,
    /// Remote store answers
    pub store_reachable: bool,
}

impl NetworkStatus {
    /// Online and reachable.
    pub fn connected() -> Self {
        Self {
            online: true,
            store_reachable: true,
        }
    }

    /// No connection at all.
    pub fn offline() -> Self {
        Self {
            online: false,
            store_reachable: false,
        }
    }

    /// Whether remote operations can be expected to succeed.
    pub fn is_connected(&self) -> bool {
        self.online && self.store_reachable
    }
}

/// Watch-channel backed [`Connectivity`].
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial status.
    pub fn new(status: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self { tx }
    }

    /// Report a new status.
    pub fn set_status(&self, status: NetworkStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            tracing::debug!(
                online = status.online,
                store_reachable = status.store_reachable,
                "Connectivity changed"
            );
        }
    }

    /// Current status.
    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Wait until the device is online and the store is reachable.
    ///
    /// Fails with [`Error::Timeout`] if that does not happen within `timeout`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(NetworkStatus::is_connected))
            .await
            .map_err(|_| Error::Timeout("waiting for connection".into()))?
            .map_err(|_| Error::Cancelled)?;
        Ok(())
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    fn is_store_reachable(&self) -> bool {
        self.tx.borrow().store_reachable
    }
}
