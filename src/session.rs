//! Caller identity lifecycle.
//!
//! The session is a single observable value moving through
//! `Uninitialized -> Initializing -> Ready(identity)`. Dependents subscribe to
//! it rather than reading ambient globals.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::gateway::{Gateway, GatewayState};
use crate::model::{Identity, UserRole};
use crate::{AccountService, Error, Result};

/// Observable session lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// The previous identity is being restored. Not the same as "no identity".
    Initializing,
    Ready(Identity),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Ready(id) => Some(id),
            _ => None,
        }
    }
}

/// The authentication flow, supplied by the embedding application.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolves a previously stored identity, if any.
    async fn restore(&self) -> Result<Option<Identity>>;
    /// Runs the sign-in flow.
    async fn sign_in(&self) -> Result<Identity>;
    /// Forgets the stored identity.
    async fn sign_out(&self) -> Result<()>;
}

/// Auth provider that signs in as a fixed, preconfigured identity.
///
/// Used by embedded mode and the dev tooling, where there is no interactive flow.
pub struct LocalAuth {
    identity: Option<Identity>,
    signed_in: Mutex<bool>,
}

impl LocalAuth {
    pub fn new(identity: Option<Identity>) -> Self {
        Self {
            identity,
            signed_in: Mutex::new(false),
        }
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn restore(&self) -> Result<Option<Identity>> {
        let signed_in = *self.signed_in.lock().await;
        Ok(if signed_in { self.identity.clone() } else { None })
    }

    async fn sign_in(&self) -> Result<Identity> {
        let identity = self
            .identity
            .clone()
            .filter(|id| !id.is_anonymous())
            .ok_or_else(|| Error::Auth("no identity configured".to_string()))?;
        *self.signed_in.lock().await = true;
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<()> {
        *self.signed_in.lock().await = false;
        Ok(())
    }
}

type Listener = Box<dyn Fn(&SessionState) + Send + Sync>;

/// Owns the current caller identity.
pub struct SessionManager {
    auth: Arc<dyn AuthProvider>,
    state: watch::Sender<SessionState>,
    listeners: StdMutex<Vec<Listener>>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            auth,
            state,
            listeners: StdMutex::new(Vec::new()),
        }
    }

    /// Registers a listener that runs synchronously on every transition,
    /// before the transition is published and before the session method returns.
    ///
    /// Listeners must not call back into the session.
    pub fn on_change(&self, listener: impl Fn(&SessionState) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn publish(&self, state: SessionState) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(&state);
        }
        self.state.send_replace(state);
    }

    /// Restores the previous identity. Falls back to anonymous when nothing is stored
    /// or the restore fails.
    pub async fn initialize(&self) -> Identity {
        self.publish(SessionState::Initializing);
        let identity = match self.auth.restore().await {
            Ok(Some(id)) => id,
            Ok(None) => Identity::Anonymous,
            Err(e) => {
                warn!("Could not restore identity, continuing anonymously: {}", e);
                Identity::Anonymous
            }
        };
        info!("Session ready as {}", identity);
        self.publish(SessionState::Ready(identity.clone()));
        identity
    }

    /// Runs the sign-in flow and replaces the active identity on success.
    ///
    /// A failed flow leaves the current identity untouched and returns
    /// [`Error::Auth`] for the UI to show.
    pub async fn sign_in(&self) -> Result<Identity> {
        let identity = self.auth.sign_in().await.map_err(|e| match e {
            Error::Auth(_) => e,
            other => Error::Auth(other.to_string()),
        })?;
        info!("Signed in as {}", identity);
        self.publish(SessionState::Ready(identity.clone()));
        Ok(identity)
    }

    /// Clears the identity back to anonymous.
    pub async fn sign_out(&self) {
        if let Err(e) = self.auth.sign_out().await {
            warn!("Sign-out flow failed: {}", e);
        }
        info!("Signed out");
        self.publish(SessionState::Ready(Identity::Anonymous));
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity().cloned()
    }

    pub fn is_initializing(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Initializing)
    }

    pub fn is_signed_in(&self) -> bool {
        self.identity().is_some_and(|id| !id.is_anonymous())
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

/// Registers every newly authenticated caller with the `user` role.
///
/// Non-critical: runs in the background, and a failed registration is logged at
/// debug level and dropped. Nothing waits on it and nothing is shown to the user.
pub fn spawn_role_registration(gateway: Arc<Gateway>) -> JoinHandle<()> {
    let mut rx = gateway.subscribe();
    tokio::spawn(async move {
        let mut last: Option<Identity> = None;
        loop {
            let handle = match &*rx.borrow_and_update() {
                GatewayState::Ready(h) => Some(h.clone()),
                _ => None,
            };
            if let Some(handle) = handle {
                let identity = handle.identity().clone();
                if identity.is_anonymous() {
                    last = None;
                } else if last.as_ref() != Some(&identity) {
                    last = Some(identity.clone());
                    tokio::spawn(async move {
                        if let Err(e) = handle.assign_caller_user_role(&identity, UserRole::User).await {
                            debug!("Role registration for {} skipped: {}", identity, e);
                        }
                    });
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Principal;

    fn alice() -> Identity {
        Identity::authenticated(Principal::from_bytes(vec![0xa1]))
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let session = SessionManager::new(Arc::new(LocalAuth::new(Some(alice()))));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(session.identity(), None);

        assert_eq!(session.initialize().await, Identity::Anonymous);
        assert!(!session.is_signed_in());

        assert_eq!(session.sign_in().await.unwrap(), alice());
        assert!(session.is_signed_in());

        session.sign_out().await;
        assert_eq!(session.state(), SessionState::Ready(Identity::Anonymous));
    }

    #[tokio::test]
    async fn test_restore_after_sign_in() {
        let auth = Arc::new(LocalAuth::new(Some(alice())));
        auth.sign_in().await.unwrap();
        let session = SessionManager::new(auth);
        assert_eq!(session.initialize().await, alice());
    }

    #[tokio::test]
    async fn test_failed_sign_in_keeps_identity() {
        let session = SessionManager::new(Arc::new(LocalAuth::new(None)));
        session.initialize().await;
        let mut rx = session.subscribe();
        rx.borrow_and_update();

        assert!(matches!(session.sign_in().await, Err(Error::Auth(_))));
        assert_eq!(session.identity(), Some(Identity::Anonymous));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_listeners_run_before_methods_return() {
        let session = SessionManager::new(Arc::new(LocalAuth::new(Some(alice()))));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.on_change(move |state| sink.lock().unwrap().push(state.clone()));

        session.initialize().await;
        session.sign_in().await.unwrap();
        session.sign_out().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::Initializing,
                SessionState::Ready(Identity::Anonymous),
                SessionState::Ready(alice()),
                SessionState::Ready(Identity::Anonymous),
            ]
        );
    }
}
