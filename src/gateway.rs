//! Identity-bound access to the remote service.
//!
//! The [`Gateway`] owns at most one authoritative [`RemoteHandle`]. Every
//! identity change or transport rebuild bumps a generation counter; a handle
//! whose generation is no longer current refuses new calls and discards the
//! results of calls that complete after it was superseded.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::watch;

use crate::model::{CartEntry, Identity, Product, ProductInput, UserProfile, UserRole};
use crate::session::{SessionManager, SessionState};
use crate::{AccountService, CartService, Connector, Error, Marketplace, ProductCatalog, Result};

/// Observable gateway state.
#[derive(Clone)]
pub enum GatewayState {
    /// No identity has been resolved yet.
    Uninitialized,
    /// A handle for `identity` is being built.
    Connecting { generation: u64, identity: Identity },
    Ready(Arc<RemoteHandle>),
    /// Building the handle for `identity` failed. [`Gateway::reconnect`] retries.
    Disconnected {
        generation: u64,
        identity: Identity,
        reason: String,
    },
}

impl GatewayState {
    pub fn is_ready(&self) -> bool {
        matches!(self, GatewayState::Ready(_))
    }

    pub fn handle(&self) -> Option<&Arc<RemoteHandle>> {
        match self {
            GatewayState::Ready(h) => Some(h),
            _ => None,
        }
    }

    fn identity(&self) -> Option<&Identity> {
        match self {
            GatewayState::Uninitialized => None,
            GatewayState::Connecting { identity, .. } | GatewayState::Disconnected { identity, .. } => Some(identity),
            GatewayState::Ready(h) => Some(h.identity()),
        }
    }
}

impl fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayState::Uninitialized => f.write_str("Uninitialized"),
            GatewayState::Connecting { generation, identity } => {
                write!(f, "Connecting(#{} as {})", generation, identity)
            }
            GatewayState::Ready(h) => write!(f, "Ready(#{} as {})", h.generation, h.identity()),
            GatewayState::Disconnected { generation, reason, .. } => {
                write!(f, "Disconnected(#{}: {})", generation, reason)
            }
        }
    }
}

/// A callable surface bound to one identity and one gateway generation.
pub struct RemoteHandle {
    generation: u64,
    service: Arc<dyn Marketplace>,
    current: Arc<AtomicU64>,
}

impl RemoteHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> &Identity {
        self.service.caller()
    }

    /// False once the gateway has moved on to a newer handle.
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn check(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::StaleHandle)
        }
    }

    /// Runs `call` only if this handle is current, and drops its result if the
    /// handle was superseded while it was in flight.
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        self.check()?;
        let out = call.await;
        if !self.is_current() {
            debug!("Discarding result of call made as {} on superseded handle #{}", self.identity(), self.generation);
            return Err(Error::StaleHandle);
        }
        out
    }
}

#[async_trait]
impl ProductCatalog for RemoteHandle {
    async fn get_all_products(&self) -> Result<Vec<Product>> {
        self.guarded(self.service.get_all_products()).await
    }

    async fn search_by_name(&self, keyword: &str) -> Result<Vec<Product>> {
        self.guarded(self.service.search_by_name(keyword)).await
    }

    async fn filter_by_category(&self, category: &str) -> Result<Vec<Product>> {
        self.guarded(self.service.filter_by_category(category)).await
    }

    async fn get_product(&self, product_id: &str) -> Result<Product> {
        self.guarded(self.service.get_product(product_id)).await
    }

    async fn create_product(&self, input: ProductInput) -> Result<Product> {
        let image = input.image.clone();
        image.report_progress(0.0);
        let created = self.guarded(self.service.create_product(input)).await?;
        image.report_progress(100.0);
        Ok(created)
    }

    async fn delete_product(&self, product_id: &str) -> Result<()> {
        self.guarded(self.service.delete_product(product_id)).await
    }
}

#[async_trait]
impl CartService for RemoteHandle {
    async fn get_caller_cart(&self) -> Result<Vec<CartEntry>> {
        self.guarded(self.service.get_caller_cart()).await
    }

    async fn get_caller_cart_item_count(&self) -> Result<u64> {
        self.guarded(self.service.get_caller_cart_item_count()).await
    }

    async fn add_to_cart(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.guarded(self.service.add_to_cart(product_id, quantity)).await
    }

    async fn update_cart_item(&self, product_id: &str, quantity: u64) -> Result<()> {
        self.guarded(self.service.update_cart_item(product_id, quantity)).await
    }

    async fn remove_from_cart(&self, product_id: &str) -> Result<()> {
        self.guarded(self.service.remove_from_cart(product_id)).await
    }

    async fn clear_caller_cart(&self) -> Result<()> {
        self.guarded(self.service.clear_caller_cart()).await
    }
}

#[async_trait]
impl AccountService for RemoteHandle {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>> {
        self.guarded(self.service.get_caller_user_profile()).await
    }

    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()> {
        self.guarded(self.service.save_caller_user_profile(profile)).await
    }

    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()> {
        self.guarded(self.service.assign_caller_user_role(user, role)).await
    }

    async fn is_caller_admin(&self) -> Result<bool> {
        self.guarded(self.service.is_caller_admin()).await
    }
}

impl Marketplace for RemoteHandle {
    fn caller(&self) -> &Identity {
        self.service.caller()
    }
}

/// Produces remote handles bound to the current identity.
pub struct Gateway {
    connector: Arc<dyn Connector>,
    current: Arc<AtomicU64>,
    state: watch::Sender<GatewayState>,
}

impl Gateway {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        let (state, _) = watch::channel(GatewayState::Uninitialized);
        Arc::new(Self {
            connector,
            current: Arc::new(AtomicU64::new(0)),
            state,
        })
    }

    /// Follows the session. Every transition supersedes the current handle
    /// before the session method that caused it returns, and a replacement is
    /// built in the background.
    pub fn attach(self: &Arc<Self>, session: &SessionManager) {
        self.follow(&session.state());
        let gateway = Arc::clone(self);
        session.on_change(move |state| gateway.follow(state));
    }

    fn follow(self: &Arc<Self>, state: &SessionState) {
        match state {
            SessionState::Ready(identity) => {
                let generation = self.begin(identity.clone());
                let gateway = Arc::clone(self);
                let identity = identity.clone();
                tokio::spawn(async move {
                    let _ = gateway.finish(generation, identity).await;
                });
            }
            SessionState::Uninitialized | SessionState::Initializing => self.retire(),
        }
    }

    /// Binds to `identity` and waits for the handle.
    pub async fn bind(&self, identity: Identity) -> Result<Arc<RemoteHandle>> {
        let generation = self.begin(identity.clone());
        self.finish(generation, identity).await
    }

    /// Rebuilds the handle for the current identity, e.g. after the transport dropped.
    pub async fn reconnect(&self) -> Result<Arc<RemoteHandle>> {
        let identity = self.state.borrow().identity().cloned().ok_or(Error::NotReady)?;
        self.bind(identity).await
    }

    /// Current state. Never fails: a handle under construction is reported as
    /// [`GatewayState::Connecting`].
    pub fn get_handle(&self) -> GatewayState {
        self.state.borrow().clone()
    }

    pub fn handle(&self) -> Option<Arc<RemoteHandle>> {
        self.state.borrow().handle().cloned()
    }

    /// The current handle, or [`Error::NotReady`].
    pub fn require_handle(&self) -> Result<Arc<RemoteHandle>> {
        self.handle().ok_or(Error::NotReady)
    }

    /// Waits until a handle is ready. Fails if building it failed.
    pub async fn ready(&self) -> Result<Arc<RemoteHandle>> {
        let mut rx = self.state.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                GatewayState::Ready(h) => return Ok(h),
                GatewayState::Disconnected { reason, .. } => return Err(Error::Internal(reason)),
                _ => {}
            }
            rx.changed().await.map_err(|_| Error::NotReady)?;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    /// The generation of the newest handle, ready or not.
    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    fn begin(&self, identity: Identity) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|s| {
            generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Gateway #{} connecting as {}", generation, identity);
            *s = GatewayState::Connecting { generation, identity };
        });
        generation
    }

    fn retire(&self) {
        self.state.send_modify(|s| {
            self.current.fetch_add(1, Ordering::SeqCst);
            *s = GatewayState::Uninitialized;
        });
    }

    async fn finish(&self, generation: u64, identity: Identity) -> Result<Arc<RemoteHandle>> {
        let connected = self.connector.connect(&identity).await;
        let mut outcome = Err(Error::StaleHandle);
        self.state.send_if_modified(|s| {
            if self.current.load(Ordering::SeqCst) != generation {
                debug!("Gateway #{} superseded before it was ready", generation);
                return false;
            }
            match connected {
                Ok(service) => {
                    let handle = Arc::new(RemoteHandle {
                        generation,
                        service,
                        current: Arc::clone(&self.current),
                    });
                    debug!("Gateway #{} ready as {}", generation, identity);
                    *s = GatewayState::Ready(Arc::clone(&handle));
                    outcome = Ok(handle);
                }
                Err(e) => {
                    warn!("Gateway #{} could not connect as {}: {}", generation, identity, e);
                    *s = GatewayState::Disconnected {
                        generation,
                        identity: identity.clone(),
                        reason: e.to_string(),
                    };
                    outcome = Err(e);
                }
            }
            true
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemMarket;
    use crate::model::Principal;
    use crate::session::{LocalAuth, SessionManager};
    use std::time::Duration;

    fn alice() -> Identity {
        Identity::authenticated(Principal::from_bytes(vec![0xa1]))
    }

    #[tokio::test]
    async fn test_not_ready_before_binding() {
        let gateway = Gateway::new(Arc::new(MemMarket::new()));
        assert!(matches!(gateway.get_handle(), GatewayState::Uninitialized));
        assert!(matches!(gateway.require_handle(), Err(Error::NotReady)));
        assert!(matches!(gateway.reconnect().await, Err(Error::NotReady)));
    }

    #[tokio::test]
    async fn test_bind_is_stable_until_identity_changes() {
        let gateway = Gateway::new(Arc::new(MemMarket::new()));
        let h1 = gateway.bind(Identity::Anonymous).await.unwrap();
        let again = gateway.require_handle().unwrap();
        assert!(Arc::ptr_eq(&h1, &again));

        let h2 = gateway.bind(alice()).await.unwrap();
        assert!(!h1.is_current());
        assert!(h2.is_current());
        assert_eq!(h2.identity(), &alice());
        assert!(matches!(h1.get_all_products().await, Err(Error::StaleHandle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_call_on_superseded_handle_is_discarded() {
        let market = MemMarket::new();
        let gateway = Gateway::new(Arc::new(market.clone()));
        let h1 = gateway.bind(alice()).await.unwrap();
        market.set_latency(Duration::from_millis(100));

        let call = tokio::spawn(async move { h1.get_caller_cart().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        market.set_latency(Duration::ZERO);
        gateway.bind(Identity::Anonymous).await.unwrap();

        assert!(matches!(call.await.unwrap(), Err(Error::StaleHandle)));
    }

    #[tokio::test]
    async fn test_follows_session_changes() {
        let session = SessionManager::new(Arc::new(LocalAuth::new(Some(alice()))));
        let gateway = Gateway::new(Arc::new(MemMarket::new()));
        gateway.attach(&session);

        session.initialize().await;
        let h = gateway.ready().await.unwrap();
        assert!(h.identity().is_anonymous());

        session.sign_in().await.unwrap();
        // Superseded by the time sign_in returns, with nothing in between.
        assert!(!h.is_current());
        assert!(matches!(gateway.get_handle(), GatewayState::Connecting { .. } | GatewayState::Ready(_)));
        let h = gateway.ready().await.unwrap();
        assert_eq!(h.identity(), &alice());
    }

    #[tokio::test]
    async fn test_sign_out_refuses_calls_until_rebound() {
        let market = MemMarket::new();
        let session = SessionManager::new(Arc::new(LocalAuth::new(Some(alice()))));
        let gateway = Gateway::new(Arc::new(market.clone()));
        gateway.attach(&session);
        session.initialize().await;
        session.sign_in().await.unwrap();
        let h = gateway.ready().await.unwrap();

        session.sign_out().await;
        assert!(matches!(gateway.require_handle(), Err(Error::NotReady)));
        assert!(matches!(h.add_to_cart("p1", 1).await, Err(Error::StaleHandle)));
        assert_eq!(market.calls(crate::wire::Op::AddToCart), 0);

        let h = gateway.ready().await.unwrap();
        assert!(h.identity().is_anonymous());
    }
}
