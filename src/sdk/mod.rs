/// Client-side entry points for the marketplace.
///
/// This module provides the remote TCP client, backend discovery and the
/// [`Storefront`] facade that wires session, gateway, cache, mutations and
/// selector together.
pub mod client;
/// Backend discovery and storefront initialization.
pub mod discovery;

use std::sync::Arc;

use futures::future::join_all;
use log::debug;
use tokio::task::JoinHandle;

use crate::cache::QueryCache;
use crate::catalog::CatalogView;
use crate::config::ClientConfig;
use crate::gateway::Gateway;
use crate::mutations::MutationCoordinator;
use crate::selector::SearchSelector;
use crate::session::{spawn_role_registration, AuthProvider, SessionManager};
use crate::Connector;

pub use client::{Client, TcpConnector};
pub use discovery::{new, new_with_auth};

/// Every client component, wired to one backend.
///
/// Signing in or out supersedes the gateway handle before the session method
/// returns. The cache drops caller-scoped entries on its next access, and the
/// background tasks refetch observed keys and register the new caller's role
/// once the replacement handle is ready.
pub struct Storefront {
    pub session: Arc<SessionManager>,
    pub gateway: Arc<Gateway>,
    pub cache: Arc<QueryCache>,
    pub mutations: MutationCoordinator,
    pub selector: Arc<SearchSelector>,
    tasks: Vec<JoinHandle<()>>,
}

impl Storefront {
    /// Wires the components. Must be called within a tokio runtime.
    ///
    /// The session starts uninitialized; call
    /// [`SessionManager::initialize`] to resolve the caller.
    pub fn new(connector: Arc<dyn Connector>, auth: Arc<dyn AuthProvider>, config: &ClientConfig) -> Self {
        let session = Arc::new(SessionManager::new(auth));
        let gateway = Gateway::new(connector);
        let cache = QueryCache::new(Arc::clone(&gateway));
        let mutations = MutationCoordinator::new(Arc::clone(&gateway), Arc::clone(&cache));
        let selector = Arc::new(SearchSelector::new(config.search_debounce));

        gateway.attach(&session);
        let tasks = vec![cache.attach(), spawn_role_registration(Arc::clone(&gateway))];

        Self {
            session,
            gateway,
            cache,
            mutations,
            selector,
            tasks,
        }
    }

    /// Opens a catalog listing that follows the shared selector.
    pub fn catalog(&self) -> CatalogView {
        CatalogView::new(Arc::clone(&self.selector), Arc::clone(&self.cache))
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for res in join_all(self.tasks).await {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    debug!("Background task ended abnormally: {}", e);
                }
            }
        }
    }
}
