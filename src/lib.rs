//! Marketplace Sync is the client-side data synchronization layer of a marketplace.
//!
//! It mediates between UI state and an asynchronous, authoritative remote service:
//! a session-bound gateway produces call handles, a keyed query cache serves reads,
//! a mutation coordinator issues writes and invalidates what they affect, and a
//! debounced selector decides which catalog view is active.
//!
//! ## Core Components
//! - [`session`]: Caller identity lifecycle (initialize, sign in, sign out).
//! - [`gateway`]: Identity-bound remote handles with generation fencing.
//! - [`cache`]: Keyed store of asynchronous read results.
//! - [`mutations`]: Write operations with declared invalidation policies.
//! - [`selector`]: Debounced, mutually exclusive search/category selection.
//! - [`catalog`]: Binds the active view to a cache subscription.
//! - [`engine`]: In-memory marketplace backend (embedded mode, dev daemon, tests).
//! - [`sdk`]: Remote TCP client and the [`sdk::Storefront`] facade.
//! - [`server`]: TCP daemon implementation.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod model;
pub mod mutations;
pub mod sdk;
pub mod selector;
pub mod server;
pub mod session;
pub mod wire;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{CartEntry, Identity, Product, ProductInput, UserProfile, UserRole, ValidationErrors};

/// Errors returned by the marketplace client.
#[derive(Error, Debug)]
pub enum Error {
    /// No remote handle is available yet. Callers should render this as loading.
    #[error("remote gateway not ready")]
    NotReady,
    /// The call was issued against a handle that has since been replaced.
    #[error("remote handle superseded by a newer identity or connection")]
    StaleHandle,
    /// The remote service does not know the requested entity.
    #[error("not found: {0}")]
    NotFound(String),
    /// The remote service refused the caller.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The remote service rejected the request as invalid.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Input failed local validation; no remote call was made.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    /// The authentication flow failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// A cached read failed; the original error is shared with every waiter.
    #[error("query {key} failed: {source}")]
    Query {
        key: String,
        #[source]
        source: Arc<Error>,
    },
    /// The connection to the remote service was closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The peer sent something that does not follow the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred during network communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Connectivity and identity errors mean "not ready yet" rather than failure.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::NotReady | Error::StaleHandle | Error::ConnectionClosed | Error::Io(_) => true,
            Error::Query { source, .. } => source.is_connectivity(),
            _ => false,
        }
    }

    /// Domain errors returned by the remote service itself.
    pub fn is_remote_rejection(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::Unauthorized(_) | Error::Rejected(_) => true,
            Error::Query { source, .. } => source.is_remote_rejection(),
            _ => false,
        }
    }
}

/// A specialized Result type for marketplace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Read and write operations on the product catalog.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Lists every product.
    async fn get_all_products(&self) -> Result<Vec<Product>>;
    /// Lists products whose name matches `keyword`.
    async fn search_by_name(&self, keyword: &str) -> Result<Vec<Product>>;
    /// Lists products in the named category.
    async fn filter_by_category(&self, category: &str) -> Result<Vec<Product>>;
    /// Retrieves one product, or [`Error::NotFound`].
    async fn get_product(&self, product_id: &str) -> Result<Product>;
    /// Creates a product owned by the caller. The service assigns id and timestamp.
    async fn create_product(&self, input: ProductInput) -> Result<Product>;
    /// Deletes a product.
    async fn delete_product(&self, product_id: &str) -> Result<()>;
}

/// Operations on the caller's own cart.
#[async_trait]
pub trait CartService: Send + Sync {
    async fn get_caller_cart(&self) -> Result<Vec<CartEntry>>;
    async fn get_caller_cart_item_count(&self) -> Result<u64>;
    async fn add_to_cart(&self, product_id: &str, quantity: u64) -> Result<()>;
    async fn update_cart_item(&self, product_id: &str, quantity: u64) -> Result<()>;
    async fn remove_from_cart(&self, product_id: &str) -> Result<()>;
    async fn clear_caller_cart(&self) -> Result<()>;
}

/// Profile and role operations for the caller.
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn get_caller_user_profile(&self) -> Result<Option<UserProfile>>;
    async fn save_caller_user_profile(&self, profile: UserProfile) -> Result<()>;
    async fn assign_caller_user_role(&self, user: &Identity, role: UserRole) -> Result<()>;
    async fn is_caller_admin(&self) -> Result<bool>;
}

/// The full remote operation table, bound to one caller.
pub trait Marketplace: ProductCatalog + CartService + AccountService {
    /// The identity every call on this surface is made as.
    fn caller(&self) -> &Identity;
}

/// Builds a [`Marketplace`] surface bound to an identity.
///
/// Implemented by the embedded engine and by the TCP transport; the gateway
/// calls it whenever the identity changes or the transport is re-established.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &Identity) -> Result<Arc<dyn Marketplace>>;
}
