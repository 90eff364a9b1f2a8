use std::sync::Arc;

use log::info;

use crate::config::ClientConfig;
use crate::engine::MemMarket;
use crate::sdk::{Storefront, TcpConnector};
use crate::session::{AuthProvider, LocalAuth};
use crate::{Connector, Result};

/// Initializes a [`Storefront`] from `config` and resolves the session.
///
/// 1. If `remote_addr` is set (from `MARKETPLACE_ADDR`), calls go over TCP to
///    that backend in **Remote Mode**. Connections are opened per identity,
///    when the gateway binds.
/// 2. Otherwise an in-memory [`MemMarket`] runs inside the process in
///    **Embedded Mode**.
///
/// Sign-in uses a [`LocalAuth`] for `config.identity`.
///
/// # Examples
///
/// ```no_run
/// use marketplace_sync::{config::ClientConfig, sdk};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = sdk::new(&ClientConfig::from_env()?).await?;
///     store.session.sign_in().await?;
///     Ok(())
/// }
/// ```
pub async fn new(config: &ClientConfig) -> Result<Storefront> {
    let auth = Arc::new(LocalAuth::new(config.identity.clone()));
    new_with_auth(config, auth).await
}

/// Like [`new`], with the embedding application's authentication flow.
pub async fn new_with_auth(config: &ClientConfig, auth: Arc<dyn AuthProvider>) -> Result<Storefront> {
    let connector: Arc<dyn Connector> = match &config.remote_addr {
        Some(addr) => {
            info!("Using remote marketplace at {}", addr);
            Arc::new(TcpConnector::new(addr.clone()))
        }
        None => {
            info!("Using embedded marketplace");
            Arc::new(MemMarket::new())
        }
    };

    let store = Storefront::new(connector, auth, config);
    store.session.initialize().await;
    Ok(store)
}
