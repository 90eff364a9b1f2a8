use marketplace_sync::cache::{Freshness, QueryKey};
use marketplace_sync::config::ClientConfig;
use marketplace_sync::engine::MemMarket;
use marketplace_sync::gateway::RemoteHandle;
use marketplace_sync::model::{CartEntry, ExternalImage, Identity, Principal, ProductDraft, UserRole};
use marketplace_sync::sdk::{Client, Storefront, TcpConnector};
use marketplace_sync::server::Router;
use marketplace_sync::session::LocalAuth;
use marketplace_sync::wire::Op;
use marketplace_sync::{CartService, Error, ProductCatalog};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn alice() -> Identity {
    Identity::authenticated(Principal::from_bytes(vec![0xa1, 0x1c, 0xe0]))
}

fn lamp() -> ProductDraft {
    ProductDraft {
        name: "Ceramic lamp".to_string(),
        description: "Warm light".to_string(),
        price: "79.50".to_string(),
        category: "Home".to_string(),
        seller_name: "Alice".to_string(),
        image: Some(ExternalImage::from_bytes(vec![0x89, 0x50, 0x4e, 0x47])),
    }
}

async fn start_backend(market: MemMarket) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new(Arc::new(market));
    tokio::spawn(async move {
        let _ = router.serve(listener).await;
    });
    addr.to_string()
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut).await.expect("timed out")
}

async fn ready_as(store: &Storefront, identity: &Identity) -> Arc<RemoteHandle> {
    within(async {
        loop {
            if let Some(h) = store.gateway.handle() {
                if h.identity() == identity {
                    return h;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

async fn signed_in_store(market: &MemMarket) -> Storefront {
    let addr = start_backend(market.clone()).await;
    let config = ClientConfig {
        search_debounce: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let store = Storefront::new(
        Arc::new(TcpConnector::new(addr)),
        Arc::new(LocalAuth::new(Some(alice()))),
        &config,
    );
    store.session.initialize().await;
    store.session.sign_in().await.unwrap();
    ready_as(&store, &alice()).await;
    store
}

#[tokio::test]
async fn test_full_protocol_integration() {
    let addr = start_backend(MemMarket::new()).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut response = String::new();

    writer.write_all(b"PING\n").await.unwrap();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "PONG");

    writer.write_all(b"GET_CART_COUNT anonymous []\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "OK 0");

    writer.write_all(b"ADD_TO_CART anonymous [\"p1\",1]\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "ERR unauthorized sign in required");

    writer.write_all(b"FROB anonymous []\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert!(response.starts_with("ERR bad_request"));
}

#[tokio::test]
async fn test_client_round_trip() {
    let market = MemMarket::new();
    market.seed_demo();
    let addr = start_backend(market).await;

    let client = Client::connect(&addr, alice()).await.unwrap();
    let products = client.get_all_products().await.unwrap();
    assert_eq!(products.len(), 5);

    let found = client.search_by_name("SHOE").await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(matches!(client.get_product("nope").await, Err(Error::NotFound(_))));

    client.add_to_cart(&found[0].id, 2).await.unwrap();
    assert_eq!(client.get_caller_cart_item_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_cancelled_call_does_not_leak_its_reply() {
    let market = MemMarket::new();
    market.seed_demo();
    let addr = start_backend(market.clone()).await;
    let client = Client::connect(&addr, alice()).await.unwrap();

    market.set_latency(Duration::from_millis(100));
    let cut = tokio::time::timeout(Duration::from_millis(10), client.get_caller_cart_item_count()).await;
    assert!(cut.is_err());
    market.set_latency(Duration::ZERO);

    let products = client.get_all_products().await.unwrap();
    assert_eq!(products.len(), 5);
    assert_eq!(client.get_caller_cart_item_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_then_update_to_zero_empties_cart() {
    let market = MemMarket::new();
    let store = signed_in_store(&market).await;
    let product = store.mutations.submit_product(lamp()).await.unwrap();

    assert!(store.cache.fetch(&QueryKey::Cart).await.unwrap().as_cart().unwrap().is_empty());
    store.mutations.add_to_cart(&product.id, 1).await.unwrap();

    let cart = store.cache.fetch(&QueryKey::Cart).await.unwrap();
    assert_eq!(
        cart.as_cart().unwrap(),
        &[CartEntry {
            product_id: product.id.clone(),
            quantity: 1
        }]
    );
    assert_eq!(store.cache.fetch(&QueryKey::CartCount).await.unwrap().as_count(), Some(1));

    store.mutations.update_cart_item(&product.id, 0).await.unwrap();
    assert!(store.cache.fetch(&QueryKey::Cart).await.unwrap().as_cart().unwrap().is_empty());
    assert_eq!(store.cache.fetch(&QueryKey::CartCount).await.unwrap().as_count(), Some(0));
    assert_eq!(market.calls(Op::UpdateCartItem), 0);

    store.shutdown().await;
}

#[tokio::test]
async fn test_created_product_appears_in_populated_listing() {
    let market = MemMarket::new();
    market.seed_demo();
    let store = signed_in_store(&market).await;

    let before = store.cache.fetch(&QueryKey::AllProducts).await.unwrap();
    assert_eq!(before.as_products().unwrap().len(), 5);

    let created = store.mutations.submit_product(lamp()).await.unwrap();
    assert_eq!(created.seller, alice());

    let after = store.cache.fetch(&QueryKey::AllProducts).await.unwrap();
    assert!(after.as_products().unwrap().iter().any(|p| p.id == created.id));

    store.shutdown().await;
}

#[tokio::test]
async fn test_repeated_reads_share_one_fetch() {
    let market = MemMarket::new();
    let store = signed_in_store(&market).await;
    let fetches_before = market.calls(Op::GetAllProducts);

    store.cache.get(&QueryKey::AllProducts);
    store.cache.get(&QueryKey::AllProducts);
    store.cache.fetch(&QueryKey::AllProducts).await.unwrap();
    store.cache.get(&QueryKey::AllProducts);

    assert_eq!(market.calls(Op::GetAllProducts) - fetches_before, 1);
    store.shutdown().await;
}

#[tokio::test]
async fn test_debounced_search_over_tcp() {
    let market = MemMarket::new();
    market.seed_demo();
    let store = signed_in_store(&market).await;
    let mut catalog = store.catalog();

    store.selector.set_search_text("sho");
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.selector.set_search_text("shoe");

    let snap = within(async {
        loop {
            let snap = catalog.changed().await.unwrap();
            if snap.view == QueryKey::Search("shoe".into()) && snap.entry.freshness == Freshness::Fresh {
                return snap;
            }
        }
    })
    .await;
    assert_eq!(snap.products().len(), 1);
    assert_eq!(market.calls(Op::SearchByName), 1);

    store.shutdown().await;
}

#[tokio::test]
async fn test_sign_out_isolates_identities() {
    let market = MemMarket::new();
    let store = signed_in_store(&market).await;
    let handle = store.gateway.require_handle().unwrap();

    let product = store.mutations.submit_product(lamp()).await.unwrap();
    store.mutations.add_to_cart(&product.id, 3).await.unwrap();
    let _count = store.cache.subscribe(&QueryKey::CartCount);
    assert_eq!(store.cache.fetch(&QueryKey::CartCount).await.unwrap().as_count(), Some(3));

    store.session.sign_out().await;
    ready_as(&store, &Identity::Anonymous).await;

    // Calls on the old handle are refused rather than made as the new caller.
    assert!(!handle.is_current());
    assert!(matches!(handle.get_caller_cart().await, Err(Error::StaleHandle)));

    // The anonymous caller's count replaces Alice's once the cache rebinds.
    within(async {
        loop {
            if let Ok(data) = store.cache.fetch(&QueryKey::CartCount).await {
                if data.as_count() == Some(0) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(matches!(
        store.mutations.add_to_cart(&product.id, 1).await,
        Err(Error::Unauthorized(_))
    ));

    store.shutdown().await;
}

#[tokio::test]
async fn test_sign_in_registers_user_role() {
    let market = MemMarket::new();
    let store = signed_in_store(&market).await;

    within(async {
        while market.role_of(&alice()) != Some(UserRole::User) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    store.shutdown().await;
}

#[tokio::test]
async fn test_failed_role_registration_is_not_surfaced() {
    let market = MemMarket::new();
    // Role registration is non-critical: a rejected call must not reach the caller.
    market.fail_next(Op::AssignRole, Error::Internal("role service down".to_string()));
    let addr = start_backend(market.clone()).await;
    let store = Storefront::new(
        Arc::new(TcpConnector::new(addr)),
        Arc::new(LocalAuth::new(Some(alice()))),
        &ClientConfig::default(),
    );
    store.session.initialize().await;

    assert_eq!(store.session.sign_in().await.unwrap(), alice());
    ready_as(&store, &alice()).await;
    within(async {
        while market.calls(Op::AssignRole) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(market.role_of(&alice()), None);

    let product = store.mutations.submit_product(lamp()).await.unwrap();
    store.mutations.add_to_cart(&product.id, 2).await.unwrap();
    assert_eq!(store.cache.fetch(&QueryKey::CartCount).await.unwrap().as_count(), Some(2));
    assert!(store.session.is_signed_in());

    store.shutdown().await;
}

#[tokio::test]
async fn test_add_to_cart_right_after_sign_out_is_refused() {
    let market = MemMarket::new();
    let store = signed_in_store(&market).await;
    let product = store.mutations.submit_product(lamp()).await.unwrap();

    store.session.sign_out().await;
    let res = store.mutations.add_to_cart(&product.id, 5).await;
    assert!(matches!(res, Err(Error::NotReady)));
    assert_eq!(market.calls(Op::AddToCart), 0);

    store.shutdown().await;
}
