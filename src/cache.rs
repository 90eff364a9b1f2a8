//! Keyed store of asynchronous read results.
//!
//! Each [`QueryKey`] owns one slot: the latest [`CacheEntry`], a change
//! channel for observers and the bookkeeping that keeps at most one fetch in
//! flight. Results are applied by key and fetch generation, never by
//! completion order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::gateway::{Gateway, RemoteHandle};
use crate::model::{CartEntry, CategoryFilter, Product};
use crate::{CartService, Error, ProductCatalog, Result};

/// Structured identifier of one cacheable read.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
    AllProducts,
    Search(String),
    Category(String),
    Product(String),
    Cart,
    CartCount,
}

impl QueryKey {
    /// Keys whose data depends on who the caller is.
    pub fn is_caller_scoped(&self) -> bool {
        matches!(self, QueryKey::Cart | QueryKey::CartCount)
    }

    /// Keys that hold a list of products.
    pub fn is_product_listing(&self) -> bool {
        matches!(self, QueryKey::AllProducts | QueryKey::Search(_) | QueryKey::Category(_))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::AllProducts => f.write_str("products/all"),
            QueryKey::Search(term) => write!(f, "products/search/{}", term),
            QueryKey::Category(name) => write!(f, "products/category/{}", name),
            QueryKey::Product(id) => write!(f, "product/{}", id),
            QueryKey::Cart => f.write_str("cart"),
            QueryKey::CartCount => f.write_str("cart/count"),
        }
    }
}

/// Data held by a cache entry.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryData {
    Products(Vec<Product>),
    Product(Product),
    Cart(Vec<CartEntry>),
    Count(u64),
}

impl QueryData {
    pub fn as_products(&self) -> Option<&[Product]> {
        match self {
            QueryData::Products(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_product(&self) -> Option<&Product> {
        match self {
            QueryData::Product(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_cart(&self) -> Option<&[CartEntry]> {
        match self {
            QueryData::Cart(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            QueryData::Count(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Never fetched.
    Idle,
    /// A fetch is in flight. Previous data, if any, is still readable.
    Loading,
    Fresh,
    /// Invalidated; refetched on the next read or right away when observed.
    Stale,
    /// The last fetch failed. Previous data, if any, is kept.
    Error,
}

/// Snapshot of one key's cached state.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<QueryData>,
    pub freshness: Freshness,
    pub last_error: Option<Arc<Error>>,
    pub updated_at: Option<Instant>,
}

impl CacheEntry {
    fn new(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            freshness: Freshness::Idle,
            last_error: None,
            updated_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.freshness == Freshness::Loading
    }

    pub fn products(&self) -> &[Product] {
        self.data.as_ref().and_then(QueryData::as_products).unwrap_or_default()
    }
}

struct Slot {
    tx: watch::Sender<CacheEntry>,
    /// Generation of the fetch currently allowed to complete.
    in_flight: Option<u64>,
    next_fetch: u64,
    /// Invalidated while a fetch was in flight.
    refetch: bool,
    observers: usize,
}

impl Slot {
    fn new(key: QueryKey) -> Self {
        let (tx, _) = watch::channel(CacheEntry::new(key));
        Self {
            tx,
            in_flight: None,
            next_fetch: 0,
            refetch: false,
            observers: 0,
        }
    }

    fn needs_fetch(&self) -> bool {
        self.in_flight.is_none() && matches!(self.tx.borrow().freshness, Freshness::Idle | Freshness::Stale)
    }
}

/// Keyed cache of remote reads.
pub struct QueryCache {
    gateway: Arc<Gateway>,
    slots: Mutex<HashMap<QueryKey, Slot>>,
    /// Gateway generation the slots were last reset for.
    bound: AtomicU64,
    fetches: AtomicU64,
}

impl QueryCache {
    pub fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        let bound = AtomicU64::new(gateway.generation());
        Arc::new(Self {
            gateway,
            slots: Mutex::new(HashMap::new()),
            bound,
            fetches: AtomicU64::new(0),
        })
    }

    /// Follows the gateway: once a handle is ready, observed keys left stale by
    /// an identity change are refetched through it.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut rx = self.gateway.subscribe();
        tokio::spawn(async move {
            loop {
                let ready = rx.borrow_and_update().is_ready();
                if ready {
                    cache.resume();
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Returns the entry for `key`, starting a fetch if it was never fetched or
    /// is stale and nothing is in flight.
    pub fn get(self: &Arc<Self>, key: &QueryKey) -> CacheEntry {
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot::new(key.clone()));
        if slot.needs_fetch() {
            self.start_fetch(key, slot);
        }
        let entry = slot.tx.borrow().clone();
        entry
    }

    /// Returns the entry for `key` without fetching.
    pub fn peek(self: &Arc<Self>, key: &QueryKey) -> Option<CacheEntry> {
        let slots = self.lock();
        slots.get(key).map(|s| s.tx.borrow().clone())
    }

    /// Observes `key` until the returned [`Subscription`] is dropped.
    pub fn subscribe(self: &Arc<Self>, key: &QueryKey) -> Subscription {
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot::new(key.clone()));
        slot.observers += 1;
        let rx = slot.tx.subscribe();
        if slot.needs_fetch() {
            self.start_fetch(key, slot);
        }
        Subscription {
            cache: Arc::clone(self),
            key: key.clone(),
            rx,
        }
    }

    /// Reads `key`, waiting for an in-flight or newly started fetch.
    ///
    /// Returns [`Error::NotReady`] when no fetch can run because the gateway has
    /// no handle, or when the fetch was cut short by an identity change or a
    /// dropped connection.
    pub async fn fetch(self: &Arc<Self>, key: &QueryKey) -> Result<QueryData> {
        let mut sub = self.subscribe(key);
        let mut started = false;
        loop {
            let entry = sub.current();
            match entry.freshness {
                Freshness::Fresh => {
                    return entry.data.ok_or_else(|| Error::Internal(format!("{} is fresh without data", key)));
                }
                Freshness::Error => {
                    let source = entry
                        .last_error
                        .unwrap_or_else(|| Arc::new(Error::Internal("unknown error".to_string())));
                    return Err(Error::Query {
                        key: key.to_string(),
                        source,
                    });
                }
                // A fetch this call waited on was interrupted; report rather than spin.
                Freshness::Idle | Freshness::Stale if started => return Err(Error::NotReady),
                Freshness::Idle | Freshness::Stale => {
                    if !self.ensure_fetch(key) {
                        return Err(Error::NotReady);
                    }
                    started = true;
                }
                Freshness::Loading => {}
            }
            sub.changed().await?;
        }
    }

    /// Starts a fetch for `key` unless one is in flight. Returns whether a fetch
    /// is now running.
    fn ensure_fetch(self: &Arc<Self>, key: &QueryKey) -> bool {
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot::new(key.clone()));
        if slot.in_flight.is_none() {
            self.start_fetch(key, slot);
        }
        slot.in_flight.is_some()
    }

    /// Marks `key` stale. Refetches right away only if someone observes it.
    pub fn invalidate(self: &Arc<Self>, key: &QueryKey) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(key) {
            self.invalidate_slot(key, slot);
        }
    }

    /// Invalidates every cached key matching `pred`.
    pub fn invalidate_where(self: &Arc<Self>, pred: impl Fn(&QueryKey) -> bool) {
        let mut slots = self.lock();
        for (key, slot) in slots.iter_mut() {
            if pred(key) {
                self.invalidate_slot(key, slot);
            }
        }
    }

    /// Number of fetches started since creation.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Locks the slots, first resetting them if the gateway has moved to a new
    /// generation since the last access.
    fn lock(self: &Arc<Self>) -> MutexGuard<'_, HashMap<QueryKey, Slot>> {
        let mut slots = self.slots.lock().unwrap();
        let current = self.gateway.generation();
        if self.bound.swap(current, Ordering::SeqCst) != current {
            debug!("Cache rebinding to gateway #{}", current);
            for (key, slot) in slots.iter_mut() {
                slot.in_flight = None;
                slot.refetch = false;
                let launched = slot.observers > 0 && self.launch(key, slot);
                slot.tx.send_modify(|e| {
                    if key.is_caller_scoped() {
                        e.data = None;
                        e.last_error = None;
                        e.updated_at = None;
                    }
                    if launched {
                        e.freshness = Freshness::Loading;
                    } else if e.freshness != Freshness::Idle {
                        e.freshness = Freshness::Stale;
                    }
                });
            }
        }
        slots
    }

    fn resume(self: &Arc<Self>) {
        let mut slots = self.lock();
        for (key, slot) in slots.iter_mut() {
            if slot.observers > 0 && slot.needs_fetch() {
                self.start_fetch(key, slot);
            }
        }
    }

    fn invalidate_slot(self: &Arc<Self>, key: &QueryKey, slot: &mut Slot) {
        if slot.in_flight.is_some() {
            slot.refetch = true;
            return;
        }
        if slot.tx.borrow().freshness == Freshness::Idle {
            return;
        }
        debug!("Invalidating {}", key);
        let launched = slot.observers > 0 && self.launch(key, slot);
        slot.tx.send_modify(|e| {
            e.freshness = if launched { Freshness::Loading } else { Freshness::Stale };
        });
    }

    fn start_fetch(self: &Arc<Self>, key: &QueryKey, slot: &mut Slot) {
        if self.launch(key, slot) {
            slot.tx.send_modify(|e| e.freshness = Freshness::Loading);
        }
    }

    /// Spawns a fetch of `key` through the bound handle without publishing.
    /// Callers fold `Loading` into their own update.
    fn launch(self: &Arc<Self>, key: &QueryKey, slot: &mut Slot) -> bool {
        let bound = self.bound.load(Ordering::SeqCst);
        let Some(handle) = self.gateway.handle().filter(|h| h.generation() == bound) else {
            debug!("Deferring fetch of {}: gateway not ready", key);
            return false;
        };
        slot.next_fetch += 1;
        let generation = slot.next_fetch;
        slot.in_flight = Some(generation);
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!("Fetching {} (#{})", key, generation);

        let cache = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            let result = run_query(&handle, &key).await;
            cache.complete(&key, generation, result);
        });
        true
    }

    fn complete(self: &Arc<Self>, key: &QueryKey, generation: u64, result: Result<QueryData>) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        if slot.in_flight != Some(generation) {
            debug!("Discarding superseded fetch #{} of {}", generation, key);
            return;
        }
        slot.in_flight = None;
        let refetch = std::mem::take(&mut slot.refetch);
        // The follow-up fetch cannot complete before this update: it needs the lock.
        let relaunched = refetch && slot.observers > 0 && self.launch(key, slot);
        let pending = if relaunched { Freshness::Loading } else { Freshness::Stale };

        slot.tx.send_modify(|e| match result {
            Ok(data) => {
                e.data = Some(data);
                e.last_error = None;
                e.updated_at = Some(Instant::now());
                e.freshness = if refetch { pending } else { Freshness::Fresh };
            }
            Err(err) if err.is_connectivity() => {
                debug!("Fetch of {} interrupted: {}", key, err);
                e.freshness = pending;
            }
            Err(err) => {
                debug!("Fetch of {} failed: {}", key, err);
                e.last_error = Some(Arc::new(err));
                e.freshness = if refetch { pending } else { Freshness::Error };
            }
        });
    }

    fn release(&self, key: &QueryKey) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.observers = slot.observers.saturating_sub(1);
        }
    }
}

async fn run_query(handle: &RemoteHandle, key: &QueryKey) -> Result<QueryData> {
    let data = match key {
        QueryKey::AllProducts => QueryData::Products(handle.get_all_products().await?),
        QueryKey::Search(term) if term.trim().is_empty() => QueryData::Products(handle.get_all_products().await?),
        QueryKey::Search(term) => QueryData::Products(handle.search_by_name(term.trim()).await?),
        QueryKey::Category(name) if name == CategoryFilter::ALL_LABEL => {
            QueryData::Products(handle.get_all_products().await?)
        }
        QueryKey::Category(name) => QueryData::Products(handle.filter_by_category(name).await?),
        QueryKey::Product(id) => QueryData::Product(handle.get_product(id).await?),
        QueryKey::Cart => QueryData::Cart(handle.get_caller_cart().await?),
        QueryKey::CartCount => QueryData::Count(handle.get_caller_cart_item_count().await?),
    };
    Ok(data)
}

/// A live observation of one key. Dropping it stops the observation.
pub struct Subscription {
    cache: Arc<QueryCache>,
    key: QueryKey,
    rx: watch::Receiver<CacheEntry>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&mut self) -> CacheEntry {
        self.rx.borrow_and_update().clone()
    }

    /// Waits for the next change and returns the new entry.
    pub async fn changed(&mut self) -> Result<CacheEntry> {
        self.rx.changed().await.map_err(|_| Error::Internal("cache dropped".to_string()))?;
        Ok(self.current())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemMarket;
    use crate::model::{Category, ExternalImage, Identity, Principal, ProductInput};
    use crate::wire::Op;
    use std::time::Duration;

    fn alice() -> Identity {
        Identity::authenticated(Principal::from_bytes(vec![0xa1]))
    }

    fn input(name: &str, category: Category) -> ProductInput {
        ProductInput {
            name: name.to_string(),
            description: "d".to_string(),
            seller_name: "s".to_string(),
            category,
            image: ExternalImage::from_bytes(vec![1]),
            price: 3.0,
        }
    }

    async fn setup() -> (MemMarket, Arc<Gateway>, Arc<QueryCache>) {
        let market = MemMarket::new();
        let gateway = Gateway::new(Arc::new(market.clone()));
        gateway.bind(alice()).await.unwrap();
        let cache = QueryCache::new(gateway.clone());
        (market, gateway, cache)
    }

    #[test]
    fn test_keys_compare_structurally() {
        assert_ne!(QueryKey::Search("shoe".into()), QueryKey::Search("Shoe".into()));
        assert_eq!(QueryKey::Category("Books".into()), QueryKey::Category("Books".into()));
        assert!(QueryKey::CartCount.is_caller_scoped());
        assert!(!QueryKey::Product("p".into()).is_product_listing());
        assert_eq!(QueryKey::Search("a b".into()).to_string(), "products/search/a b");
    }

    #[tokio::test]
    async fn test_repeated_get_issues_one_fetch() {
        let (market, _gw, cache) = setup().await;
        market.set_latency(Duration::from_millis(20));

        let first = cache.get(&QueryKey::AllProducts);
        assert!(first.is_loading());
        let second = cache.get(&QueryKey::AllProducts);
        assert!(second.is_loading());

        cache.fetch(&QueryKey::AllProducts).await.unwrap();
        cache.get(&QueryKey::AllProducts);
        assert_eq!(market.calls(Op::GetAllProducts), 1);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_refetches_before_next_read() {
        let (market, gateway, cache) = setup().await;
        assert!(cache.fetch(&QueryKey::AllProducts).await.unwrap().as_products().unwrap().is_empty());

        gateway.require_handle().unwrap().create_product(input("Lamp", Category::Home)).await.unwrap();
        cache.invalidate(&QueryKey::AllProducts);
        assert_eq!(cache.peek(&QueryKey::AllProducts).unwrap().freshness, Freshness::Stale);

        let data = cache.fetch(&QueryKey::AllProducts).await.unwrap();
        assert_eq!(data.as_products().unwrap().len(), 1);
        assert_eq!(market.calls(Op::GetAllProducts), 2);
    }

    #[tokio::test]
    async fn test_invalidate_unobserved_key_does_not_fetch() {
        let (market, _gw, cache) = setup().await;
        cache.fetch(&QueryKey::Cart).await.unwrap();
        cache.invalidate(&QueryKey::Cart);
        tokio::task::yield_now().await;
        assert_eq!(market.calls(Op::GetCart), 1);

        // Never-read keys are not created by invalidation.
        cache.invalidate(&QueryKey::CartCount);
        assert!(cache.peek(&QueryKey::CartCount).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_observed_key_refetches() {
        let (market, gateway, cache) = setup().await;
        let mut sub = cache.subscribe(&QueryKey::CartCount);
        while sub.current().freshness != Freshness::Fresh {
            sub.changed().await.unwrap();
        }
        let p = gateway.require_handle().unwrap().create_product(input("Lamp", Category::Home)).await.unwrap();
        gateway.require_handle().unwrap().add_to_cart(&p.id, 2).await.unwrap();

        cache.invalidate(&QueryKey::CartCount);
        loop {
            let e = sub.changed().await.unwrap();
            if e.freshness == Freshness::Fresh {
                assert_eq!(e.data.and_then(|d| d.as_count()), Some(2));
                break;
            }
        }
        assert_eq!(market.calls(Op::GetCartCount), 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_triggers_second_fetch() {
        let (market, _gw, cache) = setup().await;
        market.set_latency(Duration::from_millis(20));
        let read = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch(&QueryKey::Cart).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.invalidate(&QueryKey::Cart);

        read.await.unwrap().unwrap();
        assert_eq!(market.calls(Op::GetCart), 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data_and_isolates_keys() {
        let (market, gateway, cache) = setup().await;
        let p = gateway.require_handle().unwrap().create_product(input("Lamp", Category::Home)).await.unwrap();
        let key = QueryKey::Product(p.id.clone());
        cache.fetch(&key).await.unwrap();

        market.fail_next(Op::GetProduct, Error::Internal("backend down".to_string()));
        cache.invalidate(&key);
        let err = cache.fetch(&key).await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));

        let entry = cache.peek(&key).unwrap();
        assert_eq!(entry.freshness, Freshness::Error);
        assert_eq!(entry.data.as_ref().and_then(|d| d.as_product()).map(|p| p.name.as_str()), Some("Lamp"));
        assert!(entry.last_error.is_some());

        // Other keys are unaffected.
        assert!(cache.fetch(&QueryKey::AllProducts).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_ready_without_handle() {
        let gateway = Gateway::new(Arc::new(MemMarket::new()));
        let cache = QueryCache::new(gateway);
        let entry = cache.get(&QueryKey::AllProducts);
        assert_eq!(entry.freshness, Freshness::Idle);
        assert!(matches!(cache.fetch(&QueryKey::AllProducts).await, Err(Error::NotReady)));
    }

    #[tokio::test]
    async fn test_identity_change_resets_caller_scoped_entries() {
        let (market, gateway, cache) = setup().await;
        let _task = cache.attach();
        let p = gateway.require_handle().unwrap().create_product(input("Lamp", Category::Home)).await.unwrap();
        gateway.require_handle().unwrap().add_to_cart(&p.id, 1).await.unwrap();
        assert_eq!(cache.fetch(&QueryKey::CartCount).await.unwrap(), QueryData::Count(1));
        cache.fetch(&QueryKey::AllProducts).await.unwrap();

        gateway.bind(Identity::Anonymous).await.unwrap();
        // Dropped on the first access after the rebind, before any refetch.
        assert_eq!(cache.peek(&QueryKey::CartCount).unwrap().data, None);

        let listing = cache.peek(&QueryKey::AllProducts).unwrap();
        assert_eq!(listing.freshness, Freshness::Stale);
        assert_eq!(listing.products().len(), 1);
        assert_eq!(cache.fetch(&QueryKey::CartCount).await.unwrap(), QueryData::Count(0));
        assert_eq!(market.calls(Op::GetCartCount), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_follows_refetch_across_workers() {
        let (market, _gw, cache) = setup().await;
        cache.fetch(&QueryKey::Cart).await.unwrap();
        market.set_latency(Duration::from_millis(2));

        for _ in 0..25 {
            cache.invalidate(&QueryKey::Cart);
            let read = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.fetch(&QueryKey::Cart).await })
            };
            for _ in 0..2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
                cache.invalidate(&QueryKey::Cart);
            }
            assert!(read.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_refetch_after_completion_is_published_as_loading() {
        let (market, _gw, cache) = setup().await;
        market.set_latency(Duration::from_millis(20));
        let mut sub = cache.subscribe(&QueryKey::Cart);
        assert!(sub.current().is_loading());

        cache.invalidate(&QueryKey::Cart);
        let first = sub.changed().await.unwrap();
        assert_eq!(first.freshness, Freshness::Loading);
        assert!(first.data.is_some());
        assert_eq!(sub.changed().await.unwrap().freshness, Freshness::Fresh);
        assert_eq!(market.calls(Op::GetCart), 2);
    }
}
