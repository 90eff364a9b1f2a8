//! The catalog listing: whatever the selector marks active, read through the cache.

use std::sync::Arc;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{CacheEntry, Freshness, QueryCache, QueryKey};
use crate::model::Product;
use crate::selector::{SearchSelector, SelectorState};

/// What the catalog shows at one instant.
#[derive(Clone, Debug)]
pub struct CatalogSnapshot {
    pub view: QueryKey,
    pub entry: CacheEntry,
}

impl CatalogSnapshot {
    pub fn products(&self) -> &[Product] {
        self.entry.products()
    }

    /// True while the first result for the active view is still on its way.
    pub fn is_loading(&self) -> bool {
        self.entry.data.is_none() && matches!(self.entry.freshness, Freshness::Idle | Freshness::Loading | Freshness::Stale)
    }
}

/// Keeps one cache subscription open for the active view and follows the
/// selector as it changes.
///
/// Results of fetches for views that are no longer active stay in the cache
/// but are never published here.
pub struct CatalogView {
    selector: Arc<SearchSelector>,
    cache: Arc<QueryCache>,
    updates: watch::Receiver<CatalogSnapshot>,
    task: JoinHandle<()>,
}

enum Event {
    Selection,
    Entry,
    Closed,
}

impl CatalogView {
    pub fn new(selector: Arc<SearchSelector>, cache: Arc<QueryCache>) -> Self {
        let mut selection = selector.subscribe();
        let key = selection.borrow_and_update().active_view();
        let mut sub = cache.subscribe(&key);
        let (tx, updates) = watch::channel(CatalogSnapshot {
            view: key,
            entry: sub.current(),
        });

        let task_cache = Arc::clone(&cache);
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    r = selection.changed() => if r.is_ok() { Event::Selection } else { Event::Closed },
                    r = sub.changed() => if r.is_ok() { Event::Entry } else { Event::Closed },
                };
                match event {
                    Event::Closed => break,
                    Event::Selection => {
                        let key = view_of(&mut selection);
                        if &key == sub.key() {
                            continue;
                        }
                        debug!("Catalog switching to {}", key);
                        sub = task_cache.subscribe(&key);
                    }
                    Event::Entry => {}
                }
                tx.send_replace(CatalogSnapshot {
                    view: sub.key().clone(),
                    entry: sub.current(),
                });
            }
        });

        Self {
            selector,
            cache,
            updates,
            task,
        }
    }

    /// The listing for the selector's current view, read from the cache now.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let view = self.selector.active_view();
        let entry = self.cache.get(&view);
        CatalogSnapshot { view, entry }
    }

    /// Waits for the next published change and returns it.
    pub async fn changed(&mut self) -> Option<CatalogSnapshot> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<CatalogSnapshot> {
        self.updates.clone()
    }

    pub fn selector(&self) -> &SearchSelector {
        &self.selector
    }
}

impl Drop for CatalogView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn view_of(selection: &mut watch::Receiver<SelectorState>) -> QueryKey {
    selection.borrow_and_update().active_view()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemMarket;
    use crate::gateway::Gateway;
    use crate::model::{Category, CategoryFilter, Identity};
    use crate::wire::Op;
    use std::time::Duration;

    async fn setup(debounce: Duration) -> (MemMarket, Arc<QueryCache>, CatalogView) {
        let market = MemMarket::new();
        market.seed_demo();
        let gateway = Gateway::new(Arc::new(market.clone()));
        gateway.bind(Identity::Anonymous).await.unwrap();
        let cache = QueryCache::new(gateway);
        let selector = Arc::new(SearchSelector::new(debounce));
        let view = CatalogView::new(selector, cache.clone());
        (market, cache, view)
    }

    async fn settle(view: &mut CatalogView, key: QueryKey) -> CatalogSnapshot {
        loop {
            let snap = view.changed().await.unwrap();
            if snap.view == key && snap.entry.freshness == Freshness::Fresh {
                return snap;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_settled_term_is_fetched() {
        let (market, _cache, mut view) = setup(Duration::from_millis(350)).await;
        settle(&mut view, QueryKey::AllProducts).await;

        view.selector().set_search_text("sho");
        tokio::time::sleep(Duration::from_millis(100)).await;
        view.selector().set_search_text("shoe");

        let snap = settle(&mut view, QueryKey::Search("shoe".into())).await;
        assert_eq!(snap.products().len(), 1);
        assert_eq!(market.calls(Op::SearchByName), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_view_follows_selection() {
        let (market, cache, mut view) = setup(Duration::from_millis(350)).await;
        settle(&mut view, QueryKey::AllProducts).await;

        view.selector().select_category(CategoryFilter::Only(Category::Books));
        let snap = settle(&mut view, QueryKey::Category("Books".into())).await;
        assert!(snap.products().iter().all(|p| p.category == Category::Books));
        assert_eq!(market.calls(Op::FilterByCategory), 1);

        // Switching back reads the cached listing without a refetch.
        view.selector().select_category(CategoryFilter::All);
        let snap = view.snapshot();
        assert_eq!(snap.view, QueryKey::AllProducts);
        assert_eq!(snap.products().len(), 5);
        assert_eq!(cache.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reads_active_key() {
        let (_market, _cache, view) = setup(Duration::from_millis(350)).await;
        view.selector().select_category_label("Sports");
        let snap = view.snapshot();
        assert_eq!(snap.view, QueryKey::Category("Sports".into()));
        assert!(snap.is_loading());
    }
}
