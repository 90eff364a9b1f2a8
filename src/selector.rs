//! Search and category selection for the catalog.
//!
//! Three inputs (raw search text, the debounced term and the selected
//! category) decide which single listing is shown. The debounce timer is an
//! explicit task owned by the selector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::QueryKey;
use crate::model::{Category, CategoryFilter};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(350);

/// Inputs of the selector at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorState {
    pub raw: String,
    pub debounced: String,
    pub category: CategoryFilter,
}

impl SelectorState {
    pub fn active_view(&self) -> QueryKey {
        active_view(&self.raw, &self.debounced, &self.category)
    }
}

/// The listing to show for the given inputs.
///
/// A chosen category wins. Otherwise a settled search term is shown while the
/// box still holds text, and an empty box shows everything right away.
pub fn active_view(raw: &str, debounced: &str, category: &CategoryFilter) -> QueryKey {
    if let CategoryFilter::Only(c) = category {
        return QueryKey::Category(c.as_str().to_string());
    }
    let term = debounced.trim();
    if term.is_empty() || raw.trim().is_empty() {
        QueryKey::AllProducts
    } else {
        QueryKey::Search(term.to_string())
    }
}

/// Debounced, mutually exclusive search/category selection.
pub struct SearchSelector {
    debounce: Duration,
    state: Arc<watch::Sender<SelectorState>>,
    epoch: Arc<AtomicU64>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl SearchSelector {
    pub fn new(debounce: Duration) -> Self {
        let (state, _) = watch::channel(SelectorState::default());
        Self {
            debounce,
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
        }
    }

    /// Records typed text and restarts the debounce timer.
    ///
    /// Any non-empty text returns the category to "All" in the same update as
    /// the keystroke. The term itself becomes active when the timer fires.
    pub fn set_search_text(&self, text: &str) {
        let changed = self.state.send_if_modified(|s| {
            if s.raw == text {
                return false;
            }
            s.raw = text.to_string();
            if !text.is_empty() {
                s.category = CategoryFilter::All;
            }
            true
        });
        if !changed {
            return;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.epoch);
        let delay = self.debounce;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.send_if_modified(|s| {
                if current.load(Ordering::SeqCst) != epoch {
                    return false;
                }
                let term = s.raw.trim().to_string();
                debug!("Search term settled on {:?}", term);
                if s.debounced == term {
                    return false;
                }
                s.debounced = term;
                true
            });
        });
        self.replace_pending(Some(task));
    }

    /// Selects a category. Clears search text and cancels a pending debounce.
    pub fn select_category(&self, category: CategoryFilter) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.replace_pending(None);
        self.state.send_if_modified(|s| {
            let next = SelectorState {
                raw: String::new(),
                debounced: String::new(),
                category,
            };
            if *s == next {
                return false;
            }
            *s = next;
            true
        });
    }

    /// Selects a category by its label. "All" and unknown labels select everything.
    pub fn select_category_label(&self, label: &str) {
        let filter = label
            .parse::<Category>()
            .map(CategoryFilter::Only)
            .unwrap_or_default();
        self.select_category(filter);
    }

    pub fn state(&self) -> SelectorState {
        self.state.borrow().clone()
    }

    pub fn active_view(&self) -> QueryKey {
        self.state.borrow().active_view()
    }

    pub fn subscribe(&self) -> watch::Receiver<SelectorState> {
        self.state.subscribe()
    }

    fn replace_pending(&self, task: Option<JoinHandle<()>>) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(old) = pending.take() {
            old.abort();
        }
        *pending = task;
    }
}

impl Default for SearchSelector {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl Drop for SearchSelector {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(task) = pending.take() {
                task.abort();
            }
        }
    }
}
