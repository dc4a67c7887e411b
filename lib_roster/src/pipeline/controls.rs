//! Filter controls shared between a front end and the views it renders.
//!
//! Sort order and the hide-unavailable toggle apply immediately; search text is
//! debounced so every keystroke does not re-run the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::pipeline::filter_sort::{FilterState, SortBy};
use crate::streaming::debounce::Debouncer;

/// Quiet period before typed search text takes effect.
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);

pub struct FilterControls {
    state: Arc<watch::Sender<FilterState>>,
    search: Debouncer<String>,
}

impl FilterControls {
    /// Must be called inside a tokio runtime.
    pub fn new(initial: FilterState, quiet: Duration) -> Self {
        let (tx, _) = watch::channel(initial);
        let state = Arc::new(tx);
        let sink_state = Arc::clone(&state);
        let search = Debouncer::new(quiet, move |text: String| {
            sink_state.send_if_modified(|s| {
                if s.text == text {
                    return false;
                }
                s.text = text;
                true
            });
        });
        Self { state, search }
    }

    pub fn subscribe(&self) -> watch::Receiver<FilterState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> FilterState {
        self.state.borrow().clone()
    }

    pub fn set_search_text(&self, text: impl Into<String>) {
        self.search.emit(text.into());
    }

    pub fn set_sort_by(&self, sort_by: SortBy) {
        self.state.send_if_modified(|s| std::mem::replace(&mut s.sort_by, sort_by) != sort_by);
    }

    pub fn set_hide_unavailable(&self, hide: bool) {
        self.state.send_if_modified(|s| std::mem::replace(&mut s.hide_unavailable, hide) != hide);
    }
}
