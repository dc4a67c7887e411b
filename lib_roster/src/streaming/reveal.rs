//! # Streaming Reveal
//!
//! Exposes a long list in timed batches so the first rows show up at once and
//! the rest trickle in without blocking anything else on the runtime.
//!
//! A new source list (different allocation or length) starts a new cycle:
//! `visible_count` drops to 0, and after `initial_delay` grows by `batch_size`
//! every `inter_batch_delay` until it reaches the list length. Each cycle owns a
//! `CancellationToken` and a generation number; the state is only published while
//! the generation is still current, so nothing from a superseded or torn-down
//! cycle can land.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub inter_batch_delay: Duration,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: 12,
            inter_batch_delay: Duration::from_millis(30),
            initial_delay: Duration::from_millis(50),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// The visible counts of one cycle: `batch, 2 * batch, ..`, clamped to `total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealPlan {
    total: usize,
    batch: usize,
    visible: usize,
}

impl RevealPlan {
    pub fn new(total: usize, batch_size: usize) -> Self {
        Self { total, batch: batch_size.max(1), visible: 0 }
    }

    /// Starts over for a list of `total` items.
    pub fn restart(&mut self, total: usize) {
        self.total = total;
        self.visible = 0;
    }

    pub fn visible(&self) -> usize {
        self.visible
    }

    pub fn is_done(&self) -> bool {
        self.visible >= self.total
    }
}

impl Iterator for RevealPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.is_done() {
            return None;
        }
        self.visible = (self.visible + self.batch).min(self.total);
        Some(self.visible)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevealState {
    pub visible_count: usize,
    pub is_loading: bool,
}

struct Publisher {
    generation: Mutex<u64>,
    state: watch::Sender<RevealState>,
}

impl Publisher {
    /// Publishes `state` if `generation` is still the current cycle.
    fn publish(&self, generation: u64, state: RevealState) -> bool {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Invalidates the running cycle and returns the new generation.
    fn advance(&self) -> u64 {
        let mut current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *current += 1;
        *current
    }
}

pub struct StreamingReveal<T> {
    config: StreamingConfig,
    source: Option<Arc<[T]>>,
    publisher: Arc<Publisher>,
    cycle: Option<CancellationToken>,
}

impl<T: Send + Sync + 'static> StreamingReveal<T> {
    pub fn new(config: StreamingConfig) -> Self {
        let (state, _) = watch::channel(RevealState::default());
        Self {
            config,
            source: None,
            publisher: Arc::new(Publisher { generation: Mutex::new(0), state }),
            cycle: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RevealState> {
        self.publisher.state.subscribe()
    }

    pub fn state(&self) -> RevealState {
        *self.publisher.state.borrow()
    }

    /// The currently revealed prefix of the source.
    pub fn visible(&self) -> &[T] {
        match &self.source {
            Some(items) => &items[..self.state().visible_count.min(items.len())],
            None => &[],
        }
    }

    /// Swaps in `items`. Returns `false` when it is the list already shown, in
    /// which case the running cycle continues. After `teardown` even the same
    /// list starts a new cycle. Must be called inside a tokio runtime.
    pub fn set_source(&mut self, items: Arc<[T]>) -> bool {
        if let Some(current) = &self.source {
            let live = self.cycle.is_some() || current.is_empty();
            if live && Arc::ptr_eq(current, &items) && current.len() == items.len() {
                return false;
            }
        }

        let generation = self.stop_cycle();
        let total = items.len();
        self.source = Some(items);

        if total == 0 {
            self.publisher.publish(generation, RevealState { visible_count: 0, is_loading: false });
            return true;
        }
        self.publisher.publish(generation, RevealState { visible_count: 0, is_loading: true });

        let token = CancellationToken::new();
        self.cycle = Some(token.clone());
        let publisher = Arc::clone(&self.publisher);
        let config = self.config;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(config.initial_delay) => {}
            }

            let mut plan = RevealPlan::new(total, config.batch_size);
            while let Some(visible_count) = plan.next() {
                // Let anything already queued run before the next batch shows up.
                tokio::task::yield_now().await;
                let state = RevealState { visible_count, is_loading: !plan.is_done() };
                if !publisher.publish(generation, state) {
                    return;
                }
                if plan.is_done() {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(config.inter_batch_delay) => {}
                }
            }
            log::trace!("Reveal cycle {} finished at {} item(s)", generation, total);
        });
        true
    }

    /// Cancels the running cycle; the last published state and `visible` stay
    /// as they are until the next `set_source`.
    pub fn teardown(&mut self) {
        self.stop_cycle();
    }

    fn stop_cycle(&mut self) -> u64 {
        if let Some(token) = self.cycle.take() {
            token.cancel();
        }
        self.publisher.advance()
    }
}

impl<T> Drop for StreamingReveal<T> {
    fn drop(&mut self) {
        if let Some(token) = self.cycle.take() {
            token.cancel();
        }
        self.publisher.advance();
    }
}
