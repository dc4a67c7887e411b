//! Last-result cache for the filter/sort pipeline.
//!
//! Inputs are compared by value, but only the delay records that can affect the
//! output (the resolved record of each input name) take part in the comparison.
//! While nothing relevant changed the same `Arc` is handed back, so a streaming
//! reveal fed from it does not restart.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::delay_map::DelayRecord;
use crate::model::{ProxyName, ProxyNode};
use crate::pipeline::filter_sort::{apply_filter_state, resolve_delay, FilterState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemoKey {
    names: Vec<ProxyName>,
    records: Vec<Option<DelayRecord>>,
    state: FilterState,
}

#[derive(Debug, Default)]
pub struct FilterMemo {
    last: Option<(MemoKey, Arc<[ProxyName]>)>,
    hits: u64,
    misses: u64,
}

impl FilterMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(
        &mut self,
        names: &[ProxyName],
        delays: &HashMap<ProxyName, DelayRecord>,
        state: &FilterState,
        proxies: Option<&HashMap<ProxyName, ProxyNode>>,
    ) -> Arc<[ProxyName]> {
        let key = MemoKey {
            names: names.to_vec(),
            records: names.iter().map(|n| resolve_delay(n, delays, proxies).cloned()).collect(),
            state: state.clone(),
        };

        if let Some((seen, out)) = &self.last {
            if *seen == key {
                self.hits += 1;
                return Arc::clone(out);
            }
        }

        self.misses += 1;
        let out: Arc<[ProxyName]> = apply_filter_state(names, delays, state, proxies).into();
        self.last = Some((key, Arc::clone(&out)));
        out
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::filter_sort::SortBy;

    fn names(list: &[&str]) -> Vec<ProxyName> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unchanged_inputs_return_same_allocation() {
        let mut memo = FilterMemo::new();
        let input = names(&["A", "B"]);
        let mut delays = HashMap::new();
        delays.insert("A".to_string(), DelayRecord::Result(10));
        let state = FilterState { sort_by: SortBy::LatencyAsc, ..FilterState::default() };

        let first = memo.get_or_compute(&input, &delays, &state, None);
        // An unrelated key changing does not matter.
        delays.insert("Z".to_string(), DelayRecord::Testing);
        let second = memo.get_or_compute(&input, &delays, &state, None);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memo.stats(), (1, 1));
    }

    #[test]
    fn relevant_change_recomputes() {
        let mut memo = FilterMemo::new();
        let input = names(&["A", "B"]);
        let mut delays = HashMap::new();
        delays.insert("A".to_string(), DelayRecord::Result(300));
        let state = FilterState { sort_by: SortBy::LatencyAsc, ..FilterState::default() };

        let first = memo.get_or_compute(&input, &delays, &state, None);
        delays.insert("B".to_string(), DelayRecord::Result(20));
        let second = memo.get_or_compute(&input, &delays, &state, None);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(&*second, &names(&["B", "A"])[..]);

        let hidden = memo.get_or_compute(&input, &delays, &FilterState { text: "b".into(), ..state }, None);
        assert_eq!(&*hidden, &names(&["B"])[..]);
    }
}
