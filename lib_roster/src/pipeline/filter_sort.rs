//! # Filter/Sort Pipeline
//!
//! Pure functions from `(names, delays, flags)` to the ordered list a view shows.
//! Output is always a subset of the input in some order; nothing is ever added.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::delay_map::DelayRecord;
use crate::model::{ProxyName, ProxyNode};

/// How far a group's `now` chain is followed when resolving its delay.
const MAX_RESOLVE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortBy {
    /// Keep the order the engine reports.
    #[default]
    Natural,
    LatencyAsc,
    NameAsc,
}

impl FromStr for SortBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "natural" => Ok(SortBy::Natural),
            "latencyasc" | "latency" => Ok(SortBy::LatencyAsc),
            "nameasc" | "name" => Ok(SortBy::NameAsc),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

impl fmt::Display for SortBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortBy::Natural => f.write_str("Natural"),
            SortBy::LatencyAsc => f.write_str("LatencyAsc"),
            SortBy::NameAsc => f.write_str("NameAsc"),
        }
    }
}

/// What the user asked the list to look like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    /// Case-insensitive substring the name must contain; empty matches all.
    pub text: String,
    pub sort_by: SortBy,
    /// Drop names whose delay record is `Error`.
    pub hide_unavailable: bool,
}

/// Delay record that decides where `name` goes.
///
/// With a node map, a group without a record of its own borrows the record of
/// its active member, following nested groups.
pub fn resolve_delay<'a>(
    name: &str,
    delays: &'a HashMap<ProxyName, DelayRecord>,
    proxies: Option<&HashMap<ProxyName, ProxyNode>>,
) -> Option<&'a DelayRecord> {
    let mut current = name;
    for _ in 0..MAX_RESOLVE_DEPTH {
        match delays.get(current) {
            Some(DelayRecord::Untested) | None => {}
            Some(record) => return Some(record),
        }
        match proxies.and_then(|p| p.get(current)).and_then(|n| n.now.as_deref()) {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    delays.get(name)
}

/// `filterAndSort`: hide `Error` names on request, then order.
///
/// `LatencyAsc` is a stable sort: `Result(n)` ascending, everything else after
/// all results in input order.
pub fn filter_and_sort(
    names: &[ProxyName],
    delays: &HashMap<ProxyName, DelayRecord>,
    hide_unavailable: bool,
    sort_by: SortBy,
    proxies: Option<&HashMap<ProxyName, ProxyNode>>,
) -> Vec<ProxyName> {
    let mut kept: Vec<(&ProxyName, Option<&DelayRecord>)> = names
        .iter()
        .map(|n| (n, resolve_delay(n, delays, proxies)))
        .filter(|(_, record)| !(hide_unavailable && record.is_some_and(DelayRecord::is_error)))
        .collect();

    match sort_by {
        SortBy::Natural => {}
        SortBy::NameAsc => kept.sort_by(|a, b| a.0.cmp(b.0)),
        SortBy::LatencyAsc => kept.sort_by(|a, b| latency_order(a.1, b.1)),
    }

    kept.into_iter().map(|(n, _)| n.clone()).collect()
}

fn latency_order(a: Option<&DelayRecord>, b: Option<&DelayRecord>) -> Ordering {
    match (a.and_then(DelayRecord::millis), b.and_then(DelayRecord::millis)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// `filter_and_sort` after the text filter of `state`.
pub fn apply_filter_state(
    names: &[ProxyName],
    delays: &HashMap<ProxyName, DelayRecord>,
    state: &FilterState,
    proxies: Option<&HashMap<ProxyName, ProxyNode>>,
) -> Vec<ProxyName> {
    let needle = state.text.trim().to_lowercase();
    if needle.is_empty() {
        return filter_and_sort(names, delays, state.hide_unavailable, state.sort_by, proxies);
    }
    let matching: Vec<ProxyName> = names
        .iter()
        .filter(|n| n.to_lowercase().contains(&needle))
        .cloned()
        .collect();
    filter_and_sort(&matching, delays, state.hide_unavailable, state.sort_by, proxies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<ProxyName> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn delays(entries: &[(&str, DelayRecord)]) -> HashMap<ProxyName, DelayRecord> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn scenario_latency_then_testing_then_error() {
        let d = delays(&[
            ("A", DelayRecord::Result(150)),
            ("B", DelayRecord::Testing),
            ("C", DelayRecord::Error("timeout".into())),
        ]);
        let input = names(&["C", "B", "A"]);

        assert_eq!(filter_and_sort(&input, &d, false, SortBy::LatencyAsc, None), names(&["A", "C", "B"]));
        let input = names(&["A", "B", "C"]);
        assert_eq!(filter_and_sort(&input, &d, false, SortBy::LatencyAsc, None), names(&["A", "B", "C"]));
        assert_eq!(filter_and_sort(&input, &d, true, SortBy::LatencyAsc, None), names(&["A", "B"]));
    }

    #[test]
    fn latency_sort_is_stable_and_pushes_non_results_back_in_order() {
        let d = delays(&[
            ("p1", DelayRecord::Error("x".into())),
            ("p2", DelayRecord::Result(300)),
            ("p3", DelayRecord::Testing),
            ("p4", DelayRecord::Result(80)),
            ("p5", DelayRecord::Result(300)),
        ]);
        let input = names(&["p1", "p2", "p3", "p4", "p5", "p6"]);

        let out = filter_and_sort(&input, &d, false, SortBy::LatencyAsc, None);
        assert_eq!(out, names(&["p4", "p2", "p5", "p1", "p3", "p6"]));
    }

    #[test]
    fn natural_keeps_order_and_name_sorts_lexicographically() {
        let input = names(&["b", "a", "C"]);
        let d = HashMap::new();
        assert_eq!(filter_and_sort(&input, &d, false, SortBy::Natural, None), input);
        assert_eq!(filter_and_sort(&input, &d, false, SortBy::NameAsc, None), names(&["C", "a", "b"]));
    }

    #[test]
    fn hide_unavailable_toggling_is_idempotent() {
        let d = delays(&[("b", DelayRecord::Error("e".into())), ("d", DelayRecord::Error("e".into()))]);
        let input = names(&["a", "b", "c", "d", "e"]);

        let first = filter_and_sort(&input, &d, true, SortBy::Natural, None);
        let shown = filter_and_sort(&input, &d, false, SortBy::Natural, None);
        let again = filter_and_sort(&input, &d, true, SortBy::Natural, None);

        assert_eq!(first, names(&["a", "c", "e"]));
        assert_eq!(shown, input);
        assert_eq!(first, again);
    }

    #[test]
    fn output_never_introduces_names() {
        let d = delays(&[("x", DelayRecord::Result(1)), ("ghost", DelayRecord::Result(0))]);
        let input = names(&["y", "x"]);
        for sort_by in [SortBy::Natural, SortBy::LatencyAsc, SortBy::NameAsc] {
            for hide in [true, false] {
                let out = filter_and_sort(&input, &d, hide, sort_by, None);
                assert!(out.len() <= input.len());
                assert!(out.iter().all(|n| input.contains(n)));
            }
        }
    }

    #[test]
    fn groups_borrow_the_delay_of_their_active_member() {
        let mut proxies = HashMap::new();
        proxies.insert(
            "Auto".to_string(),
            ProxyNode {
                name: "Auto".into(),
                kind: "URLTest".into(),
                all: Some(names(&["fast", "slow"])),
                now: Some("fast".into()),
                udp: false,
                history: vec![],
            },
        );
        let d = delays(&[("fast", DelayRecord::Result(20)), ("slow", DelayRecord::Result(90)), ("dead", DelayRecord::Error("x".into()))]);
        let input = names(&["slow", "Auto", "dead"]);

        let out = filter_and_sort(&input, &d, true, SortBy::LatencyAsc, Some(&proxies));
        assert_eq!(out, names(&["Auto", "slow"]));
    }

    #[test]
    fn self_referencing_group_does_not_loop() {
        let mut proxies = HashMap::new();
        proxies.insert(
            "Loop".to_string(),
            ProxyNode { name: "Loop".into(), kind: "Selector".into(), all: Some(names(&["Loop"])), now: Some("Loop".into()), udp: false, history: vec![] },
        );
        assert_eq!(resolve_delay("Loop", &HashMap::new(), Some(&proxies)), None);
    }

    #[test]
    fn text_filter_is_case_insensitive() {
        let state = FilterState { text: " tok ".into(), sort_by: SortBy::NameAsc, hide_unavailable: false };
        let input = names(&["US 01", "JP Tokyo 02", "jp tokyo 01"]);
        assert_eq!(apply_filter_state(&input, &HashMap::new(), &state, None), names(&["JP Tokyo 02", "jp tokyo 01"]));
    }

    #[test]
    fn sort_by_parses_loose_spellings() {
        assert_eq!("latency-asc".parse::<SortBy>().unwrap(), SortBy::LatencyAsc);
        assert_eq!("NameAsc".parse::<SortBy>().unwrap(), SortBy::NameAsc);
        assert!("fastest".parse::<SortBy>().is_err());
    }
}
