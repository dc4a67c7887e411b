//! # Delay State Map
//!
//! Per-proxy latency state shared by the store, the probe orchestrator and every
//! reader of the filter pipeline.
//!
//! The map itself is an immutable `Arc<HashMap>`. Writers build the next map with
//! the pure [`reduce`] function and swap it in, so a reader holding a snapshot
//! never sees a half-applied batch and concurrent probes of unrelated scopes
//! never clobber each other's keys.
//!
//! Writes are gated on the current roster: a name the roster does not contain is
//! silently dropped. This is how results of a probe that outlived its roster
//! (a refetch removed the proxy) are discarded without transport cancellation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::model::ProxyName;

/// Latency state of one proxy.
///
/// `Untested → Testing → Result | Error`, and any settled record goes back to
/// `Testing` on the next probe. There is no terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value")]
pub enum DelayRecord {
    #[default]
    Untested,
    Testing,
    /// Round trip in milliseconds.
    Result(u32),
    Error(String),
}

impl DelayRecord {
    pub fn is_error(&self) -> bool {
        matches!(self, DelayRecord::Error(_))
    }

    /// Milliseconds for a settled, successful probe.
    pub fn millis(&self) -> Option<u32> {
        match self {
            DelayRecord::Result(ms) => Some(*ms),
            _ => None,
        }
    }
}

impl fmt::Display for DelayRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayRecord::Untested => f.write_str("-"),
            DelayRecord::Testing => f.write_str("testing"),
            DelayRecord::Result(ms) => write!(f, "{}ms", ms),
            DelayRecord::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Immutable view of the whole map at one instant.
pub type DelaySnapshot = Arc<HashMap<ProxyName, DelayRecord>>;

/// Everything that may change the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayAction {
    /// A probe is starting for these names.
    MarkTesting(Vec<ProxyName>),
    /// Final records for some names of a probe.
    Settle(Vec<(ProxyName, DelayRecord)>),
}

/// Applies `action` on top of `current`, keeping only names `is_live` accepts.
///
/// Returns `None` when nothing would change, so callers can skip the swap.
pub fn reduce<F>(current: &HashMap<ProxyName, DelayRecord>, action: DelayAction, is_live: F) -> Option<HashMap<ProxyName, DelayRecord>>
where
    F: Fn(&str) -> bool,
{
    let updates: Vec<(ProxyName, DelayRecord)> = match action {
        DelayAction::MarkTesting(names) => names.into_iter().map(|n| (n, DelayRecord::Testing)).collect(),
        DelayAction::Settle(records) => records,
    };

    let mut next: Option<HashMap<ProxyName, DelayRecord>> = None;
    for (name, record) in updates {
        if !is_live(&name) {
            continue;
        }
        if next.as_ref().unwrap_or(current).get(&name) == Some(&record) {
            continue;
        }
        next.get_or_insert_with(|| current.clone()).insert(name, record);
    }
    next
}

/// Shared, copy-on-write delay state.
#[derive(Default)]
pub struct DelayMap {
    records: RwLock<DelaySnapshot>,
    /// Names of the adopted roster; `None` until the first roster lands.
    roster: RwLock<Option<Arc<HashSet<ProxyName>>>>,
}

impl DelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of every key.
    pub fn snapshot(&self) -> DelaySnapshot {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Record for `name`, `Untested` when absent.
    pub fn get(&self, name: &str) -> DelayRecord {
        self.snapshot().get(name).cloned().unwrap_or_default()
    }

    /// Replaces the set of names writes are accepted for. Existing records are kept.
    pub fn set_roster<I>(&self, names: I)
    where
        I: IntoIterator<Item = ProxyName>,
    {
        let names: HashSet<ProxyName> = names.into_iter().collect();
        *self.roster.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(names));
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| r.contains(name))
    }

    /// Read-merge-swap under the write lock. Returns whether the map changed.
    pub fn apply(&self, action: DelayAction) -> bool {
        let roster = self.roster.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(roster) = roster else {
            log::debug!("Delay update dropped, no roster adopted yet");
            return false;
        };

        let mut guard = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match reduce(&guard, action, |name| roster.contains(name)) {
            Some(next) => {
                *guard = Arc::new(next);
                true
            }
            None => false,
        }
    }

    pub fn mark_testing(&self, names: &[ProxyName]) -> bool {
        self.apply(DelayAction::MarkTesting(names.to_vec()))
    }

    pub fn settle(&self, records: Vec<(ProxyName, DelayRecord)>) -> bool {
        self.apply(DelayAction::Settle(records))
    }
}
