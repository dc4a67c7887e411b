//! # lib_roster
//!
//! Mirrors the live state of a Clash-style proxy engine through its REST control
//! API and keeps what a dashboard needs next to it: normalized groups and
//! providers, per-proxy latency state, filtered and sorted member lists, batched
//! reveal of long lists and expand/collapse flags.
//!
//! The roster core, pipeline and streaming modules are always built. Logging and
//! layered configuration sit behind the `loggers` and `configs` features.

pub mod error;
pub mod model;
pub mod retrieve;
pub mod core;
pub mod pipeline;
pub mod streaming;

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(test)]
mod test_utils;

// Re-export the types most callers need.
pub use crate::core::{Action, ActionOutcome, DelayRecord, FetchOutcome, ProbeOutcome, ProxyStore, StoreSettings};
pub use error::{RosterError, RosterResult};
pub use model::{ProxyGroup, ProxyName, ProxyNode, ProxyProvider, RosterSnapshot};
pub use pipeline::{FilterState, SortBy};
pub use retrieve::{ApiConfig, ControlApi, QueryRetry};
pub use streaming::{StreamingConfig, StreamingReveal};
