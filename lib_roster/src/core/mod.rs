//! # Core Roster Engine
//!
//! The session state behind a proxy dashboard. Everything here is asynchronous
//! and thread-safe; shared maps are copy-on-write `Arc`s behind short-lived locks.
//!
//! ## Core Components:
//!
//! - **`delay_map`**: Per-proxy latency state (`Untested`, `Testing`, `Result`,
//!   `Error`), updated only through a pure reducer and only for names in the
//!   current roster.
//!
//! - **`single_flight`**: RAII guard that allows one operation per scope key.
//!
//! - **`latency`**: The probe orchestrator. Marks a scope `Testing`, fans probes
//!   out under a process-wide cap, settles each member, and swallows batch failures.
//!
//! - **`collapsible`**: Expand/collapse flags per group and provider.
//!
//! - **`connections`**: Closes connections left on a member after a group switch.
//!
//! - **`roster`**: The `ProxyStore`. Fetches and normalizes the roster (latest
//!   fetch wins), switches groups, runs provider health checks and exposes
//!   selectors plus an `Action` dispatcher.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Keyed latency state with a reducer-style update path.
pub mod delay_map;
/// At-most-one-in-flight guard per scope key.
pub mod single_flight;
/// Batched latency probes with single-flight and a global concurrency cap.
pub mod latency;
/// Expand/collapse state for groups and providers.
pub mod collapsible;
/// Post-switch connection cleanup.
pub mod connections;
/// The roster store, its selectors and its action dispatcher.
pub mod roster;

// --- Public API Re-exports ---
pub use delay_map::{DelayAction, DelayMap, DelayRecord, DelaySnapshot};
pub use single_flight::{FlightGuard, SingleFlight};
pub use latency::{BatchReport, LatencyOrchestrator, ProbeOutcome, ProbeScope, ProbeSettings, ProbeTransport, DEFAULT_TEST_URL};
pub use collapsible::{CollapsibleAction, CollapsibleCategory, CollapsibleDefaults, CollapsibleState};
pub use connections::ConnectionCloser;
pub use roster::{Action, ActionOutcome, FetchOutcome, ProxyStore, StoreSettings, SwitchOutcome};
