//! # Filter/Sort Pipeline
//!
//! Turns a member list plus the current delay snapshot into what a view shows.
//!
//! - **`filter_sort`**: the pure pipeline (`filter_and_sort`, `apply_filter_state`).
//! - **`memo`**: last-result cache keyed by value.
//! - **`controls`**: user-facing filter state with debounced search text.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod filter_sort;
pub mod memo;
pub mod controls;

pub use filter_sort::{apply_filter_state, filter_and_sort, resolve_delay, FilterState, SortBy};
pub use memo::FilterMemo;
pub use controls::{FilterControls, SEARCH_DEBOUNCE};
