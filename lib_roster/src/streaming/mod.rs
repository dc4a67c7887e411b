//! # Streaming Render Scheduler
//!
//! Timer-driven helpers for front ends: batch reveal of long lists and a
//! debounced emitter. Both cancel their pending timers when dropped.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Incremental reveal of a list in timed batches.
pub mod reveal;
/// Quiet-period debouncing with cancel-on-drop.
pub mod debounce;

pub use reveal::{RevealPlan, RevealState, StreamingConfig, StreamingReveal};
pub use debounce::Debouncer;
