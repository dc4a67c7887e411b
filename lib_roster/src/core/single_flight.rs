//! # Single-Flight Guard
//!
//! At most one operation per scope key at a time. `try_acquire` hands back a
//! `FlightGuard` whose `Drop` releases the key, so the key is released on every
//! exit path of the holder (return, `?`, panic unwinding).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default, Clone)]
pub struct SingleFlight {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`, or returns `None` if another holder has it.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard { key: key.to_string(), in_flight: Arc::clone(&self.in_flight) })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).contains(key)
    }
}

/// Releases its key when dropped.
pub struct FlightGuard {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}
