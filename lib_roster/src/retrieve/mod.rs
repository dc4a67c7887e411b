//! # Data Retrieval Module
//!
//! HTTP access to the proxy engine's control API. Everything that leaves the
//! process goes through `control_api::ControlApi`, so retry policy, bearer
//! authentication and error-body handling live in one place.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Control API client with retrying roster queries.
pub mod control_api;

pub use control_api::{ApiConfig, ApiResponse, ControlApi, QueryRetry};
