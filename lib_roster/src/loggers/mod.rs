/// fern dispatcher setup and log file pruning.
pub mod setup;

pub use setup::{cleanup_old_logs, parse_level, setup_logging, LoggingError};
