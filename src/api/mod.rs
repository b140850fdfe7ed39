//! Host-facing entry points
//!
//! Process-wide set-up (logging) and convenience constructors for hosts that
//! keep their preferences in a JSON file.

pub mod recorder_api;

pub use recorder_api::{get_version, init_logging, start_recorder};
