//! Data models for the activity recorder
//!
//! Events are handed between components by value; nothing here is shared
//! mutably across threads.

pub mod config;
pub mod event;
pub mod stats;

pub use config::*;
pub use event::*;
pub use stats::*;
