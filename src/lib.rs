//! # Proxy Activity Log

//! Records every HTTP request passing through an intercepting proxy into a
//! durable store, for later audit of what was sent to a target.
//!
//! ## Features
//!
//! - Request/response correlation by host transaction id
//! - Live filtering (pause, scope, image resources, tool source)
//! - Embedded SQLite store with relocation, or remote PostgreSQL
//! - Streaming statistics seeded from the store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Host proxy (callbacks + UI)                 │
//! ├─────────────────────────────────────────────────────────┤
//! │                    ActivityRecorder                      │
//! │  ┌─────────┐  ┌────────────┐  ┌────────┐  ┌──────────┐  │
//! │  │ Filter  │──│ Correlator │──│ Writer │──│ Storage  │  │
//! │  │         │  │            │  │  task  │  │ backend  │  │
//! │  └─────────┘  └────────────┘  └────────┘  └──────────┘  │
//! │                                    │                     │
//! │                               ┌─────────┐                │
//! │                               │  Stats  │                │
//! │                               └─────────┘                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod correlator;
pub mod error;
pub mod filter;
pub mod models;
pub mod recorder;
pub mod settings;
pub mod stats;
pub mod storage;

pub use error::{RecorderError, StorageError};
pub use recorder::{ActivityRecorder, AllInScope, RecorderStatus, ScopeOracle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
