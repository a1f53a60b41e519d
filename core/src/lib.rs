//! # flowscope core
//!
//! Indexing and delivery engine behind the flowscope HTTP(S) traffic
//! inspector. A capture component (a proxy addon, a browser extension) posts
//! finished request/response pairs here; viewers list, filter and inspect them
//! and receive new ones live.
//!
//! ## Features
//!
//! - Bounded SQLite flow store with a free-form filter predicate
//! - Glob/substring include and exclude scope with optional drop-on-ingest
//! - Short-lived replay tokens and a stateless repeat client
//! - Per-subscriber bounded live event fan-out over server-sent events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   POST /api/ingest   ┌───────────────┐
//! │   capture    │ ───────────────────▶ │ IngestGateway │
//! └──────────────┘                      └──────┬────────┘
//!                                 upsert       │      publish
//!                          ┌───────────────────┴──────────────┐
//!                          ▼                                  ▼
//!                    ┌───────────┐                      ┌──────────┐
//!                    │ FlowStore │                      │ EventBus │──▶ SSE viewers
//!                    └───────────┘                      └──────────┘
//!        ScopeMatcher (in-memory, versioned)    ReplayCache (TTL tokens)
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod replay;
pub mod scope;
pub mod service;
pub mod storage;

pub use config::ServiceConfig;
pub use error::{CoreError, CoreResult};
pub use events::EventBus;
pub use ingest::{IngestEnvelope, IngestGateway};
pub use replay::ReplayCache;
pub use scope::ScopeMatcher;
pub use service::FlowService;
pub use storage::FlowStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
