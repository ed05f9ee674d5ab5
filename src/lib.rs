//! Library interface for versiontracker
//!
//! Finds installed macOS applications that Homebrew casks could manage, and
//! those with a newer cask version available. The pieces, leaf first:
//!
//! - [`matcher`]: fuzzy name matching
//! - [`rate_limit`]: fixed and adaptive rate limiters
//! - [`cache`]: memory + disk cache with TTL and eviction
//! - [`query`]: single lookups through `brew` or the JSON API
//! - [`scheduler`]: batched lookups on a thread pool or an event loop
//! - [`strategy`]: picks a scheduler strategy and falls back between them
//! - [`orchestrator`]: the two top-level checks

pub mod apps;
pub mod cache;
pub mod config;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod query;
pub mod rate_limit;
pub mod scheduler;
pub mod strategy;
pub mod version;

// Re-export commonly used types
pub use apps::InstalledApp;
pub use cache::{CacheLevel, Priority, TieredCache};
pub use config::Config;
pub use error::{ErrorKind, Result, TrackerError};
pub use matcher::NameMatcher;
pub use orchestrator::{Orchestrator, UpdateCandidate};
pub use scheduler::{LookupKind, LookupResult};
