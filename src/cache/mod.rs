//! Cache Module
//!
//! In-memory key/value storage composed with the per-key lock manager and
//! the expiry engine.

mod event;
mod facade;
mod lrw;
mod stats;
mod store;


// Re-export public types
pub use event::CacheEvent;
pub use facade::{Cache, EventListener};
pub use lrw::LrwTracker;
pub use stats::{CacheStats, StatsRecorder};
pub use store::CacheStore;
