//! Keylock Cache - an in-memory key/value cache with per-key locking
//!
//! Built from two primitives: a reentrant, FIFO, per-key [`LockManager`]
//! that recovers locks from callers that die, and a bucketed
//! [`ExpiryEngine`] that purges keys on a virtual clock. The [`Cache`]
//! facade composes them with the store, and [`api`] serves it over HTTP.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod expiry;
pub mod lock;
pub mod models;
mod tasks;

pub use api::AppState;
pub use cache::{Cache, CacheEvent, CacheStats};
pub use config::{Config, StorageMode};
pub use error::{CacheError, Result};
pub use expiry::{ExpiryEngine, TtlUpdate};
pub use lock::{Caller, CallerId, CallerRef, LockGuard, LockManager};
