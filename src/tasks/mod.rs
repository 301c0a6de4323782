//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is alive.
//!
//! # Tasks
//! - Expiry: Advances the expiry wheel on every tick and purges due keys

mod expiry;

pub(crate) use expiry::spawn_expiry_task;
