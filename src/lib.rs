//! Client-side real-time layer for a live-chat platform.
//!
//! Keeps conversations and their messages consistent with the server across
//! reconnects, sibling client contexts and optimistic UI actions.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod service;
pub mod timer;

#[cfg(test)]
mod test_support;

use std::sync::{Mutex, MutexGuard};

pub use config::SyncConfig;
pub use errors::AppError;
pub use service::{SyncDeps, SyncNotification, SyncRegistry, SyncService};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
