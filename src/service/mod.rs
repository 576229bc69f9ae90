pub mod registry;
mod remote;
pub mod sync_service;

pub use registry::SyncRegistry;
pub use sync_service::{SyncDeps, SyncNotification, SyncService};
