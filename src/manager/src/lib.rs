mod cache;
mod database;
mod manager;
mod sync;

pub use cache::{
    CacheEntry, FileCache, FileState, Tracker, TrackerEntry, CACHE_EXPIRATION,
    CACHE_SWEEP_INTERVAL, TRACKER_IDLE_THRESHOLD,
};
pub use database::{Database, DbState};
pub use manager::Manager;
pub use sync::{SyncOptions, SyncServer};

#[cfg(test)]
mod manager_tests;
