//! Store <-> Warehouse synchronization engine: mapping store, audit log
//! with deduplication, persistent job queue, batch coordinator, inventory
//! and price sync workers, and a new-product discovery reconciler.

pub mod batch;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod model;
pub mod store;
pub mod sync;
pub mod warehouse;

pub use error::{Result, SyncError};
