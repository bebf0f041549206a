//! Database module: pool setup, entity mapping and SQL repositories.
//!
//! - `model`: view types returned by repositories (event outcomes, batch
//!   state counts).
//! - `repo`: SQL-only functions over the mapping table, the sync event log
//!   and the job queue. Business decisions (retry policy, value resolution)
//!   live in higher layers.

pub mod model;
pub mod repo;

pub use model::{BatchCounts, EventOutcome};
pub use repo::*;
