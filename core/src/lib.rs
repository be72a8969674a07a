//! Repopulse Core - Shared types, storage and analytics
//!
//! This crate provides:
//! - Common data structures (events, commits, summaries)
//! - Database schema and migrations for the relational backend
//! - A partitioned key/value engine for the second backend
//! - The storage contract and both adapters
//! - Commit change analysis
//! - Query-time metrics

pub mod analyzer;
pub mod clock;
pub mod error;
pub mod kvstore;
pub mod metrics;
pub mod schema;
pub mod storage;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use kvstore::DEFAULT_PARTITIONS;
pub use metrics::{MetricsEngine, MetricsPolicy};
pub use schema::init_schema;
pub use storage::{HealthStatus, PartitionedStorage, SqliteStorage, Storage, StorageConfig};
pub use types::*;
