//! Persistence for the monitoring inventory, collected metrics and alerting state
//!
//! ## Design
//!
//! - **Trait-based**: the collector, the alert evaluator and the maintenance
//!   workers only see `StorageBackend`
//! - **Async**: every operation is async and can be shared between workers
//! - **Row-atomic**: one agent history row is stored in one transaction
//!
//! ## Usage
//!
//! ```no_run
//! use fleetwatch::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./fleetwatch.db").await?;
//!     let agents = backend.list_agents().await?;
//!     println!("{} agents", agents.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use backend::{CheckDefinition, HealthStatus, IngestedRow, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use schema::{
    AggregateLevel, Check, CheckState, CollectorState, CollectorStatus, MetricRow,
    MetricTableConfig, StateChange,
};
