//! TaskFleet Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/RPC transports
//! - Async runtimes
//! - Catalog or storage internals
//!
//! Everything here describes the agent tasks a coordinator ships to its
//! worker fleet, plus the pure construction logic that produces them.

pub mod error;
pub mod ids;
pub mod metadata;
pub mod status;
pub mod tablet;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{BuildId, Signature, SignatureGenerator, TabletId, WorkerId};
pub use metadata::MetadataUpdateTaskFactory;
pub use status::{LeaderTaskStatus, TaskState};
pub use tablet::{
    ColumnSpec, RecoverySource, StorageMedium, TabletMetaChange, TabletMetaUpdate, TabletSchema,
};
pub use task::{CreateReplicaConfig, Priority, Task, TaskKey, TaskPayload, TaskType};
