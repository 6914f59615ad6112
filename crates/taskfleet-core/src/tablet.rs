//! Tablet-level payload types carried by agent tasks.
//!
//! These only describe what a worker needs to act on; the coordinator never
//! interprets tablet contents.

use serde::{Deserialize, Serialize};

use crate::{TabletId, WorkerId};

/// Storage medium a replica should be placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageMedium {
    #[default]
    Hdd,
    Ssd,
}

/// Column description shipped with a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub type_name: String,
    pub is_key: bool,
}

impl ColumnSpec {
    pub fn key(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_key: true,
        }
    }

    pub fn value(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_key: false,
        }
    }
}

/// Schema a new replica is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSchema {
    pub schema_id: i64,
    pub schema_version: i32,
    pub short_key_column_count: u16,
    pub columns: Vec<ColumnSpec>,
}

/// Where a new replica gets its initial data from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecoverySource {
    /// Copy from an existing healthy replica.
    CloneFrom {
        worker_id: WorkerId,
        tablet_id: TabletId,
        version: i64,
    },
    /// Restore from a snapshot.
    Snapshot { path: String },
}

/// One metadata change to apply to a tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabletMetaChange {
    InMemory { enabled: bool },
    EnablePersistentIndex { enabled: bool },
    PrimaryIndexCacheExpireSec { secs: i32 },
    BinlogConfig {
        enable: bool,
        version: i64,
        ttl_secs: i64,
        max_size: i64,
    },
    Property { key: String, value: String },
}

/// A metadata change bound to the tablet it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMetaUpdate {
    pub tablet_id: TabletId,
    pub change: TabletMetaChange,
}

impl TabletMetaUpdate {
    pub fn new(tablet_id: TabletId, change: TabletMetaChange) -> Self {
        Self { tablet_id, change }
    }
}
