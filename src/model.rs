use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a product mapping. pending -> success | error, and the two
/// outcomes flip freely on later syncs; there is no terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Pending,
    Success,
    Error,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Pending => "pending",
            MappingStatus::Success => "success",
            MappingStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MappingStatus::Pending),
            "success" => Some(MappingStatus::Success),
            "error" => Some(MappingStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    SyncInventory,
    SyncPrice,
    BatchSync,
    DiscoverProduct,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::SyncInventory => "sync_inventory",
            SyncAction::SyncPrice => "sync_price",
            SyncAction::BatchSync => "batch_sync",
            SyncAction::DiscoverProduct => "discover_product",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_inventory" => Some(SyncAction::SyncInventory),
            "sync_price" => Some(SyncAction::SyncPrice),
            "batch_sync" => Some(SyncAction::BatchSync),
            "discover_product" => Some(SyncAction::DiscoverProduct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
    Scheduled,
    Queued,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Error => "error",
            EventStatus::Scheduled => "scheduled",
            EventStatus::Queued => "queued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(EventStatus::Success),
            "error" => Some(EventStatus::Error),
            "scheduled" => Some(EventStatus::Scheduled),
            "queued" => Some(EventStatus::Queued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Inventory,
    Price,
    All,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Inventory => "inventory",
            JobKind::Price => "price",
            JobKind::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inventory" => Some(JobKind::Inventory),
            "price" => Some(JobKind::Price),
            "all" => Some(JobKind::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }
}

/// One row of the mapping table: the durable Store <-> Warehouse link plus
/// the last cached Warehouse snapshot and the outcome of the latest sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductMapping {
    pub id: i64,
    pub store_product_id: String,
    pub warehouse_snapshot: serde_json::Value,
    pub status: MappingStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductMapping {
    /// The Warehouse product id cached inside the snapshot, when present.
    pub fn warehouse_product_id(&self) -> Option<&str> {
        self.warehouse_snapshot
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Immutable audit record of one sync attempt or batch launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: i64,
    pub mapping_id: Option<i64>,
    pub action: SyncAction,
    pub status: EventStatus,
    pub message: String,
    pub details: serde_json::Value,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub kind: JobKind,
    pub store_product_id: String,
    pub warehouse_product_id: String,
    pub location_id: Option<String>,
    pub batch_id: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub state: JobState,
    pub last_error: Option<String>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate view over the jobs of one batch. Delayed jobs are reported as
/// waiting so `completed + failed + waiting + active == total` holds at
/// every snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub waiting: i64,
    pub active: i64,
    pub progress: f64,
}

impl BatchStats {
    pub fn from_counts(completed: i64, failed: i64, waiting: i64, active: i64) -> Self {
        let total = completed + failed + waiting + active;
        let progress = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        BatchStats {
            total,
            completed,
            failed,
            waiting,
            active,
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for s in ["pending", "success", "error"] {
            assert_eq!(MappingStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["sync_inventory", "sync_price", "batch_sync", "discover_product"] {
            assert_eq!(SyncAction::parse(s).unwrap().as_str(), s);
        }
        for s in ["waiting", "active", "completed", "failed", "delayed"] {
            assert_eq!(JobState::parse(s).unwrap().as_str(), s);
        }
        assert!(JobKind::parse("bulk").is_none());
    }

    #[test]
    fn batch_stats_preserve_invariant() {
        let stats = BatchStats::from_counts(3, 1, 4, 2);
        assert_eq!(
            stats.completed + stats.failed + stats.waiting + stats.active,
            stats.total
        );
        assert!((stats.progress - 30.0).abs() < f64::EPSILON);

        let empty = BatchStats::from_counts(0, 0, 0, 0);
        assert_eq!(empty.progress, 0.0);
    }

    #[test]
    fn snapshot_exposes_warehouse_id() {
        let mapping = ProductMapping {
            id: 1,
            store_product_id: "123".into(),
            warehouse_snapshot: serde_json::json!({"id": "456", "name": "Widget"}),
            status: MappingStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(mapping.warehouse_product_id(), Some("456"));

        let bare = ProductMapping {
            warehouse_snapshot: serde_json::json!({}),
            ..mapping
        };
        assert_eq!(bare.warehouse_product_id(), None);
    }
}
