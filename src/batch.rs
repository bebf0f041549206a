//! Batch coordinator: fans many product ids out into queued sync jobs under
//! one logical batch and derives aggregate progress.

use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::{Result, SyncError};
use crate::model::{BatchStats, EventStatus, JobKind, SyncAction, SyncEvent, SyncJob};
use crate::sync::RetryPolicy;

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: i64,
    pub store_product_id: String,
    pub warehouse_product_id: String,
}

/// Outcome of a batch launch. Per-item failures never abort the batch; they
/// come back keyed by store product id.
#[derive(Debug, Clone)]
pub struct BatchLaunch {
    pub batch_id: String,
    pub queued: Vec<QueuedJob>,
    pub failures: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BatchStatus {
    pub event: SyncEvent,
    pub jobs: Vec<SyncJob>,
    pub stats: BatchStats,
}

/// Enqueue one job per resolvable product id. Items without a mapping, or
/// whose snapshot carries no Warehouse product id, are recorded as per-item
/// failures and skipped. Only a database failure aborts the launch.
#[instrument(skip_all, fields(kind = kind.as_str(), count = store_product_ids.len()))]
pub async fn start_batch(
    pool: &Pool,
    store_product_ids: &[String],
    kind: JobKind,
    location_id: Option<&str>,
    policy: &RetryPolicy,
    actor: &str,
) -> Result<BatchLaunch> {
    let batch_id = Uuid::new_v4().to_string();
    let mut queued = Vec::new();
    let mut failures = BTreeMap::new();

    for store_product_id in store_product_ids {
        let mapping = match db::get_mapping(pool, store_product_id).await {
            Ok(mapping) => mapping,
            Err(SyncError::NotFound(_)) => {
                warn!(%store_product_id, "skipping batch item: no mapping");
                failures.insert(store_product_id.clone(), "no mapping".to_string());
                continue;
            }
            Err(err) => return Err(err),
        };

        let Some(warehouse_product_id) = mapping.warehouse_product_id().map(str::to_string)
        else {
            warn!(%store_product_id, "skipping batch item: snapshot has no warehouse id");
            failures.insert(
                store_product_id.clone(),
                "snapshot has no warehouse product id".to_string(),
            );
            continue;
        };

        let job_id = db::enqueue_job(
            pool,
            kind,
            store_product_id,
            &warehouse_product_id,
            location_id,
            Some(&batch_id),
            policy.max_attempts,
        )
        .await?;
        queued.push(QueuedJob {
            job_id,
            store_product_id: store_product_id.clone(),
            warehouse_product_id,
        });
    }

    let details = json!({
        "batch_id": batch_id,
        "kind": kind.as_str(),
        "queued_jobs": queued
            .iter()
            .map(|q| json!({
                "job_id": q.job_id,
                "store_product_id": q.store_product_id,
                "warehouse_product_id": q.warehouse_product_id,
            }))
            .collect::<Vec<_>>(),
        "failed": failures,
    });
    // Direct append: each launch gets its own event row even when two
    // batches start within the dedup window.
    db::insert_event(
        pool,
        None,
        SyncAction::BatchSync,
        EventStatus::Scheduled,
        &format!("queued {} of {} products", queued.len(), store_product_ids.len()),
        &details,
        actor,
    )
    .await?;

    info!(
        %batch_id,
        queued = queued.len(),
        failed = failures.len(),
        "batch scheduled"
    );
    Ok(BatchLaunch {
        batch_id,
        queued,
        failures,
    })
}

/// Load the batch's launch event and the live state of its jobs. Delayed
/// jobs count as waiting, keeping `completed + failed + waiting + active ==
/// total` at every snapshot.
pub async fn batch_status(pool: &Pool, batch_id: &str) -> Result<BatchStatus> {
    let event = db::get_batch_event(pool, batch_id).await?;
    let jobs = db::jobs_for_batch(pool, batch_id).await?;
    let counts = db::count_batch_states(pool, batch_id).await?;
    let stats = BatchStats::from_counts(
        counts.completed,
        counts.failed,
        counts.waiting + counts.delayed,
        counts.active,
    );
    Ok(BatchStatus { event, jobs, stats })
}
