//! Job execution: claims queued sync jobs, runs the inventory/price
//! workers and applies the retry policy.

pub mod inventory;
pub mod price;

use crate::db::{self, Pool};
use crate::error::{Result, SyncError};
use crate::model::{JobKind, SyncJob};
use crate::store::StoreService;
use crate::warehouse::WarehouseService;
use tracing::{info, instrument, warn};

/// Backoff schedule for failed jobs, independent of any concrete broker.
/// Delays double per attempt starting at `base_delay_secs` (5s, 10s, 20s, …)
/// up to `max_delay_secs`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 5,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn with_cap(max_delay_secs: i64) -> Self {
        RetryPolicy {
            max_delay_secs: max_delay_secs.max(1),
            ..Default::default()
        }
    }

    /// Delay before the attempt following `attempt` failures.
    pub fn delay_secs(&self, attempt: i32) -> i64 {
        let secs = self.base_delay_secs * (1_i64 << attempt.clamp(0, 10));
        secs.min(self.max_delay_secs)
    }
}

/// Per-worker context injected at construction; never ambient global state.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub default_location_id: String,
    pub actor: String,
}

/// Claim and run one due job. Returns false when the queue had nothing due.
/// Retryable failures re-queue the job with backoff until its attempts are
/// exhausted; validation and not-found failures fail it immediately since a
/// re-run cannot change the outcome.
#[instrument(skip_all)]
pub async fn process_next_job(
    pool: &Pool,
    warehouse: &dyn WarehouseService,
    store: &dyn StoreService,
    ctx: &SyncContext,
    policy: &RetryPolicy,
) -> Result<bool> {
    let Some(job) = db::claim_next_job(pool).await? else {
        return Ok(false);
    };

    let res = run_job(pool, warehouse, store, ctx, &job).await;
    match res {
        Ok(()) => {
            db::complete_job(pool, job.id).await?;
            info!(
                job_id = job.id,
                kind = job.kind.as_str(),
                store_product_id = %job.store_product_id,
                "sync job completed"
            );
        }
        Err(err) => {
            let attempts = job.attempts + 1;
            if err.is_retryable() && attempts < job.max_attempts {
                let delay = policy.delay_secs(job.attempts);
                warn!(
                    job_id = job.id,
                    attempts,
                    delay,
                    %err,
                    "sync job failed; backing off"
                );
                db::delay_job(pool, job.id, attempts, delay, &err.to_string()).await?;
            } else {
                warn!(job_id = job.id, attempts, %err, "sync job failed permanently");
                db::fail_job(pool, job.id, attempts, &err.to_string()).await?;
            }
        }
    }
    Ok(true)
}

/// A job re-runs its whole worker on every retry; the workers only push
/// absolute values, so replays are safe.
async fn run_job(
    pool: &Pool,
    warehouse: &dyn WarehouseService,
    store: &dyn StoreService,
    ctx: &SyncContext,
    job: &SyncJob,
) -> Result<(), SyncError> {
    match job.kind {
        JobKind::Inventory => {
            inventory::sync_inventory(
                pool,
                warehouse,
                store,
                ctx,
                &job.store_product_id,
                &job.warehouse_product_id,
                job.location_id.as_deref(),
            )
            .await?;
        }
        JobKind::Price => {
            price::sync_price(pool, store, ctx, &job.store_product_id).await?;
        }
        JobKind::All => {
            // Inventory first: it refreshes the snapshot the price worker
            // reads.
            inventory::sync_inventory(
                pool,
                warehouse,
                store,
                ctx,
                &job.store_product_id,
                &job.warehouse_product_id,
                job.location_id.as_deref(),
            )
            .await?;
            price::sync_price(pool, store, ctx, &job.store_product_id).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MappingStatus, SyncAction};
    use serde_json::json;

    #[tokio::test]
    async fn failure_recording_survives_a_lost_db() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let mapping = db::upsert_mapping(
            &pool,
            "123",
            &json!({"id": "456"}),
            MappingStatus::Pending,
            None,
        )
        .await
        .unwrap();
        pool.close().await;

        let ctx = SyncContext {
            default_location_id: "L1".to_string(),
            actor: "test".to_string(),
        };
        // The status/event writes fail on the closed pool; the original
        // upstream error still comes back to the caller.
        let err = inventory::record_failure(
            &pool,
            &mapping,
            &ctx,
            SyncAction::SyncInventory,
            SyncError::upstream("503 from store"),
        )
        .await;
        assert!(matches!(err, SyncError::Upstream(_)));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_secs(0), 5);
        assert_eq!(policy.delay_secs(1), 10);
        assert_eq!(policy.delay_secs(2), 20);
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy::with_cap(60);
        assert_eq!(policy.delay_secs(0), 5);
        assert_eq!(policy.delay_secs(4), 60);
        assert_eq!(policy.delay_secs(100), 60);
    }
}
