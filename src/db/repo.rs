use super::model::{BatchCounts, EventOutcome};
use crate::error::{truncate_error, Result, SyncError};
use crate::model::{
    EventStatus, JobKind, JobState, MappingStatus, ProductMapping, SyncAction, SyncEvent, SyncJob,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

/// Two attempts with an identical outcome inside this window collapse into
/// one audit row.
pub const DEDUP_WINDOW_SECS: i64 = 60;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the
/// parent directory exists. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match path.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| SyncError::Upstream(format!("migration failed: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mapping store

fn map_mapping(row: &SqliteRow) -> Result<ProductMapping> {
    let status_str: String = row.get("status");
    let status = MappingStatus::parse(&status_str)
        .ok_or_else(|| SyncError::validation(format!("unknown mapping status {status_str}")))?;
    let snapshot_str: String = row.get("warehouse_snapshot");
    let warehouse_snapshot: Value = serde_json::from_str(&snapshot_str)?;
    Ok(ProductMapping {
        id: row.get("id"),
        store_product_id: row.get("store_product_id"),
        warehouse_snapshot,
        status,
        last_error: row.try_get("last_error").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// The only creation path for mappings. On conflict the snapshot, status and
/// error are overwritten; `created_at` is preserved.
#[instrument(skip_all, fields(store_product_id))]
pub async fn upsert_mapping(
    pool: &Pool,
    store_product_id: &str,
    warehouse_snapshot: &Value,
    status: MappingStatus,
    error: Option<&str>,
) -> Result<ProductMapping> {
    let snapshot = serde_json::to_string(warehouse_snapshot)?;
    let error = error.map(|e| truncate_error(e).into_owned());
    let row = sqlx::query(
        "INSERT INTO product_mappings (store_product_id, warehouse_snapshot, status, last_error) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(store_product_id) DO UPDATE SET \
             warehouse_snapshot = excluded.warehouse_snapshot, \
             status = excluded.status, \
             last_error = excluded.last_error, \
             updated_at = CURRENT_TIMESTAMP \
         RETURNING *",
    )
    .bind(store_product_id)
    .bind(snapshot)
    .bind(status.as_str())
    .bind(error)
    .fetch_one(pool)
    .await?;
    map_mapping(&row)
}

#[instrument(skip_all, fields(store_product_id))]
pub async fn get_mapping(pool: &Pool, store_product_id: &str) -> Result<ProductMapping> {
    let row = sqlx::query("SELECT * FROM product_mappings WHERE store_product_id = ?")
        .bind(store_product_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => map_mapping(&row),
        None => Err(SyncError::not_found(format!(
            "mapping for store product {store_product_id}"
        ))),
    }
}

pub async fn list_mappings(pool: &Pool) -> Result<Vec<ProductMapping>> {
    let rows = sqlx::query("SELECT * FROM product_mappings ORDER BY store_product_id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_mapping).collect()
}

/// Status updates are last-write-wins; concurrent syncs of the same mapping
/// may interleave here and the next successful run self-corrects.
#[instrument(skip_all, fields(store_product_id, status = status.as_str()))]
pub async fn set_mapping_status(
    pool: &Pool,
    store_product_id: &str,
    status: MappingStatus,
    error: Option<&str>,
) -> Result<()> {
    let error = error.map(|e| truncate_error(e).into_owned());
    let res = sqlx::query(
        "UPDATE product_mappings SET status = ?, last_error = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE store_product_id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(store_product_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(SyncError::not_found(format!(
            "mapping for store product {store_product_id}"
        )));
    }
    Ok(())
}

#[instrument(skip_all, fields(store_product_id))]
pub async fn delete_mapping(pool: &Pool, store_product_id: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM product_mappings WHERE store_product_id = ?")
        .bind(store_product_id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(SyncError::not_found(format!(
            "mapping for store product {store_product_id}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync event log

fn map_event(row: &SqliteRow) -> Result<SyncEvent> {
    let action_str: String = row.get("action");
    let action = SyncAction::parse(&action_str)
        .ok_or_else(|| SyncError::validation(format!("unknown event action {action_str}")))?;
    let status_str: String = row.get("status");
    let status = EventStatus::parse(&status_str)
        .ok_or_else(|| SyncError::validation(format!("unknown event status {status_str}")))?;
    let details_str: String = row.get("details");
    Ok(SyncEvent {
        id: row.get("id"),
        mapping_id: row.try_get("mapping_id").ok(),
        action,
        status,
        message: row.get("message"),
        details: serde_json::from_str(&details_str)?,
        actor: row.get("actor"),
        created_at: row.get("created_at"),
    })
}

/// Append one audit event, unless the most recent event for the same
/// `(mapping_id, action)` pair within the dedup window already carries the
/// same status. Best-effort: two racing writers can both pass the check;
/// the log is diagnostic, not authoritative.
#[instrument(skip_all, fields(action = action.as_str(), status = status.as_str()))]
pub async fn record_event(
    pool: &Pool,
    mapping_id: Option<i64>,
    action: SyncAction,
    status: EventStatus,
    message: &str,
    details: &Value,
    actor: &str,
) -> Result<EventOutcome> {
    let recent = sqlx::query(
        "SELECT * FROM sync_events \
         WHERE mapping_id IS ? AND action = ? \
           AND created_at >= datetime('now', ? || ' seconds') \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(mapping_id)
    .bind(action.as_str())
    .bind(-DEDUP_WINDOW_SECS)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = recent {
        let existing = map_event(&row)?;
        if existing.status == status {
            return Ok(EventOutcome::Deduplicated(existing));
        }
    }

    let event = insert_event(pool, mapping_id, action, status, message, details, actor).await?;
    Ok(EventOutcome::Recorded(event))
}

/// Direct append without the dedup check. Batch launch events use this:
/// every batch needs its own row, even when two launches land inside the
/// window with identical status.
pub async fn insert_event(
    pool: &Pool,
    mapping_id: Option<i64>,
    action: SyncAction,
    status: EventStatus,
    message: &str,
    details: &Value,
    actor: &str,
) -> Result<SyncEvent> {
    let row = sqlx::query(
        "INSERT INTO sync_events (mapping_id, action, status, message, details, actor) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(mapping_id)
    .bind(action.as_str())
    .bind(status.as_str())
    .bind(message)
    .bind(serde_json::to_string(details)?)
    .bind(actor)
    .fetch_one(pool)
    .await?;
    map_event(&row)
}

pub async fn count_events_for(
    pool: &Pool,
    mapping_id: Option<i64>,
    action: SyncAction,
) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_events WHERE mapping_id IS ? AND action = ?")
            .bind(mapping_id)
            .bind(action.as_str())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Look up the launch event of a batch by the batch id embedded in its
/// details payload.
pub async fn get_batch_event(pool: &Pool, batch_id: &str) -> Result<SyncEvent> {
    let row = sqlx::query(
        "SELECT * FROM sync_events \
         WHERE action = 'batch_sync' AND json_extract(details, '$.batch_id') = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => map_event(&row),
        None => Err(SyncError::not_found(format!("batch {batch_id}"))),
    }
}

pub async fn list_recent_events(pool: &Pool, limit: i64) -> Result<Vec<SyncEvent>> {
    let rows = sqlx::query("SELECT * FROM sync_events ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_event).collect()
}

// ---------------------------------------------------------------------------
// Job queue

fn map_job(row: &SqliteRow) -> Result<SyncJob> {
    let kind_str: String = row.get("kind");
    let kind = JobKind::parse(&kind_str)
        .ok_or_else(|| SyncError::validation(format!("unknown job kind {kind_str}")))?;
    let state_str: String = row.get("state");
    let state = JobState::parse(&state_str)
        .ok_or_else(|| SyncError::validation(format!("unknown job state {state_str}")))?;
    Ok(SyncJob {
        id: row.get("id"),
        kind,
        store_product_id: row.get("store_product_id"),
        warehouse_product_id: row.get("warehouse_product_id"),
        location_id: row.try_get("location_id").ok(),
        batch_id: row.try_get("batch_id").ok(),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        state,
        last_error: row.try_get("last_error").ok(),
        due_at: row.get("due_at"),
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all, fields(kind = kind.as_str(), store_product_id))]
pub async fn enqueue_job(
    pool: &Pool,
    kind: JobKind,
    store_product_id: &str,
    warehouse_product_id: &str,
    location_id: Option<&str>,
    batch_id: Option<&str>,
    max_attempts: i32,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_jobs \
             (kind, store_product_id, warehouse_product_id, location_id, batch_id, max_attempts) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(store_product_id)
    .bind(warehouse_product_id)
    .bind(location_id)
    .bind(batch_id)
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Atomically claim the earliest due waiting/delayed job by flipping it to
/// active in the same statement, so two workers never run the same job.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool) -> Result<Option<SyncJob>> {
    let row = sqlx::query(
        "UPDATE sync_jobs SET state = 'active', updated_at = CURRENT_TIMESTAMP \
         WHERE id = (SELECT id FROM sync_jobs \
                     WHERE state IN ('waiting', 'delayed') \
                       AND datetime(due_at) <= CURRENT_TIMESTAMP \
                     ORDER BY datetime(due_at), id LIMIT 1) \
         RETURNING *",
    )
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_job).transpose()
}

#[instrument(skip_all, fields(id))]
pub async fn complete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET state = 'completed', last_error = NULL, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Push a failed job back onto the queue with its next attempt count and a
/// delay before it becomes due again.
#[instrument(skip_all, fields(id, attempts, delay_secs))]
pub async fn delay_job(
    pool: &Pool,
    id: i64,
    attempts: i32,
    delay_secs: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET state = 'delayed', attempts = ?, last_error = ?, \
         due_at = datetime('now', ? || ' seconds'), updated_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(attempts)
    .bind(truncate_error(error).as_ref())
    .bind(delay_secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(id, attempts))]
pub async fn fail_job(pool: &Pool, id: i64, attempts: i32, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET state = 'failed', attempts = ?, last_error = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(attempts)
    .bind(truncate_error(error).as_ref())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_job(pool: &Pool, id: i64) -> Result<SyncJob> {
    let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => map_job(&row),
        None => Err(SyncError::not_found(format!("job {id}"))),
    }
}

pub async fn jobs_for_batch(pool: &Pool, batch_id: &str) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query("SELECT * FROM sync_jobs WHERE batch_id = ? ORDER BY id")
        .bind(batch_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(map_job).collect()
}

pub async fn count_batch_states(pool: &Pool, batch_id: &str) -> Result<BatchCounts> {
    let rows = sqlx::query(
        "SELECT state, COUNT(*) AS n FROM sync_jobs WHERE batch_id = ? GROUP BY state",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    let mut counts = BatchCounts::default();
    for row in rows {
        let state: String = row.get("state");
        let n: i64 = row.get("n");
        match JobState::parse(&state) {
            Some(JobState::Completed) => counts.completed = n,
            Some(JobState::Failed) => counts.failed = n,
            Some(JobState::Waiting) => counts.waiting = n,
            Some(JobState::Active) => counts.active = n,
            Some(JobState::Delayed) => counts.delayed = n,
            None => {
                return Err(SyncError::validation(format!("unknown job state {state}")));
            }
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let pool = setup_pool().await;
        let snapshot = json!({"id": "456", "name": "Widget"});
        let created = upsert_mapping(&pool, "123", &snapshot, MappingStatus::Pending, None)
            .await
            .unwrap();

        let updated = upsert_mapping(
            &pool,
            "123",
            &json!({"id": "456", "name": "Widget v2"}),
            MappingStatus::Success,
            None,
        )
        .await
        .unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(created.created_at, updated.created_at);
        assert_eq!(updated.status, MappingStatus::Success);
        assert_eq!(updated.warehouse_snapshot["name"], "Widget v2");
        assert_eq!(list_mappings(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_mapping_is_not_found() {
        let pool = setup_pool().await;
        assert!(matches!(
            get_mapping(&pool, "nope").await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            set_mapping_status(&pool, "nope", MappingStatus::Error, Some("x")).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            delete_mapping(&pool, "nope").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn status_error_is_truncated() {
        let pool = setup_pool().await;
        upsert_mapping(&pool, "123", &json!({"id": "456"}), MappingStatus::Pending, None)
            .await
            .unwrap();
        let long = "e".repeat(500);
        set_mapping_status(&pool, "123", MappingStatus::Error, Some(&long))
            .await
            .unwrap();
        let mapping = get_mapping(&pool, "123").await.unwrap();
        assert_eq!(mapping.last_error.unwrap().len(), crate::error::MAX_ERROR_LEN);
    }

    #[tokio::test]
    async fn event_dedup_skips_same_status_in_window() {
        let pool = setup_pool().await;
        let first = record_event(
            &pool,
            Some(1),
            SyncAction::SyncInventory,
            EventStatus::Success,
            "synced",
            &json!({"after": 42}),
            "system",
        )
        .await
        .unwrap();
        assert!(!first.was_deduplicated());

        let second = record_event(
            &pool,
            Some(1),
            SyncAction::SyncInventory,
            EventStatus::Success,
            "synced again",
            &json!({"after": 42}),
            "system",
        )
        .await
        .unwrap();
        assert!(second.was_deduplicated());
        assert_eq!(second.event().id, first.event().id);

        // Status change breaks the dedup.
        let third = record_event(
            &pool,
            Some(1),
            SyncAction::SyncInventory,
            EventStatus::Error,
            "store refused",
            &json!({}),
            "system",
        )
        .await
        .unwrap();
        assert!(!third.was_deduplicated());

        assert_eq!(
            count_events_for(&pool, Some(1), SyncAction::SyncInventory)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn event_dedup_tracks_pairs_independently() {
        let pool = setup_pool().await;
        for mapping_id in [Some(1), Some(2), None] {
            let outcome = record_event(
                &pool,
                mapping_id,
                SyncAction::SyncPrice,
                EventStatus::Success,
                "",
                &json!({}),
                "system",
            )
            .await
            .unwrap();
            assert!(!outcome.was_deduplicated());
        }
        // A different action for the same mapping is also a fresh pair.
        let outcome = record_event(
            &pool,
            Some(1),
            SyncAction::SyncInventory,
            EventStatus::Success,
            "",
            &json!({}),
            "system",
        )
        .await
        .unwrap();
        assert!(!outcome.was_deduplicated());
    }

    #[tokio::test]
    async fn direct_append_bypasses_dedup() {
        let pool = setup_pool().await;
        for batch in ["b-1", "b-2"] {
            insert_event(
                &pool,
                None,
                SyncAction::BatchSync,
                EventStatus::Scheduled,
                "queued",
                &json!({"batch_id": batch}),
                "system",
            )
            .await
            .unwrap();
        }
        assert_eq!(
            count_events_for(&pool, None, SyncAction::BatchSync)
                .await
                .unwrap(),
            2
        );
        assert!(get_batch_event(&pool, "b-2").await.is_ok());
        assert!(matches!(
            get_batch_event(&pool, "b-3").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn queue_claim_complete_and_backoff() {
        let pool = setup_pool().await;
        let id = enqueue_job(&pool, JobKind::Inventory, "123", "456", Some("L1"), None, 3)
            .await
            .unwrap();

        let job = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.location_id.as_deref(), Some("L1"));

        // Active jobs are not claimable again.
        assert!(claim_next_job(&pool).await.unwrap().is_none());

        delay_job(&pool, id, 1, 5, "store timeout").await.unwrap();
        let delayed = get_job(&pool, id).await.unwrap();
        assert_eq!(delayed.state, JobState::Delayed);
        assert_eq!(delayed.attempts, 1);
        // Not due for another 5 seconds.
        assert!(claim_next_job(&pool).await.unwrap().is_none());

        sqlx::query("UPDATE sync_jobs SET due_at = datetime('now', '-1 seconds') WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        let reclaimed = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);

        complete_job(&pool, id).await.unwrap();
        let done = get_job(&pool, id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.last_error.is_none());
    }

    #[tokio::test]
    async fn batch_counts_group_by_state() {
        let pool = setup_pool().await;
        let batch = "b-1";
        for i in 0..4 {
            enqueue_job(
                &pool,
                JobKind::Price,
                &format!("p{i}"),
                &format!("w{i}"),
                None,
                Some(batch),
                3,
            )
            .await
            .unwrap();
        }
        let jobs = jobs_for_batch(&pool, batch).await.unwrap();
        assert_eq!(jobs.len(), 4);

        complete_job(&pool, jobs[0].id).await.unwrap();
        fail_job(&pool, jobs[1].id, 3, "gave up").await.unwrap();
        delay_job(&pool, jobs[2].id, 1, 10, "retrying").await.unwrap();

        let counts = count_batch_states(&pool, batch).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 0);
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://x/y"),
            "postgres://x/y"
        );
        let url = prepare_sqlite_url("sqlite:///tmp/stocksync-test/db.sqlite?mode=rwc");
        assert_eq!(url, "sqlite:///tmp/stocksync-test/db.sqlite?mode=rwc");
        assert!(std::path::Path::new("/tmp/stocksync-test").exists());
    }
}
