//! Inventory sync worker: resolves the Warehouse stock level for one mapped
//! product and pushes it to the Store as an absolute quantity.

use serde_json::json;
use tracing::{info, instrument, warn};

use super::SyncContext;
use crate::db::{self, Pool};
use crate::error::{truncate_error, Result, SyncError};
use crate::model::{EventStatus, MappingStatus, SyncAction};
use crate::store::StoreService;
use crate::warehouse::{resolve_product, ResolvedVia, WarehouseProduct, WarehouseService};

#[derive(Debug, Clone)]
pub struct InventoryReport {
    pub quantity_before: Option<i64>,
    pub quantity_after: i64,
    pub location_id: String,
    pub resolved_via: ResolvedVia,
}

#[instrument(skip_all, fields(store_product_id, warehouse_product_id))]
pub async fn sync_inventory(
    pool: &Pool,
    warehouse: &dyn WarehouseService,
    store: &dyn StoreService,
    ctx: &SyncContext,
    store_product_id: &str,
    warehouse_product_id: &str,
    location_id: Option<&str>,
) -> Result<InventoryReport> {
    let mapping = db::get_mapping(pool, store_product_id).await?;
    let location = location_id.unwrap_or(&ctx.default_location_id).to_string();

    // The old snapshot gives the "before" view for the audit trail.
    let before = WarehouseProduct::from_snapshot(&mapping.warehouse_snapshot)
        .ok()
        .and_then(|p| p.resolve_quantity(&location).ok());

    let products = match warehouse.search_product(warehouse_product_id).await {
        Ok(products) => products,
        Err(err) => {
            return Err(record_failure(pool, &mapping, ctx, SyncAction::SyncInventory, err).await);
        }
    };

    let Some((product, resolved_via)) = resolve_product(&products, warehouse_product_id) else {
        return Err(SyncError::not_found(format!(
            "warehouse product {warehouse_product_id}"
        )));
    };

    let quantity = product.resolve_quantity(&location)?;

    if let Err(err) = store
        .set_inventory_level(&location, store_product_id, quantity)
        .await
    {
        return Err(record_failure(pool, &mapping, ctx, SyncAction::SyncInventory, err).await);
    }

    // Success: refresh the cached snapshot (the price worker reads it).
    // The mapping stays keyed by the id we were asked to sync: a code-field
    // or first-item resolution carries the resolved product's own id, and
    // persisting that would durably re-bind the mapping to it.
    let mut snapshot = product.to_snapshot();
    snapshot["id"] = json!(warehouse_product_id);
    db::upsert_mapping(pool, store_product_id, &snapshot, MappingStatus::Success, None).await?;

    let details = json!({
        "before": before,
        "after": quantity,
        "location_id": location,
        "resolved_via": resolved_via.as_str(),
        "source_title": product.name.clone(),
        "target_product_id": store_product_id,
    });
    db::record_event(
        pool,
        Some(mapping.id),
        SyncAction::SyncInventory,
        EventStatus::Success,
        &format!("inventory set to {quantity} at {location}"),
        &details,
        &ctx.actor,
    )
    .await?;

    info!(quantity, %location, via = resolved_via.as_str(), "inventory synced");
    Ok(InventoryReport {
        quantity_before: before,
        quantity_after: quantity,
        location_id: location,
        resolved_via,
    })
}

/// Record a platform failure into the mapping and the audit log, then hand
/// an error back to the caller. Auth and validation errors pass through
/// untouched so they keep their no-retry semantics; upstream failures come
/// back truncated. Never panics the worker.
pub(super) async fn record_failure(
    pool: &Pool,
    mapping: &crate::model::ProductMapping,
    ctx: &SyncContext,
    action: SyncAction,
    err: SyncError,
) -> SyncError {
    if !matches!(err, SyncError::Upstream(_)) {
        return err;
    }
    let message = truncate_error(&err.to_string()).into_owned();
    if let Err(db_err) = db::set_mapping_status(
        pool,
        &mapping.store_product_id,
        MappingStatus::Error,
        Some(&message),
    )
    .await
    {
        warn!(
            %db_err,
            store_product_id = %mapping.store_product_id,
            "could not persist mapping error status"
        );
    }
    if let Err(db_err) = db::record_event(
        pool,
        Some(mapping.id),
        action,
        EventStatus::Error,
        &message,
        &json!({ "target_product_id": mapping.store_product_id }),
        &ctx.actor,
    )
    .await
    {
        warn!(%db_err, "could not persist failure event");
    }
    SyncError::Upstream(message)
}
