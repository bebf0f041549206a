//! Price sync worker: resolves a price from the cached Warehouse snapshot
//! and pushes it to the Store's variant endpoint.

use serde_json::json;
use tracing::{info, instrument};

use super::inventory::record_failure;
use super::SyncContext;
use crate::db::{self, Pool};
use crate::error::Result;
use crate::model::{EventStatus, MappingStatus, SyncAction};
use crate::store::StoreService;
use crate::warehouse::{Price, WarehouseProduct};

#[derive(Debug, Clone)]
pub struct PriceReport {
    pub price: Price,
}

/// Unlike inventory sync, this reads only the cached snapshot; a missing or
/// non-positive price is a validation failure and the Store is never called.
#[instrument(skip_all, fields(store_product_id))]
pub async fn sync_price(
    pool: &Pool,
    store: &dyn StoreService,
    ctx: &SyncContext,
    store_product_id: &str,
) -> Result<PriceReport> {
    let mapping = db::get_mapping(pool, store_product_id).await?;
    let product = WarehouseProduct::from_snapshot(&mapping.warehouse_snapshot)?;
    let price = product.resolve_price()?;
    let rendered = price.as_store_string();

    if let Err(err) = store.update_variant_price(store_product_id, &rendered).await {
        return Err(record_failure(pool, &mapping, ctx, SyncAction::SyncPrice, err).await);
    }

    db::set_mapping_status(pool, store_product_id, MappingStatus::Success, None).await?;

    let details = json!({
        "price": rendered,
        "source_title": product.name,
        "target_product_id": store_product_id,
    });
    db::record_event(
        pool,
        Some(mapping.id),
        SyncAction::SyncPrice,
        EventStatus::Success,
        &format!("price set to {rendered}"),
        &details,
        &ctx.actor,
    )
    .await?;

    info!(price = %rendered, "price synced");
    Ok(PriceReport { price })
}
