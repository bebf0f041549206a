//! Product discovery reconciler: finds recently updated Warehouse products
//! with no mapping yet, creates them in the Store and records the mapping.

use serde_json::json;
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::Result;
use crate::model::{EventStatus, MappingStatus, SyncAction};
use crate::store::{NewStoreProduct, StoreService};
use crate::warehouse::{WarehouseProduct, WarehouseService};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub window_days: i64,
    pub vendor_tag: String,
    pub actor: String,
}

/// One reconciliation pass. Deliberately non-atomic: each unmapped product
/// is created independently and a failure is logged and skipped, never
/// propagated. Returns the number of successfully discovered products.
#[instrument(skip_all, fields(window_days = cfg.window_days))]
pub async fn discover(
    pool: &Pool,
    warehouse: &dyn WarehouseService,
    store: &dyn StoreService,
    cfg: &DiscoveryConfig,
) -> Result<usize> {
    let recent = warehouse.list_updated_since(cfg.window_days).await?;

    let mapped: BTreeSet<String> = db::list_mappings(pool)
        .await?
        .iter()
        .filter_map(|m| m.warehouse_product_id().map(str::to_string))
        .collect();

    let mut discovered = 0usize;
    for product in &recent {
        let Some(warehouse_id) = product.id.as_deref().filter(|s| !s.is_empty()) else {
            warn!("skipping warehouse product without an id");
            continue;
        };
        if mapped.contains(warehouse_id) {
            continue;
        }

        match create_one(pool, store, cfg, warehouse_id, product).await {
            Ok(store_product_id) => {
                discovered += 1;
                info!(%warehouse_id, %store_product_id, "discovered product");
            }
            Err(err) => {
                warn!(%warehouse_id, %err, "discovery failed for product; continuing");
            }
        }
    }

    info!(discovered, scanned = recent.len(), "discovery pass finished");
    Ok(discovered)
}

async fn create_one(
    pool: &Pool,
    store: &dyn StoreService,
    cfg: &DiscoveryConfig,
    warehouse_id: &str,
    product: &WarehouseProduct,
) -> Result<String> {
    let title = product
        .name
        .clone()
        .unwrap_or_else(|| format!("Warehouse product {warehouse_id}"));
    let new_product = NewStoreProduct {
        title: title.clone(),
        vendor: cfg.vendor_tag.clone(),
        sku: product.code.clone(),
        price: product.resolve_price().ok().map(|p| p.as_store_string()),
        inventory: product
            .inventory
            .as_ref()
            .and_then(|i| i.remain)
            .map(|r| r.round() as i64),
    };

    let store_product_id = store.create_product(&new_product).await?;

    let mut snapshot = product.to_snapshot();
    if snapshot.get("id").and_then(|v| v.as_str()).is_none() {
        snapshot["id"] = json!(warehouse_id);
    }
    let mapping = db::upsert_mapping(
        pool,
        &store_product_id,
        &snapshot,
        MappingStatus::Pending,
        None,
    )
    .await?;

    db::record_event(
        pool,
        Some(mapping.id),
        SyncAction::DiscoverProduct,
        EventStatus::Success,
        &format!("created store product for warehouse {warehouse_id}"),
        &json!({
            "warehouse_product_id": warehouse_id,
            "store_product_id": store_product_id,
            "title": title,
        }),
        &cfg.actor,
    )
    .await?;

    Ok(store_product_id)
}
