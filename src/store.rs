//! Storefront platform client: absolute inventory sets, variant price
//! updates and minimal product creation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// The minimal product created by discovery: a title, a vendor tag and one
/// variant carrying sku/price/inventory from the Warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStoreProduct {
    pub title: String,
    pub vendor: String,
    pub sku: Option<String>,
    pub price: Option<String>,
    pub inventory: Option<i64>,
}

#[async_trait]
pub trait StoreService: Send + Sync {
    /// Set the absolute available quantity of an inventory item at a
    /// location.
    async fn set_inventory_level(
        &self,
        location_id: &str,
        inventory_item_id: &str,
        available: i64,
    ) -> Result<()>;

    /// Set a variant's price (the Store API takes the price as a string).
    async fn update_variant_price(&self, variant_id: &str, price: &str) -> Result<()>;

    /// Create a product; returns the new Store product id.
    async fn create_product(&self, product: &NewStoreProduct) -> Result<String>;
}

#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CreateProductResponse {
    product: CreatedProduct,
}

#[derive(Deserialize)]
struct CreatedProduct {
    id: Value,
}

impl StoreClient {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("stocksync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::validation(format!("invalid store base url: {e}")))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .post(url)
            .header("X-Store-Access-Token", &self.token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("store rejected token: {status}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "store API error");
            return Err(SyncError::upstream(format!("store error {status}: {body}")));
        }
        Ok(res)
    }
}

/// Request-body builders are split out so tests can assert payload shapes
/// without a live endpoint.
pub fn build_inventory_set_request(
    location_id: &str,
    inventory_item_id: &str,
    available: i64,
) -> Value {
    json!({
        "location_id": location_id,
        "inventory_item_id": inventory_item_id,
        "available": available,
    })
}

pub fn build_price_update_request(variant_id: &str, price: &str) -> Value {
    json!({
        "variant": {
            "id": variant_id,
            "price": price,
        }
    })
}

pub fn build_product_create_request(product: &NewStoreProduct) -> Value {
    let mut variant = serde_json::Map::new();
    if let Some(sku) = product.sku.as_deref().filter(|s| !s.is_empty()) {
        variant.insert("sku".into(), json!(sku));
    }
    if let Some(price) = product.price.as_deref() {
        variant.insert("price".into(), json!(price));
    }
    if let Some(inventory) = product.inventory {
        variant.insert("inventory_quantity".into(), json!(inventory));
    }
    json!({
        "product": {
            "title": product.title,
            "vendor": product.vendor,
            "variants": [Value::Object(variant)],
        }
    })
}

#[async_trait]
impl StoreService for StoreClient {
    async fn set_inventory_level(
        &self,
        location_id: &str,
        inventory_item_id: &str,
        available: i64,
    ) -> Result<()> {
        let body = build_inventory_set_request(location_id, inventory_item_id, available);
        self.post_json("inventory_levels/set", &body).await?;
        info!(location_id, inventory_item_id, available, "store inventory set");
        Ok(())
    }

    async fn update_variant_price(&self, variant_id: &str, price: &str) -> Result<()> {
        let body = build_price_update_request(variant_id, price);
        let path = format!("variants/{variant_id}");
        self.post_json(&path, &body).await?;
        info!(variant_id, price, "store variant price updated");
        Ok(())
    }

    async fn create_product(&self, product: &NewStoreProduct) -> Result<String> {
        let body = build_product_create_request(product);
        let res = self.post_json("products", &body).await?;
        let payload: CreateProductResponse = res.json().await?;
        let id = match &payload.product.id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(SyncError::validation(format!(
                    "unexpected product id in store response: {other}"
                )))
            }
        };
        info!(product_id = %id, title = %product.title, "store product created");
        Ok(id)
    }
}
