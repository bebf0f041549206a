//! Warehouse/ERP client and the normalizing parsers that turn its
//! duck-typed JSON into canonical prices and stock levels.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::error::{Result, SyncError};

/// One product as reported by the Warehouse. The platform is loose about
/// shapes: the price may be flat or nested, ids may live in `id` or in the
/// secondary `code` field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarehouseProduct {
    #[serde(default)]
    pub id: Option<String>,
    /// Secondary/alternate identifier some Warehouse installations key by.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub prices: Option<PriceTable>,
    #[serde(default)]
    pub inventory: Option<Inventory>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    pub web: Option<f64>,
    #[serde(default)]
    pub default: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub remain: Option<f64>,
    #[serde(default)]
    pub depots: BTreeMap<String, Depot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Depot {
    #[serde(default)]
    pub available: Option<f64>,
}

/// Canonical price. Parsed out of either Warehouse shape; pushed to the
/// Store as a string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price(pub f64);

impl Price {
    /// Integral prices render without a decimal point to match the Store's
    /// string price API.
    pub fn as_store_string(&self) -> String {
        if self.0.fract() == 0.0 {
            format!("{}", self.0 as i64)
        } else {
            format!("{}", self.0)
        }
    }
}

impl WarehouseProduct {
    /// Price resolution order: flat `price`, then `prices.web`, then
    /// `prices.default`. Only positive values count; anything else is a
    /// validation failure, never a guess.
    pub fn resolve_price(&self) -> Result<Price> {
        let candidate = self
            .price
            .or_else(|| self.prices.as_ref().and_then(|p| p.web))
            .or_else(|| self.prices.as_ref().and_then(|p| p.default));
        match candidate {
            Some(v) if v > 0.0 => Ok(Price(v)),
            _ => Err(SyncError::validation("no valid price")),
        }
    }

    /// Stock quantity: the depot-specific `available` for `location_id`
    /// when the Warehouse reports one, otherwise the aggregate `remain`.
    pub fn resolve_quantity(&self, location_id: &str) -> Result<i64> {
        let inventory = self
            .inventory
            .as_ref()
            .ok_or_else(|| SyncError::validation("product has no inventory data"))?;
        if let Some(depot) = inventory.depots.get(location_id) {
            if let Some(available) = depot.available {
                return Ok(available.round() as i64);
            }
        }
        match inventory.remain {
            Some(remain) => Ok(remain.round() as i64),
            None => Err(SyncError::validation("product has no remain quantity")),
        }
    }

    /// Re-serialize this product as a mapping snapshot blob.
    pub fn to_snapshot(&self) -> Value {
        let mut snapshot = serde_json::Map::new();
        if let Some(id) = &self.id {
            snapshot.insert("id".into(), Value::String(id.clone()));
        }
        if let Some(code) = &self.code {
            snapshot.insert("code".into(), Value::String(code.clone()));
        }
        if let Some(name) = &self.name {
            snapshot.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(price) = self.price {
            if let Some(n) = serde_json::Number::from_f64(price) {
                snapshot.insert("price".into(), Value::Number(n));
            }
        }
        if let Some(prices) = &self.prices {
            let mut table = serde_json::Map::new();
            if let Some(web) = prices.web.and_then(serde_json::Number::from_f64) {
                table.insert("web".into(), Value::Number(web));
            }
            if let Some(default) = prices.default.and_then(serde_json::Number::from_f64) {
                table.insert("default".into(), Value::Number(default));
            }
            snapshot.insert("prices".into(), Value::Object(table));
        }
        if let Some(inventory) = &self.inventory {
            let mut inv = serde_json::Map::new();
            if let Some(remain) = inventory.remain.and_then(serde_json::Number::from_f64) {
                inv.insert("remain".into(), Value::Number(remain));
            }
            if !inventory.depots.is_empty() {
                let mut depots = serde_json::Map::new();
                for (location, depot) in &inventory.depots {
                    if let Some(available) =
                        depot.available.and_then(serde_json::Number::from_f64)
                    {
                        depots.insert(
                            location.clone(),
                            serde_json::json!({ "available": Value::Number(available) }),
                        );
                    }
                }
                inv.insert("depots".into(), Value::Object(depots));
            }
            snapshot.insert("inventory".into(), Value::Object(inv));
        }
        Value::Object(snapshot)
    }

    /// Parse a cached mapping snapshot back into a product.
    pub fn from_snapshot(snapshot: &Value) -> Result<Self> {
        serde_json::from_value(snapshot.clone())
            .map_err(|e| SyncError::validation(format!("unparsable warehouse snapshot: {e}")))
    }
}

/// How a search result was bound to the wanted Warehouse product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    ExactKey,
    CodeField,
    FirstItem,
}

impl ResolvedVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedVia::ExactKey => "exact_key",
            ResolvedVia::CodeField => "code_field",
            ResolvedVia::FirstItem => "first_item",
        }
    }
}

/// Pick the product matching `wanted` from a Warehouse result set. Priority:
/// exact key, then the secondary `code` field, then the first item of a
/// non-empty set. The last branch can bind the wrong product; it is kept for
/// parity with observed Warehouse behavior but never happens silently.
pub fn resolve_product<'a>(
    products: &'a BTreeMap<String, WarehouseProduct>,
    wanted: &str,
) -> Option<(&'a WarehouseProduct, ResolvedVia)> {
    if let Some(product) = products.get(wanted) {
        return Some((product, ResolvedVia::ExactKey));
    }
    if let Some(product) = products
        .values()
        .find(|p| p.code.as_deref() == Some(wanted) || p.id.as_deref() == Some(wanted))
    {
        return Some((product, ResolvedVia::CodeField));
    }
    if let Some((key, product)) = products.iter().next() {
        warn!(
            wanted,
            resolved_key = %key,
            "no exact or code match in warehouse results; falling back to first item"
        );
        return Some((product, ResolvedVia::FirstItem));
    }
    None
}

#[async_trait]
pub trait WarehouseService: Send + Sync {
    /// Search for a product by id. The response maps internal ids to
    /// products; resolution against the wanted id is the caller's job.
    async fn search_product(&self, product_id: &str)
        -> Result<BTreeMap<String, WarehouseProduct>>;

    /// Products updated within the last `days` days, for discovery.
    async fn list_updated_since(&self, days: i64) -> Result<Vec<WarehouseProduct>>;
}

#[derive(Clone)]
pub struct WarehouseClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for WarehouseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    products: BTreeMap<String, WarehouseProduct>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    products: Vec<WarehouseProduct>,
}

impl WarehouseClient {
    pub fn new(base_url: Url, api_key: String, timeout: StdDuration) -> Self {
        let http = Client::builder()
            .user_agent("stocksync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(format!("warehouse rejected api key: {status}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::upstream(format!("warehouse error {status}: {body}")));
        }
        Ok(res)
    }
}

#[async_trait]
impl WarehouseService for WarehouseClient {
    async fn search_product(
        &self,
        product_id: &str,
    ) -> Result<BTreeMap<String, WarehouseProduct>> {
        let mut url = self
            .base_url
            .join("products/search")
            .map_err(|e| SyncError::validation(format!("invalid warehouse base url: {e}")))?;
        url.query_pairs_mut().append_pair("id", product_id);
        let res = self
            .http
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let res = Self::check(res).await?;
        let payload: SearchResponse = res.json().await?;
        Ok(payload.products)
    }

    async fn list_updated_since(&self, days: i64) -> Result<Vec<WarehouseProduct>> {
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let mut url = self
            .base_url
            .join("products")
            .map_err(|e| SyncError::validation(format!("invalid warehouse base url: {e}")))?;
        url.query_pairs_mut().append_pair("updated_since", &since);
        let res = self
            .http
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;
        let res = Self::check(res).await?;
        let payload: ListResponse = res.json().await?;
        Ok(payload.products)
    }
}
