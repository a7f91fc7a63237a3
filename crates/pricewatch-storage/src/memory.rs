//! In-process store implementations with the same contracts as the Postgres ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{
    CatalogProduct, CatalogProductUpdate, NewPriceObservation, NewTrackedProduct, PriceChange,
    PriceObservation, Product, Retailer, TrackedProduct, TrackedProductUpdate,
};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{
    detect_price_changes, PriceHistoryStore, ProductStore, RetailerStore, StoreError, StoreResult,
    TrackedProductStore,
};

#[derive(Debug, Default)]
pub struct MemoryTrackedProductStore {
    rows: RwLock<Vec<TrackedProduct>>,
}

impl MemoryTrackedProductStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackedProductStore for MemoryTrackedProductStore {
    async fn create(&self, input: NewTrackedProduct) -> StoreResult<TrackedProduct> {
        let mut rows = self.rows.write().await;
        if rows
            .iter()
            .any(|p| p.retailer_id == input.retailer_id && p.sku == input.sku)
        {
            return Err(StoreError::ConstraintViolation(format!(
                "tracked product with sku {} already exists for retailer {}",
                input.sku, input.retailer_id
            )));
        }
        let now = Utc::now();
        let product = TrackedProduct {
            id: Uuid::new_v4(),
            sku: input.sku,
            retailer_id: input.retailer_id,
            product_id: input.product_id,
            name: input.name,
            validation_rules: input.validation_rules,
            created_at: now,
            updated_at: now,
        };
        rows.push(product.clone());
        Ok(product)
    }

    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<TrackedProduct>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|p| p.retailer_id == retailer_id)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<TrackedProduct>> {
        Ok(self.rows.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_sku(&self, retailer_id: Uuid, sku: &str) -> StoreResult<Option<TrackedProduct>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .find(|p| p.retailer_id == retailer_id && p.sku == sku)
            .cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        update: TrackedProductUpdate,
    ) -> StoreResult<Option<TrackedProduct>> {
        if update.is_empty() {
            return Ok(None);
        }
        let mut rows = self.rows.write().await;
        if let Some(sku) = &update.sku {
            let target_retailer = rows.iter().find(|p| p.id == id).map(|p| p.retailer_id);
            if rows
                .iter()
                .any(|p| p.id != id && Some(p.retailer_id) == target_retailer && &p.sku == sku)
            {
                return Err(StoreError::ConstraintViolation(format!(
                    "tracked product with sku {sku} already exists"
                )));
            }
        }
        let Some(product) = rows.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        update.apply_to(product);
        product.updated_at = Utc::now();
        Ok(Some(product.clone()))
    }
}

#[derive(Debug, Default)]
pub struct MemoryPriceHistoryStore {
    rows: RwLock<Vec<PriceObservation>>,
}

impl MemoryPriceHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Every observation in insertion order.
    pub async fn all(&self) -> Vec<PriceObservation> {
        self.rows.read().await.clone()
    }

    async fn ascending(&self, product_id: Uuid) -> Vec<PriceObservation> {
        let mut rows: Vec<_> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|o| o.product_id == product_id)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.timestamp);
        rows
    }
}

#[async_trait]
impl PriceHistoryStore for MemoryPriceHistoryStore {
    async fn create(&self, input: NewPriceObservation) -> StoreResult<PriceObservation> {
        if input.price.is_sign_negative() && !input.price.is_zero() {
            return Err(StoreError::ConstraintViolation(format!(
                "price must be non-negative, got {}",
                input.price
            )));
        }
        let observation = PriceObservation {
            id: Uuid::new_v4(),
            product_id: input.product_id,
            price: input.price,
            currency: input.currency,
            is_available: input.is_available,
            metadata: input.metadata,
            timestamp: Utc::now(),
        };
        self.rows.write().await.push(observation.clone());
        Ok(observation)
    }

    async fn find_by_product_id(&self, product_id: Uuid) -> StoreResult<Vec<PriceObservation>> {
        let mut rows = self.ascending(product_id).await;
        rows.reverse();
        Ok(rows)
    }

    async fn find_latest(&self, product_id: Uuid) -> StoreResult<Option<PriceObservation>> {
        Ok(self.ascending(product_id).await.pop())
    }

    async fn find_in_range(
        &self,
        product_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceObservation>> {
        Ok(self
            .ascending(product_id)
            .await
            .into_iter()
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .collect())
    }

    async fn average_price(&self, product_id: Uuid) -> StoreResult<Option<Decimal>> {
        let rows = self.ascending(product_id).await;
        if rows.is_empty() {
            return Ok(None);
        }
        let total: Decimal = rows.iter().map(|o| o.price).sum();
        Ok(Some(total / Decimal::from(rows.len())))
    }

    async fn price_changes(
        &self,
        product_id: Uuid,
        min_change: Decimal,
    ) -> StoreResult<Vec<PriceChange>> {
        Ok(detect_price_changes(self.ascending(product_id).await, min_change))
    }
}

#[derive(Debug, Default)]
pub struct MemoryProductStore {
    rows: RwLock<Vec<CatalogProduct>>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every catalogue row in insertion order.
    pub async fn all(&self) -> Vec<CatalogProduct> {
        self.rows.read().await.clone()
    }
}

fn new_catalog_row(retailer_id: Uuid, product: &Product) -> CatalogProduct {
    let now = Utc::now();
    CatalogProduct {
        id: Uuid::new_v4(),
        retailer_id,
        external_id: product.external_id.clone(),
        name: product.name.clone(),
        category: product.category.clone(),
        attributes: product.attributes.clone(),
        active: product.active,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn create(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct> {
        let mut rows = self.rows.write().await;
        if rows
            .iter()
            .any(|r| r.retailer_id == retailer_id && r.external_id == product.external_id)
        {
            return Err(StoreError::ConstraintViolation(format!(
                "product {} already catalogued for retailer {retailer_id}",
                product.external_id
            )));
        }
        let row = new_catalog_row(retailer_id, product);
        rows.push(row.clone());
        Ok(row)
    }

    async fn upsert(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct> {
        let mut rows = self.rows.write().await;
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.retailer_id == retailer_id && r.external_id == product.external_id)
        {
            CatalogProductUpdate::refresh_from(product).apply_to(existing);
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let row = new_catalog_row(retailer_id, product);
        rows.push(row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogProduct>> {
        Ok(self.rows.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_external_id(
        &self,
        retailer_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<CatalogProduct>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .find(|r| r.retailer_id == retailer_id && r.external_id == external_id)
            .cloned())
    }

    async fn find_by_category(&self, category: &str) -> StoreResult<Vec<CatalogProduct>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect())
    }

    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<CatalogProduct>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|r| r.retailer_id == retailer_id)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        id: Uuid,
        update: CatalogProductUpdate,
    ) -> StoreResult<Option<CatalogProduct>> {
        if update.is_empty() {
            return Ok(None);
        }
        let mut rows = self.rows.write().await;
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        update.apply_to(row);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.id != id);
        Ok(rows.len() < before)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRetailerStore {
    rows: RwLock<Vec<Retailer>>,
}

impl MemoryRetailerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetailerStore for MemoryRetailerStore {
    async fn find_by_name(&self, name: &str) -> StoreResult<Option<Retailer>> {
        Ok(self.rows.read().await.iter().find(|r| r.name == name).cloned())
    }

    async fn upsert(&self, name: &str, base_url: &str, rate_limit: i32) -> StoreResult<Retailer> {
        let mut rows = self.rows.write().await;
        let now = Utc::now();
        if let Some(existing) = rows.iter_mut().find(|r| r.name == name) {
            existing.base_url = base_url.to_string();
            existing.rate_limit = rate_limit;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let retailer = Retailer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            rate_limit,
            created_at: now,
            updated_at: now,
        };
        rows.push(retailer.clone());
        Ok(retailer)
    }
}
