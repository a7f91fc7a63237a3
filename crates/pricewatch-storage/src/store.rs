//! Persistence contracts consumed by the retailer client and the poller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{
    CatalogProduct, CatalogProductUpdate, NewPriceObservation, NewTrackedProduct, PriceChange,
    PriceObservation, Product, Retailer, TrackedProduct, TrackedProductUpdate,
};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TrackedProductStore: Send + Sync {
    /// Fails with `ConstraintViolation` when `(retailer_id, sku)` already exists.
    async fn create(&self, input: NewTrackedProduct) -> StoreResult<TrackedProduct>;

    /// Products for one retailer in creation order.
    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<TrackedProduct>>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<TrackedProduct>>;

    async fn find_by_sku(&self, retailer_id: Uuid, sku: &str) -> StoreResult<Option<TrackedProduct>>;

    /// Returns `None` for an unknown id or an empty update.
    async fn update(
        &self,
        id: Uuid,
        update: TrackedProductUpdate,
    ) -> StoreResult<Option<TrackedProduct>>;
}

#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Appends one observation; the store assigns `id` and `timestamp`.
    async fn create(&self, input: NewPriceObservation) -> StoreResult<PriceObservation>;

    /// Newest first.
    async fn find_by_product_id(&self, product_id: Uuid) -> StoreResult<Vec<PriceObservation>>;

    async fn find_latest(&self, product_id: Uuid) -> StoreResult<Option<PriceObservation>>;

    /// Oldest first, bounds inclusive.
    async fn find_in_range(
        &self,
        product_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceObservation>>;

    async fn average_price(&self, product_id: Uuid) -> StoreResult<Option<Decimal>>;

    /// Consecutive observations whose relative change is at least `min_change`
    /// (`0.01` = one percent).
    async fn price_changes(
        &self,
        product_id: Uuid,
        min_change: Decimal,
    ) -> StoreResult<Vec<PriceChange>>;
}

/// Canonical product catalogue, one row per `(retailer_id, external_id)`.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Fails with `ConstraintViolation` when the external id is already catalogued.
    async fn create(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct>;

    /// Inserts the product or refreshes every mutable column of the existing row.
    async fn upsert(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogProduct>>;

    async fn find_by_external_id(
        &self,
        retailer_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<CatalogProduct>>;

    async fn find_by_category(&self, category: &str) -> StoreResult<Vec<CatalogProduct>>;

    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<CatalogProduct>>;

    /// Returns `None` for an unknown id or an empty update.
    async fn update(
        &self,
        id: Uuid,
        update: CatalogProductUpdate,
    ) -> StoreResult<Option<CatalogProduct>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait RetailerStore: Send + Sync {
    async fn find_by_name(&self, name: &str) -> StoreResult<Option<Retailer>>;

    /// Inserts or refreshes the row for `name`.
    async fn upsert(&self, name: &str, base_url: &str, rate_limit: i32) -> StoreResult<Retailer>;
}

/// Pairs consecutive observations (oldest first) and keeps the ones at or
/// above the threshold.
pub fn detect_price_changes(
    ascending: Vec<PriceObservation>,
    min_change: Decimal,
) -> Vec<PriceChange> {
    let mut out = Vec::new();
    let mut iter = ascending.into_iter();
    let Some(mut prev) = iter.next() else {
        return out;
    };
    for next in iter {
        if let Some(change) = PriceChange::between(prev.clone(), next.clone()) {
            if change.relative_change() >= min_change {
                out.push(change);
            }
        }
        prev = next;
    }
    out
}
