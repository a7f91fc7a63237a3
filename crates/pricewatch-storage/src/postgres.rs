//! Postgres-backed stores over an injected `PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{
    CatalogProduct, CatalogProductUpdate, Metadata, NewPriceObservation, NewTrackedProduct,
    PriceChange, PriceObservation, Product, ProductAttributes, Retailer, TrackedProduct,
    TrackedProductUpdate, ValidationRule,
};
use rust_decimal::Decimal;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::store::{
    PriceHistoryStore, ProductStore, RetailerStore, StoreError, StoreResult, TrackedProductStore,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const TRACKED_PRODUCT_COLUMNS: &str =
    "id, sku, retailer_id, product_id, name, validation_rules, created_at, updated_at";
const PRICE_COLUMNS: &str = "id, product_id, price, currency, is_available, metadata, timestamp";
const CATALOG_COLUMNS: &str =
    "id, retailer_id, external_id, name, category, attributes, active, created_at, updated_at";
const RETAILER_COLUMNS: &str = "id, name, base_url, rate_limit, created_at, updated_at";

pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

fn map_write_error(err: sqlx::Error, context: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() || db.is_check_violation() {
            return StoreError::ConstraintViolation(format!("{}: {}", context(), db.message()));
        }
    }
    StoreError::Database(err)
}

fn tracked_product_from_row(row: &PgRow) -> StoreResult<TrackedProduct> {
    let rules: Json<ValidationRule> = row.try_get("validation_rules")?;
    Ok(TrackedProduct {
        id: row.try_get("id")?,
        sku: row.try_get("sku")?,
        retailer_id: row.try_get("retailer_id")?,
        product_id: row.try_get("product_id")?,
        name: row.try_get("name")?,
        validation_rules: rules.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn observation_from_row(row: &PgRow, prefix: &str) -> StoreResult<PriceObservation> {
    let col = |name: &str| format!("{prefix}{name}");
    let metadata: Json<Metadata> = row.try_get(col("metadata").as_str())?;
    let currency: String = row.try_get(col("currency").as_str())?;
    Ok(PriceObservation {
        id: row.try_get(col("id").as_str())?,
        product_id: row.try_get("product_id")?,
        price: row.try_get(col("price").as_str())?,
        currency: currency.trim().to_string(),
        is_available: row.try_get(col("is_available").as_str())?,
        metadata: metadata.0,
        timestamp: row.try_get(col("timestamp").as_str())?,
    })
}

fn attributes_from_json(value: JsonValue) -> StoreResult<ProductAttributes> {
    Ok(serde_json::from_value(value)?)
}

fn catalog_product_from_row(row: &PgRow) -> StoreResult<CatalogProduct> {
    Ok(CatalogProduct {
        id: row.try_get("id")?,
        retailer_id: row.try_get("retailer_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        attributes: attributes_from_json(row.try_get("attributes")?)?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn retailer_from_row(row: &PgRow) -> StoreResult<Retailer> {
    Ok(Retailer {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        rate_limit: row.try_get("rate_limit")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgTrackedProductStore {
    pool: PgPool,
}

impl PgTrackedProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrackedProductStore for PgTrackedProductStore {
    async fn create(&self, input: NewTrackedProduct) -> StoreResult<TrackedProduct> {
        let sql = format!(
            r#"
            INSERT INTO tracked_products (id, sku, retailer_id, product_id, name, validation_rules)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {TRACKED_PRODUCT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&input.sku)
            .bind(input.retailer_id)
            .bind(input.product_id)
            .bind(&input.name)
            .bind(Json(&input.validation_rules))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(e, || {
                    format!(
                        "tracked product with sku {} already exists for retailer {}",
                        input.sku, input.retailer_id
                    )
                })
            })?;
        tracked_product_from_row(&row)
    }

    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<TrackedProduct>> {
        let sql = format!(
            r#"
            SELECT {TRACKED_PRODUCT_COLUMNS}
              FROM tracked_products
             WHERE retailer_id = $1
             ORDER BY created_at ASC, id ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(retailer_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tracked_product_from_row).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<TrackedProduct>> {
        let sql = format!("SELECT {TRACKED_PRODUCT_COLUMNS} FROM tracked_products WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(tracked_product_from_row).transpose()
    }

    async fn find_by_sku(&self, retailer_id: Uuid, sku: &str) -> StoreResult<Option<TrackedProduct>> {
        let sql = format!(
            "SELECT {TRACKED_PRODUCT_COLUMNS} FROM tracked_products WHERE retailer_id = $1 AND sku = $2"
        );
        let row = sqlx::query(&sql)
            .bind(retailer_id)
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tracked_product_from_row).transpose()
    }

    async fn update(
        &self,
        id: Uuid,
        update: TrackedProductUpdate,
    ) -> StoreResult<Option<TrackedProduct>> {
        if update.is_empty() {
            return Ok(None);
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE tracked_products SET updated_at = NOW()");
        if let Some(sku) = &update.sku {
            qb.push(", sku = ").push_bind(sku.clone());
        }
        if let Some(name) = &update.name {
            qb.push(", name = ").push_bind(name.clone());
        }
        if let Some(product_id) = update.product_id {
            qb.push(", product_id = ").push_bind(product_id);
        }
        if let Some(rules) = &update.validation_rules {
            qb.push(", validation_rules = ").push_bind(Json(rules.clone()));
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {TRACKED_PRODUCT_COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_write_error(e, || format!("updating tracked product {id}")))?;
        row.as_ref().map(tracked_product_from_row).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PgPriceHistoryStore {
    pool: PgPool,
}

impl PgPriceHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceHistoryStore for PgPriceHistoryStore {
    async fn create(&self, input: NewPriceObservation) -> StoreResult<PriceObservation> {
        let sql = format!(
            r#"
            INSERT INTO price_history (id, product_id, price, currency, is_available, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {PRICE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(input.product_id)
            .bind(input.price)
            .bind(&input.currency)
            .bind(input.is_available)
            .bind(Json(&input.metadata))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(e, || {
                    format!("recording price for product {}", input.product_id)
                })
            })?;
        observation_from_row(&row, "")
    }

    async fn find_by_product_id(&self, product_id: Uuid) -> StoreResult<Vec<PriceObservation>> {
        let sql = format!(
            "SELECT {PRICE_COLUMNS} FROM price_history WHERE product_id = $1 ORDER BY timestamp DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| observation_from_row(r, "")).collect()
    }

    async fn find_latest(&self, product_id: Uuid) -> StoreResult<Option<PriceObservation>> {
        let sql = format!(
            "SELECT {PRICE_COLUMNS} FROM price_history WHERE product_id = $1 ORDER BY timestamp DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|r| observation_from_row(r, "")).transpose()
    }

    async fn find_in_range(
        &self,
        product_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<PriceObservation>> {
        let sql = format!(
            r#"
            SELECT {PRICE_COLUMNS}
              FROM price_history
             WHERE product_id = $1
               AND timestamp BETWEEN $2 AND $3
             ORDER BY timestamp ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(product_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| observation_from_row(r, "")).collect()
    }

    async fn average_price(&self, product_id: Uuid) -> StoreResult<Option<Decimal>> {
        let row = sqlx::query("SELECT AVG(price) AS avg_price FROM price_history WHERE product_id = $1")
            .bind(product_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("avg_price")?)
    }

    async fn price_changes(
        &self,
        product_id: Uuid,
        min_change: Decimal,
    ) -> StoreResult<Vec<PriceChange>> {
        let rows = sqlx::query(
            r#"
            WITH ordered AS (
                SELECT id, product_id, price, currency, is_available, metadata, timestamp,
                       LAG(id) OVER w AS prev_id,
                       LAG(price) OVER w AS prev_price,
                       LAG(currency) OVER w AS prev_currency,
                       LAG(is_available) OVER w AS prev_is_available,
                       LAG(metadata) OVER w AS prev_metadata,
                       LAG(timestamp) OVER w AS prev_timestamp
                  FROM price_history
                 WHERE product_id = $1
                WINDOW w AS (ORDER BY timestamp, id)
            )
            SELECT *
              FROM ordered
             WHERE prev_price IS NOT NULL
               AND prev_price <> 0
               AND ABS(price - prev_price) / prev_price >= $2
             ORDER BY timestamp ASC
            "#,
        )
        .bind(product_id)
        .bind(min_change)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let from = observation_from_row(row, "prev_")?;
            let to = observation_from_row(row, "")?;
            if let Some(change) = PriceChange::between(from, to) {
                out.push(change);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn create(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct> {
        let sql = format!(
            r#"
            INSERT INTO products (id, retailer_id, external_id, name, category, attributes, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {CATALOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(retailer_id)
            .bind(&product.external_id)
            .bind(&product.name)
            .bind(&product.category)
            .bind(Json(&product.attributes))
            .bind(product.active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                map_write_error(e, || {
                    format!(
                        "product {} already catalogued for retailer {retailer_id}",
                        product.external_id
                    )
                })
            })?;
        catalog_product_from_row(&row)
    }

    async fn upsert(&self, retailer_id: Uuid, product: &Product) -> StoreResult<CatalogProduct> {
        let sql = format!(
            r#"
            INSERT INTO products (id, retailer_id, external_id, name, category, attributes, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (retailer_id, external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   category = EXCLUDED.category,
                   attributes = EXCLUDED.attributes,
                   active = EXCLUDED.active,
                   updated_at = NOW()
            RETURNING {CATALOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(retailer_id)
            .bind(&product.external_id)
            .bind(&product.name)
            .bind(&product.category)
            .bind(Json(&product.attributes))
            .bind(product.active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_write_error(e, || format!("cataloguing product {}", product.external_id)))?;
        catalog_product_from_row(&row)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogProduct>> {
        let sql = format!("SELECT {CATALOG_COLUMNS} FROM products WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(catalog_product_from_row).transpose()
    }

    async fn find_by_external_id(
        &self,
        retailer_id: Uuid,
        external_id: &str,
    ) -> StoreResult<Option<CatalogProduct>> {
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM products WHERE retailer_id = $1 AND external_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(retailer_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(catalog_product_from_row).transpose()
    }

    async fn find_by_category(&self, category: &str) -> StoreResult<Vec<CatalogProduct>> {
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM products WHERE category = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(category).fetch_all(&self.pool).await?;
        rows.iter().map(catalog_product_from_row).collect()
    }

    async fn find_by_retailer_id(&self, retailer_id: Uuid) -> StoreResult<Vec<CatalogProduct>> {
        let sql = format!(
            "SELECT {CATALOG_COLUMNS} FROM products WHERE retailer_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(retailer_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(catalog_product_from_row).collect()
    }

    async fn update(
        &self,
        id: Uuid,
        update: CatalogProductUpdate,
    ) -> StoreResult<Option<CatalogProduct>> {
        if update.is_empty() {
            return Ok(None);
        }

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE products SET updated_at = NOW()");
        if let Some(name) = &update.name {
            qb.push(", name = ").push_bind(name.clone());
        }
        if let Some(category) = &update.category {
            qb.push(", category = ").push_bind(category.clone());
        }
        if let Some(attributes) = &update.attributes {
            qb.push(", attributes = ").push_bind(Json(attributes.clone()));
        }
        if let Some(active) = update.active {
            qb.push(", active = ").push_bind(active);
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(format!(" RETURNING {CATALOG_COLUMNS}"));

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(catalog_product_from_row).transpose()
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, Clone)]
pub struct PgRetailerStore {
    pool: PgPool,
}

impl PgRetailerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetailerStore for PgRetailerStore {
    async fn find_by_name(&self, name: &str) -> StoreResult<Option<Retailer>> {
        let sql = format!("SELECT {RETAILER_COLUMNS} FROM retailers WHERE name = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(retailer_from_row).transpose()
    }

    async fn upsert(&self, name: &str, base_url: &str, rate_limit: i32) -> StoreResult<Retailer> {
        let sql = format!(
            r#"
            INSERT INTO retailers (id, name, base_url, rate_limit)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
               SET base_url = EXCLUDED.base_url,
                   rate_limit = EXCLUDED.rate_limit,
                   updated_at = NOW()
            RETURNING {RETAILER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(base_url)
            .bind(rate_limit)
            .fetch_one(&self.pool)
            .await?;
        retailer_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_attributes_decode_from_jsonb() {
        let attributes = attributes_from_json(json!({
            "manufacturer": "Sony",
            "model_number": "WH1000XM5/B",
            "description": null,
            "image": null,
            "regular_price": "399.99",
            "in_store_availability": true,
            "online_availability": true,
            "category_path": ["Audio", "Headphones"]
        }))
        .unwrap();
        assert_eq!(attributes.manufacturer.as_deref(), Some("Sony"));
        assert_eq!(attributes.category_path, vec!["Audio", "Headphones"]);
    }

    #[test]
    fn malformed_catalog_attributes_are_serialization_errors() {
        let err = attributes_from_json(json!({"regular_price": "not a number"})).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
