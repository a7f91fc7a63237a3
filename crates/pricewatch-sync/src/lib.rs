//! Price polling orchestration: config, wiring, scheduling and seeding.

use std::sync::Arc;

use anyhow::{Context, Result};
use pricewatch_adapters::{BestBuyConfig, BestBuyRetailer, BESTBUY_RETAILER_NAME};
use pricewatch_core::Retailer;
use pricewatch_storage::{
    connect, run_migrations, HttpFetcher, PgPriceHistoryStore, PgProductStore, PgRetailerStore,
    PgTrackedProductStore, RetailerStore,
};
use sqlx::PgPool;
use tracing::info;

mod config;
mod logging;
mod poller;
mod seed;

pub use config::{AppConfig, ConfigError, DEFAULT_DATABASE_URL};
pub use logging::{default_filter, init_logging};
pub use poller::{
    PassFailurePolicy, PassReport, PollError, PollerConfig, PricePoller, DEFAULT_POLL_INTERVAL,
    PRICE_OUT_OF_RANGE_FLAG,
};
pub use seed::{load_seed_file, parse_seed_file, seed_tracked_products, SeedFile, SeedProduct, SeedReport};

pub const CRATE_NAME: &str = "pricewatch-sync";

/// Inserts or refreshes the Best Buy row from the client config.
pub async fn ensure_bestbuy_retailer(
    store: &dyn RetailerStore,
    config: &BestBuyConfig,
) -> Result<Retailer> {
    let rate_limit = i32::try_from(config.rate_limit).context("rate limit does not fit the retailers table")?;
    let retailer = store
        .upsert(BESTBUY_RETAILER_NAME, &config.base_url, rate_limit)
        .await
        .context("upserting Best Buy retailer row")?;
    info!(retailer_id = %retailer.id, rate_limit, "retailer row ready");
    Ok(retailer)
}

/// Connected stores plus an initialized Best Buy client.
pub struct PriceWatch {
    pub config: AppConfig,
    pub pool: PgPool,
    pub retailers: Arc<PgRetailerStore>,
    pub products: Arc<PgTrackedProductStore>,
    pub prices: Arc<PgPriceHistoryStore>,
    pub catalog: Arc<PgProductStore>,
    pub retailer: Arc<BestBuyRetailer>,
}

impl PriceWatch {
    /// Connects, migrates, ensures the retailer row and initializes the client.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let pool = connect(&config.database_url, config.database_max_connections)
            .await
            .context("connecting to postgres")?;
        run_migrations(&pool).await.context("running migrations")?;

        let retailers = Arc::new(PgRetailerStore::new(pool.clone()));
        ensure_bestbuy_retailer(retailers.as_ref(), &config.bestbuy).await?;

        let transport = Arc::new(HttpFetcher::new(config.http.clone())?);
        let retailer = Arc::new(BestBuyRetailer::new(
            config.bestbuy.clone(),
            transport,
            retailers.clone(),
        ));
        retailer.initialize().await.context("initializing Best Buy client")?;

        Ok(Self {
            products: Arc::new(PgTrackedProductStore::new(pool.clone())),
            prices: Arc::new(PgPriceHistoryStore::new(pool.clone())),
            catalog: Arc::new(PgProductStore::new(pool.clone())),
            retailers,
            retailer,
            pool,
            config,
        })
    }

    pub fn poller(&self) -> PricePoller {
        PricePoller::new(
            self.retailer.clone(),
            self.products.clone(),
            self.prices.clone(),
            PollerConfig {
                interval: self.config.poll_interval,
                failure_policy: self.config.failure_policy,
            },
        )
        .with_catalog(self.catalog.clone())
    }
}

pub async fn run_poll_once_from_env() -> Result<PassReport> {
    let config = AppConfig::from_env()?;
    let watch = PriceWatch::connect(config).await?;
    Ok(watch.poller().poll().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_storage::memory::MemoryRetailerStore;

    #[tokio::test]
    async fn retailer_row_is_upserted_once() {
        let store = MemoryRetailerStore::new();
        let config = BestBuyConfig::new("k");

        let first = ensure_bestbuy_retailer(&store, &config).await.unwrap();
        let second = ensure_bestbuy_retailer(&store, &config.clone().with_base_url("http://other"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, BESTBUY_RETAILER_NAME);
        assert_eq!(second.base_url, "http://other");
        assert_eq!(second.rate_limit, 10);
    }
}
