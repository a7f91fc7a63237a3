//! Retailer client contracts and the Best Buy implementation.

use async_trait::async_trait;
use pricewatch_core::{Product, RetailerResult};
use pricewatch_storage::StoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod bestbuy;
mod queue;

pub use bestbuy::{
    delay_for_rate, sku_from_query, BestBuyConfig, BestBuyRetailer, BESTBUY_RETAILER_NAME,
    DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE, DEFAULT_RATE_LIMIT,
};
pub use queue::{QueueClosed, RequestQueue};

pub const CRATE_NAME: &str = "pricewatch-adapters";

#[derive(Debug, Error)]
pub enum RetailerError {
    #[error("retailer client used before initialize()")]
    NotInitialized,
    #[error("no retailer row named {name:?}")]
    ResolutionFailure { name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub category: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl SearchParams {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }
}

/// One retailer's product API. Network calls never fail with an error type;
/// HTTP and transport problems come back as an `HttpWarning`.
#[async_trait]
pub trait RetailerService: Send + Sync {
    fn name(&self) -> &str;

    /// Available once the client has resolved its retailer row.
    fn retailer_id(&self) -> Result<Uuid, RetailerError>;

    async fn search_products(&self, params: SearchParams) -> RetailerResult<Vec<Product>>;

    async fn get_product(&self, sku: &str) -> RetailerResult<Product>;

    async fn get_current_price(&self, sku: &str) -> RetailerResult<Decimal>;
}
