//! Best Buy products API client.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_core::{HttpWarning, Product, ProductAttributes, RetailerResult};
use pricewatch_storage::{HttpTransport, RetailerStore};
use reqwest::Url;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::queue::RequestQueue;
use crate::{RetailerError, RetailerService, SearchParams};

pub const BESTBUY_RETAILER_NAME: &str = "Best Buy";
pub const DEFAULT_BASE_URL: &str = "https://api.bestbuy.com/v1";
pub const DEFAULT_RATE_LIMIT: u32 = 10;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

const WARNING_PREFIX: &str = "Best Buy API";
const SKU_PREFIX: &str = "sku:";
const UNCATEGORIZED: &str = "Uncategorized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestBuyConfig {
    pub api_key: String,
    pub base_url: String,
    /// Requests per minute; also the value stored on the retailer row.
    pub rate_limit: u32,
    /// Pause after each queued request.
    pub request_delay: Duration,
}

impl BestBuyConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            rate_limit: DEFAULT_RATE_LIMIT,
            request_delay: delay_for_rate(DEFAULT_RATE_LIMIT),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }
}

/// Minimum spacing that keeps a client under `rate` requests per minute.
pub fn delay_for_rate(rate: u32) -> Duration {
    Duration::from_millis(60_000 / u64::from(rate.max(1)))
}

/// Returns the SKU when `query` is of the form `sku:<code>`.
pub fn sku_from_query(query: &str) -> Option<&str> {
    let query = query.trim();
    let head = query.get(..SKU_PREFIX.len())?;
    if !head.eq_ignore_ascii_case(SKU_PREFIX) {
        return None;
    }
    let sku = query[SKU_PREFIX.len()..].trim();
    (!sku.is_empty()).then_some(sku)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSku {
    Text(String),
    Number(u64),
}

impl WireSku {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireCategory {
    Name(String),
    Node { name: String },
}

impl WireCategory {
    fn into_name(self) -> String {
        match self {
            Self::Name(name) | Self::Node { name } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProduct {
    sku: WireSku,
    name: String,
    regular_price: Decimal,
    #[serde(default)]
    category_path: Vec<WireCategory>,
    #[serde(default)]
    model_number: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    in_store_availability: bool,
    #[serde(default)]
    online_availability: bool,
}

#[derive(Debug, Deserialize)]
struct WireSearchPage {
    #[serde(default)]
    products: Vec<WireProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireLookup {
    Envelope { products: Vec<WireProduct> },
    Single(WireProduct),
}

impl WireProduct {
    fn into_product(self) -> Product {
        let category_path: Vec<String> = self
            .category_path
            .into_iter()
            .map(WireCategory::into_name)
            .collect();
        let category = category_path
            .last()
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        Product {
            external_id: self.sku.into_string(),
            name: self.name,
            category,
            attributes: ProductAttributes {
                manufacturer: self.manufacturer,
                model_number: self.model_number,
                description: self.description,
                image: self.image,
                regular_price: self.regular_price,
                in_store_availability: self.in_store_availability,
                online_availability: self.online_availability,
                category_path,
            },
            active: self.online_availability,
        }
    }
}

fn warning(w: HttpWarning) -> HttpWarning {
    w.with_prefix(WARNING_PREFIX)
}

/// The part of the client that queued jobs own.
struct Endpoint {
    api_key: String,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl Endpoint {
    fn products_url(&self) -> RetailerResult<Url> {
        Url::parse(&format!("{}/products", self.base_url))
            .map_err(|e| warning(HttpWarning::unknown(format!("invalid base url: {e}"))))
    }

    fn product_url(&self, sku: &str) -> RetailerResult<Url> {
        let mut url = self.products_url()?;
        url.path_segments_mut()
            .map_err(|_| warning(HttpWarning::unknown("base url cannot carry a path")))?
            .push(&format!("{sku}.json"));
        url.query_pairs_mut()
            .append_pair("apiKey", &self.api_key)
            .append_pair("format", "json");
        Ok(url)
    }

    fn search_url(&self, params: &SearchParams) -> RetailerResult<Url> {
        let mut url = self.products_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("apiKey", &self.api_key)
                .append_pair("format", "json")
                .append_pair(
                    "pageSize",
                    &params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
                )
                .append_pair("page", &params.page.unwrap_or(1).to_string());
            if let Some(q) = params.query.as_deref().filter(|q| !q.trim().is_empty()) {
                query.append_pair("search", q);
            }
            if let Some(category) = params.category.as_deref().filter(|c| !c.is_empty()) {
                query.append_pair("categoryPath", category);
            }
        }
        Ok(url)
    }

    async fn fetch(&self, url: Url) -> RetailerResult<Vec<u8>> {
        let resp = self.transport.get(url.as_str()).await.map_err(|err| {
            warn!(error = %err, "transport failure");
            warning(HttpWarning::unknown(err))
        })?;
        if !resp.is_success() {
            let w = warning(HttpWarning::from_status(resp.status));
            debug!(status = resp.status, message = %w.message, "non-success response");
            return Err(w);
        }
        Ok(resp.body)
    }

    async fn product(&self, sku: &str) -> RetailerResult<Product> {
        let body = self.fetch(self.product_url(sku)?).await?;
        let lookup: WireLookup = serde_json::from_slice(&body).map_err(|e| {
            warning(HttpWarning::unknown(format!("malformed product payload: {e}")))
        })?;
        let wire = match lookup {
            WireLookup::Single(p) => p,
            WireLookup::Envelope { products } => products
                .into_iter()
                .next()
                .ok_or_else(|| warning(HttpWarning::not_found()))?,
        };
        Ok(wire.into_product())
    }

    async fn search(&self, params: &SearchParams) -> RetailerResult<Vec<Product>> {
        let body = self.fetch(self.search_url(params)?).await?;
        let page: WireSearchPage = serde_json::from_slice(&body).map_err(|e| {
            warning(HttpWarning::unknown(format!("malformed search payload: {e}")))
        })?;
        Ok(page.products.into_iter().map(WireProduct::into_product).collect())
    }
}

pub struct BestBuyRetailer {
    endpoint: Arc<Endpoint>,
    queue: RequestQueue,
    retailers: Arc<dyn RetailerStore>,
    retailer_id: OnceLock<Uuid>,
}

impl std::fmt::Debug for BestBuyRetailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestBuyRetailer")
            .field("base_url", &self.endpoint.base_url)
            .field("request_delay", &self.queue.delay())
            .field("retailer_id", &self.retailer_id.get())
            .finish()
    }
}

impl BestBuyRetailer {
    /// Spawns the request queue worker; call inside a tokio runtime.
    pub fn new(
        config: BestBuyConfig,
        transport: Arc<dyn HttpTransport>,
        retailers: Arc<dyn RetailerStore>,
    ) -> Self {
        let endpoint = Endpoint {
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            transport,
        };
        Self {
            endpoint: Arc::new(endpoint),
            queue: RequestQueue::new(config.request_delay),
            retailers,
            retailer_id: OnceLock::new(),
        }
    }

    /// Resolves the retailer row by name. Later calls are no-ops.
    pub async fn initialize(&self) -> Result<Uuid, RetailerError> {
        if let Some(id) = self.retailer_id.get() {
            return Ok(*id);
        }
        let retailer = self
            .retailers
            .find_by_name(BESTBUY_RETAILER_NAME)
            .await?
            .ok_or_else(|| RetailerError::ResolutionFailure {
                name: BESTBUY_RETAILER_NAME.to_string(),
            })?;
        let id = *self.retailer_id.get_or_init(|| retailer.id);
        info!(retailer_id = %id, "best buy client initialized");
        Ok(id)
    }

    async fn enqueue<T, F, Fut>(&self, op: &'static str, work: F) -> RetailerResult<T>
    where
        F: FnOnce(Arc<Endpoint>) -> Fut,
        Fut: std::future::Future<Output = RetailerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let span = info_span!("bestbuy_request", op);
        let fut = work(Arc::clone(&self.endpoint)).instrument(span);
        self.queue
            .submit(fut)
            .await
            .unwrap_or_else(|closed| Err(warning(HttpWarning::unknown(closed))))
    }
}

#[async_trait]
impl RetailerService for BestBuyRetailer {
    fn name(&self) -> &str {
        BESTBUY_RETAILER_NAME
    }

    fn retailer_id(&self) -> Result<Uuid, RetailerError> {
        self.retailer_id
            .get()
            .copied()
            .ok_or(RetailerError::NotInitialized)
    }

    async fn search_products(&self, params: SearchParams) -> RetailerResult<Vec<Product>> {
        if let Some(sku) = params.query.as_deref().and_then(sku_from_query) {
            let sku = sku.to_string();
            debug!(%sku, "search routed to direct sku lookup");
            return self
                .enqueue("search_by_sku", move |endpoint| async move {
                    endpoint.product(&sku).await.map(|p| vec![p])
                })
                .await;
        }
        self.enqueue("search_products", move |endpoint| async move {
            endpoint.search(&params).await
        })
        .await
    }

    async fn get_product(&self, sku: &str) -> RetailerResult<Product> {
        let sku = sku.trim().to_string();
        self.enqueue("get_product", move |endpoint| async move {
            endpoint.product(&sku).await
        })
        .await
    }

    async fn get_current_price(&self, sku: &str) -> RetailerResult<Decimal> {
        let product = self.get_product(sku).await?;
        Ok(product.attributes.regular_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_storage::memory::MemoryRetailerStore;
    use pricewatch_storage::{FetchError, TransportResponse};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<(u16, String)>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn reply(self, status: u16, body: &str) -> Self {
            self.replies.lock().unwrap().push_back((status, body.to_string()));
            self
        }

        fn urls(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> Result<TransportResponse, FetchError> {
            self.urls.lock().unwrap().push(url.to_string());
            let (status, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(FetchError::Closed)?;
            Ok(TransportResponse {
                status,
                body: body.into_bytes(),
            })
        }
    }

    const HEADPHONES: &str = r#"{
        "sku": 6525421,
        "name": "Sony WH-1000XM5 Wireless Noise Cancelling Headphones",
        "regularPrice": 129.99,
        "salePrice": 99.99,
        "categoryPath": [{"id": "abcat0200000", "name": "Audio"}, {"id": "pcmcat144700050004", "name": "Headphones"}],
        "modelNumber": "WH1000XM5/B",
        "description": null,
        "manufacturer": "Sony",
        "image": "https://example.test/6525421.jpg",
        "inStoreAvailability": false,
        "onlineAvailability": true
    }"#;

    fn client(transport: Arc<ScriptedTransport>) -> BestBuyRetailer {
        BestBuyRetailer::new(
            BestBuyConfig::new("test-key")
                .with_base_url("http://bestbuy.test/v1/")
                .with_request_delay(Duration::ZERO),
            transport,
            Arc::new(MemoryRetailerStore::new()),
        )
    }

    #[test]
    fn sku_prefix_detection() {
        assert_eq!(sku_from_query("sku:6525421"), Some("6525421"));
        assert_eq!(sku_from_query("  SKU: 6525421 "), Some("6525421"));
        assert_eq!(sku_from_query("sku:"), None);
        assert_eq!(sku_from_query("skull candy"), None);
        assert_eq!(sku_from_query("héadphones"), None);
    }

    #[test]
    fn delay_is_derived_from_rate() {
        assert_eq!(delay_for_rate(10), Duration::from_secs(6));
        assert_eq!(delay_for_rate(0), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn maps_wire_product_to_canonical_shape() {
        let transport = Arc::new(ScriptedTransport::default().reply(200, HEADPHONES));
        let retailer = client(Arc::clone(&transport));

        let product = retailer.get_product("6525421").await.unwrap();
        assert_eq!(product.external_id, "6525421");
        assert_eq!(product.category, "Headphones");
        assert_eq!(product.attributes.category_path, vec!["Audio", "Headphones"]);
        assert_eq!(product.attributes.regular_price, dec!(129.99));
        assert_eq!(product.attributes.description, None);
        assert!(product.active);

        let urls = transport.urls();
        assert_eq!(
            urls,
            vec!["http://bestbuy.test/v1/products/6525421.json?apiKey=test-key&format=json"]
        );
    }

    #[tokio::test]
    async fn current_price_uses_regular_price() {
        let transport = Arc::new(ScriptedTransport::default().reply(200, HEADPHONES));
        let price = client(transport).get_current_price("6525421").await.unwrap();
        assert_eq!(price, dec!(129.99));
    }

    #[tokio::test]
    async fn http_statuses_become_prefixed_warnings() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .reply(404, "{}")
                .reply(429, "{}")
                .reply(418, "{}"),
        );
        let retailer = client(transport);

        let not_found = retailer.get_current_price("0000000").await.unwrap_err();
        assert_eq!(not_found.status_code, 404);
        assert_eq!(not_found.code.as_deref(), Some("NOT_FOUND"));
        assert!(not_found.message.starts_with("Best Buy API:"));

        let limited = retailer.get_product("1").await.unwrap_err();
        assert_eq!(limited.status_code, 429);
        assert_eq!(limited.code.as_deref(), Some("RATE_LIMIT_EXCEEDED"));

        let teapot = retailer.get_product("1").await.unwrap_err();
        assert_eq!(teapot.status_code, 418);
        assert_eq!(teapot.code.as_deref(), Some("HTTP_ERROR"));
    }

    #[tokio::test]
    async fn transport_and_payload_failures_become_unknown_warnings() {
        let transport = Arc::new(ScriptedTransport::default().reply(200, "<html>oops</html>"));
        let retailer = client(transport);

        let malformed = retailer.get_product("1").await.unwrap_err();
        assert_eq!(malformed.status_code, 500);
        assert_eq!(malformed.code.as_deref(), Some("UNKNOWN"));

        // Script exhausted: the transport itself fails.
        let failed = retailer.get_product("1").await.unwrap_err();
        assert_eq!(failed.status_code, 500);
        assert!(failed.message.contains("transport closed"));
    }

    #[tokio::test]
    async fn search_envelope_on_lookup_uses_first_product() {
        let envelope = format!(r#"{{"products": [{HEADPHONES}]}}"#);
        let transport = Arc::new(
            ScriptedTransport::default()
                .reply(200, &envelope)
                .reply(200, r#"{"products": []}"#),
        );
        let retailer = client(transport);

        assert_eq!(retailer.get_product("6525421").await.unwrap().external_id, "6525421");
        assert!(retailer.get_product("6525421").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn sku_queries_route_to_product_lookup() {
        let transport = Arc::new(ScriptedTransport::default().reply(200, HEADPHONES));
        let retailer = client(Arc::clone(&transport));

        let found = retailer
            .search_products(SearchParams::query("SKU:6525421"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(transport.urls()[0].contains("/products/6525421.json"));
    }

    #[tokio::test]
    async fn search_builds_query_with_defaults() {
        let transport = Arc::new(ScriptedTransport::default().reply(200, r#"{"products": []}"#));
        let retailer = client(Arc::clone(&transport));

        let found = retailer
            .search_products(SearchParams {
                query: Some("noise cancelling".into()),
                category: Some("abcat0204000".into()),
                ..SearchParams::default()
            })
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(
            transport.urls()[0],
            "http://bestbuy.test/v1/products?apiKey=test-key&format=json&pageSize=10&page=1&search=noise+cancelling&categoryPath=abcat0204000"
        );
    }

    #[tokio::test]
    async fn retailer_id_requires_initialize() {
        let retailers = Arc::new(MemoryRetailerStore::new());
        let retailer = BestBuyRetailer::new(
            BestBuyConfig::new("k"),
            Arc::new(ScriptedTransport::default()),
            retailers.clone(),
        );

        assert!(matches!(retailer.retailer_id(), Err(RetailerError::NotInitialized)));
        assert!(matches!(
            retailer.initialize().await,
            Err(RetailerError::ResolutionFailure { .. })
        ));

        let row = retailers
            .upsert(BESTBUY_RETAILER_NAME, DEFAULT_BASE_URL, 10)
            .await
            .unwrap();
        assert_eq!(retailer.initialize().await.unwrap(), row.id);
        assert_eq!(retailer.retailer_id().unwrap(), row.id);
        assert_eq!(retailer.initialize().await.unwrap(), row.id);
    }
}
