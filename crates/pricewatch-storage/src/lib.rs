//! Persistence and HTTP transport for the price watcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod memory;
mod postgres;
mod rate_limiter;
mod store;

pub use postgres::{
    connect, run_migrations, PgPriceHistoryStore, PgProductStore, PgRetailerStore,
    PgTrackedProductStore, MIGRATOR,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, DEFAULT_PERMIT_COOLDOWN};
pub use store::{
    detect_price_changes, PriceHistoryStore, ProductStore, RetailerStore, StoreError, StoreResult,
    TrackedProductStore,
};

pub const CRATE_NAME: &str = "pricewatch-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Outstanding-request budget shared by every call through this fetcher.
    pub rate_limit: Option<RateLimiterConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            rate_limit: None,
        }
    }
}

/// Raw response handed back to retailer clients; non-2xx statuses are not errors here.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport closed")]
    Closed,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let limiter = config.rate_limit.map(|c| Arc::new(RateLimiter::new(c)));

        Ok(Self { client, limiter })
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }
}

/// Strips the query string so credentials never reach the logs.
fn loggable_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn get(&self, url: &str) -> Result<TransportResponse, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_with_cooldown().await;
        }

        let span = info_span!("http_fetch", url = loggable_url(url));
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?.to_vec();
            debug!(status, bytes = body.len(), "response received");
            Ok::<_, FetchError>(TransportResponse {
                status,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    #[test]
    fn loggable_url_drops_query() {
        assert_eq!(
            loggable_url("https://api.bestbuy.com/v1/products/1.json?apiKey=secret&format=json"),
            "https://api.bestbuy.com/v1/products/1.json"
        );
        assert_eq!(loggable_url("http://x/y"), "http://x/y");
    }

    #[tokio::test]
    async fn fetcher_returns_non_success_status_as_response() {
        let base = serve_once("404 Not Found", r#"{"error":"missing"}"#).await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let resp = fetcher
            .get(&format!("{base}/products/1.json?apiKey=k"))
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert!(!resp.is_success());
        assert_eq!(resp.body, br#"{"error":"missing"}"#);
    }

    #[tokio::test]
    async fn fetcher_consumes_a_permit_when_limited() {
        let base = serve_once("200 OK", "{}").await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            rate_limit: Some(RateLimiterConfig::new(2).with_cooldown(Duration::from_secs(30))),
            ..HttpClientConfig::default()
        })
        .unwrap();

        let resp = fetcher.get(&format!("{base}/ok")).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(fetcher.limiter().unwrap().available(), 1);
    }
}
