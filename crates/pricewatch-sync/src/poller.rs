//! Scheduled price collection over every tracked product of one retailer.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use pricewatch_adapters::{RetailerError, RetailerService};
use pricewatch_core::{
    HttpWarning, Metadata, NewPriceObservation, PollMetrics, PollStatus, TrackedProduct,
    TrackedProductUpdate, ValidationViolation,
};
use pricewatch_storage::{PriceHistoryStore, ProductStore, StoreError, TrackedProductStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub const PRICE_OUT_OF_RANGE_FLAG: &str = "price_out_of_range";

/// What a pass does when one product's lookup fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassFailurePolicy {
    /// Stop the pass at the first failure.
    #[default]
    AbortPass,
    /// Count the failure and move on to the next product.
    SkipProduct,
}

impl fmt::Display for PassFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AbortPass => "abort-pass",
            Self::SkipProduct => "skip-product",
        })
    }
}

impl FromStr for PassFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort-pass" | "abort" => Ok(Self::AbortPass),
            "skip-product" | "skip" => Ok(Self::SkipProduct),
            other => Err(format!("unknown failure policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    pub failure_policy: PassFailurePolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            failure_policy: PassFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Retailer(#[from] RetailerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to fetch price for {sku}: {}", .warning.message)]
    Price { sku: String, warning: HttpWarning },
}

/// Counts for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub recorded: usize,
    pub flagged: usize,
    pub failed: usize,
    pub completed: bool,
}

#[derive(Debug)]
struct PollerState {
    status: PollStatus,
    scheduled: bool,
    metrics: PollMetrics,
}

struct Schedule {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct PollerInner {
    retailer: Arc<dyn RetailerService>,
    products: Arc<dyn TrackedProductStore>,
    prices: Arc<dyn PriceHistoryStore>,
    catalog: Option<Arc<dyn ProductStore>>,
    config: PollerConfig,
    state: Mutex<PollerState>,
    // Manual and scheduled passes never interleave.
    pass_lock: tokio::sync::Mutex<()>,
}

pub struct PricePoller {
    inner: Arc<PollerInner>,
    schedule: Mutex<Option<Schedule>>,
}

impl fmt::Debug for PricePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PricePoller")
            .field("retailer", &self.inner.retailer.name())
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn out_of_range_metadata(violation: &ValidationViolation) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("flags".into(), json!([PRICE_OUT_OF_RANGE_FLAG]));
    if let ValidationViolation::PriceOutOfRange { range, .. } = violation {
        metadata.insert("expected_min".into(), JsonValue::String(range.min.to_string()));
        metadata.insert("expected_max".into(), JsonValue::String(range.max.to_string()));
    }
    metadata
}

impl PollerInner {
    fn state(&self) -> MutexGuard<'_, PollerState> {
        lock(&self.state)
    }

    async fn run_pass(&self) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let span = info_span!("poll_pass", retailer = self.retailer.name());
        let mut report = PassReport::default();
        let outcome = self.collect(&mut report).instrument(span).await;

        let mut state = self.state();
        match outcome {
            Ok(()) => {
                report.completed = true;
                state.metrics.last_run_time = Some(Utc::now());
                if report.failed == 0 && state.scheduled && state.status == PollStatus::Error {
                    state.status = PollStatus::Polling;
                }
                info!(
                    recorded = report.recorded,
                    flagged = report.flagged,
                    failed = report.failed,
                    "poll pass finished"
                );
            }
            Err(err) => {
                report.failed += 1;
                state.status = PollStatus::Error;
                state.metrics.error_count += 1;
                state.metrics.last_error = Some(err.to_string());
                error!(error = %err, recorded = report.recorded, "poll pass aborted");
            }
        }
        report
    }

    async fn collect(&self, report: &mut PassReport) -> Result<(), PollError> {
        let retailer_id = self.retailer.retailer_id()?;
        let products = self.products.find_by_retailer_id(retailer_id).await?;
        info!(count = products.len(), "tracked products loaded");

        for product in &products {
            match self.record_price(retailer_id, product).await {
                Ok(flagged) => {
                    report.recorded += 1;
                    report.flagged += usize::from(flagged);
                    self.state().metrics.success_count += 1;
                }
                Err(err) if self.config.failure_policy == PassFailurePolicy::SkipProduct => {
                    report.failed += 1;
                    warn!(sku = %product.sku, error = %err, "skipping product after failure");
                    let mut state = self.state();
                    state.status = PollStatus::Error;
                    state.metrics.error_count += 1;
                    state.metrics.last_error = Some(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Fetches and stores one price. Returns whether it was flagged.
    async fn record_price(
        &self,
        retailer_id: Uuid,
        product: &TrackedProduct,
    ) -> Result<bool, PollError> {
        let price = self
            .retailer
            .get_current_price(&product.sku)
            .await
            .map_err(|warning| PollError::Price {
                sku: product.sku.clone(),
                warning,
            })?;

        let mut observation = NewPriceObservation::available_usd(product.id, price);
        let violation = product.validation_rules.check_price(price);
        if let Some(violation) = &violation {
            warn!(sku = %product.sku, %violation, "price outside expected range, flagging");
            observation.metadata = out_of_range_metadata(violation);
        }

        self.prices.create(observation).await?;

        if let (Some(catalog), None) = (&self.catalog, product.product_id) {
            // The catalogue link is retried next pass; it never fails the product.
            match self.link_catalog(catalog.as_ref(), retailer_id, product).await {
                Ok(catalog_id) => debug!(sku = %product.sku, %catalog_id, "tracked product linked to catalogue"),
                Err(err) => warn!(sku = %product.sku, error = %err, "catalogue link failed"),
            }
        }
        Ok(violation.is_some())
    }

    /// Upserts the retailer's product into the catalogue and records the
    /// link on the tracked product.
    async fn link_catalog(
        &self,
        catalog: &dyn ProductStore,
        retailer_id: Uuid,
        product: &TrackedProduct,
    ) -> Result<Uuid, PollError> {
        let mapped = self
            .retailer
            .get_product(&product.sku)
            .await
            .map_err(|warning| PollError::Price {
                sku: product.sku.clone(),
                warning,
            })?;
        let row = catalog.upsert(retailer_id, &mapped).await?;
        self.products
            .update(
                product.id,
                TrackedProductUpdate {
                    product_id: Some(row.id),
                    ..TrackedProductUpdate::default()
                },
            )
            .await?;
        Ok(row.id)
    }
}

impl PricePoller {
    pub fn new(
        retailer: Arc<dyn RetailerService>,
        products: Arc<dyn TrackedProductStore>,
        prices: Arc<dyn PriceHistoryStore>,
        config: PollerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                retailer,
                products,
                prices,
                catalog: None,
                config,
                state: Mutex::new(PollerState {
                    status: PollStatus::Idle,
                    scheduled: false,
                    metrics: PollMetrics::default(),
                }),
                pass_lock: tokio::sync::Mutex::new(()),
            }),
            schedule: Mutex::new(None),
        }
    }

    /// Links each tracked product to a catalogue row after its first
    /// successful price. Has no effect once the poller has started.
    pub fn with_catalog(mut self, catalog: Arc<dyn ProductStore>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.catalog = Some(catalog),
            None => warn!("catalogue attached after the poller started, ignoring"),
        }
        self
    }

    pub fn status(&self) -> PollStatus {
        self.inner.state().status
    }

    /// Owned snapshot of the counters.
    pub fn metrics(&self) -> PollMetrics {
        self.inner.state().metrics.clone()
    }

    pub fn config(&self) -> PollerConfig {
        self.inner.config
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.state().scheduled
    }

    /// Runs one pass now, outside the schedule.
    pub async fn poll(&self) -> PassReport {
        self.inner.run_pass().await
    }

    /// Runs one pass immediately, then repeats every configured interval.
    /// A no-op when already started. An `error` status left by a manual
    /// `poll()` does not block starting.
    pub async fn start(&self) {
        {
            let mut state = self.inner.state();
            if state.scheduled {
                warn!(status = %state.status, "price poller already running");
                return;
            }
            state.status = PollStatus::Polling;
            state.scheduled = true;
        }

        self.inner.run_pass().await;

        let mut schedule = lock(&self.schedule);
        if !self.inner.state().scheduled {
            // stop() landed during the first pass.
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // Shutdown wins over an overdue tick.
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        inner.run_pass().await;
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *schedule = Some(Schedule { shutdown, task });
        info!(interval_secs = interval.as_secs_f64(), "price polling started");
    }

    /// Cancels the schedule and returns to idle. A pass already running is
    /// allowed to finish first. No-op when not started.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state();
            if !state.scheduled {
                return;
            }
            state.scheduled = false;
        }
        let schedule = lock(&self.schedule).take();

        if let Some(Schedule { shutdown, task }) = schedule {
            let _ = shutdown.send(true);
            if let Err(err) = task.await {
                error!(error = %err, "poll schedule task ended abnormally");
            }
        }
        // Wait out a pass started by start() or poll().
        let _pass = self.inner.pass_lock.lock().await;
        self.inner.state().status = PollStatus::Idle;
        info!("price polling stopped");
    }
}

impl Drop for PricePoller {
    fn drop(&mut self) {
        if let Some(schedule) = lock(&self.schedule).take() {
            let _ = schedule.shutdown.send(true);
            schedule.task.abort();
        }
    }
}
