use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use pricewatch_adapters::{RetailerService, SearchParams};
use pricewatch_core::{NewTrackedProduct, PriceRange, TrackedProduct, ValidationRule};
use pricewatch_storage::{PriceHistoryStore, TrackedProductStore};
use pricewatch_sync::{init_logging, load_seed_file, seed_tracked_products, AppConfig, PriceWatch};
use rust_decimal::Decimal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Retail price tracker for Best Buy products")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the schema and register the Best Buy retailer row.
    Migrate,
    #[command(subcommand)]
    Track(TrackCommand),
    /// Run a single polling pass and print the metrics.
    Poll,
    /// Poll on the configured interval until Ctrl-C.
    Serve,
    Search {
        #[arg(required = true)]
        terms: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        category: Option<String>,
    },
    Price {
        sku: String,
    },
    /// Fetch a tracked SKU and evaluate its validation rules.
    Check {
        sku: String,
    },
    History {
        sku: String,
        #[arg(long, default_value_t = 30)]
        days: i64,
        /// Minimum relative change between observations, 0.05 = 5%.
        #[arg(long, default_value = "0.01")]
        min_change: Decimal,
    },
}

#[derive(Debug, Subcommand)]
enum TrackCommand {
    Add(TrackAdd),
    List,
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct TrackAdd {
    sku: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    exact_name: Option<String>,
    #[arg(long, requires = "max")]
    min: Option<Decimal>,
    #[arg(long, requires = "min")]
    max: Option<Decimal>,
    #[arg(long = "require")]
    required_terms: Vec<String>,
    #[arg(long = "exclude")]
    excluded_terms: Vec<String>,
}

impl TrackAdd {
    fn rules(&self) -> Result<ValidationRule> {
        let price_range = match (self.min, self.max) {
            (Some(min), Some(max)) if min > max => bail!("--min {min} is above --max {max}"),
            (Some(min), Some(max)) => Some(PriceRange::new(min, max)),
            _ => None,
        };
        Ok(ValidationRule {
            exact_name_match: self.exact_name.clone(),
            price_range,
            required_terms: self.required_terms.clone(),
            excluded_terms: self.excluded_terms.clone(),
        })
    }
}

/// Start of a `days`-long window ending at `end`; at least one day.
fn history_start(end: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    ChronoDuration::try_days(days.max(1))
        .and_then(|window| end.checked_sub_signed(window))
        .with_context(|| format!("--days {days} reaches past the supported date range"))
}

async fn tracked(watch: &PriceWatch, sku: &str) -> Result<TrackedProduct> {
    let retailer_id = watch.retailer.retailer_id()?;
    watch
        .products
        .find_by_sku(retailer_id, sku)
        .await?
        .with_context(|| format!("sku {sku} is not tracked; add it with `pricewatch track add`"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    init_logging(&config.log_level);

    let command = cli.command.unwrap_or(Commands::Poll);
    let watch = PriceWatch::connect(config).await?;

    match command {
        Commands::Migrate => {
            println!("migrations applied; retailer {} ready", watch.retailer.retailer_id()?);
        }
        Commands::Track(TrackCommand::Add(add)) => {
            let product = watch
                .products
                .create(NewTrackedProduct {
                    sku: add.sku.trim().to_string(),
                    retailer_id: watch.retailer.retailer_id()?,
                    product_id: None,
                    name: add.name.clone(),
                    validation_rules: add.rules()?,
                })
                .await?;
            println!("tracking {} ({}) id={}", product.sku, product.name, product.id);
        }
        Commands::Track(TrackCommand::List) => {
            let products = watch
                .products
                .find_by_retailer_id(watch.retailer.retailer_id()?)
                .await?;
            for product in products {
                let latest = watch.prices.find_latest(product.id).await?;
                let price = latest.map_or_else(|| "-".to_string(), |o| format!("{} {}", o.price, o.currency));
                println!("{:<10} {:<48} {}", product.sku, product.name, price);
            }
        }
        Commands::Track(TrackCommand::Seed { file }) => {
            let path = file.unwrap_or_else(|| watch.config.seed_file.clone());
            let seed = load_seed_file(&path)?;
            let report = seed_tracked_products(
                watch.products.as_ref(),
                watch.retailer.retailer_id()?,
                &seed.products,
            )
            .await?;
            println!(
                "seeded {}: created={} updated={} unchanged={}",
                path.display(),
                report.created,
                report.updated,
                report.unchanged
            );
        }
        Commands::Poll => {
            let report = watch.poller().poll().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            let poller = watch.poller();
            poller.start().await;
            info!("polling until interrupted");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            poller.stop().await;
            println!("{}", serde_json::to_string_pretty(&poller.metrics())?);
        }
        Commands::Search {
            terms,
            limit,
            category,
        } => {
            let products = watch
                .retailer
                .search_products(SearchParams {
                    query: Some(terms.join(" ")),
                    category,
                    page: Some(1),
                    page_size: Some(limit.max(1)),
                })
                .await?;
            for p in products {
                println!(
                    "{:<10} {:>10} {:<16} {}",
                    p.external_id, p.attributes.regular_price, p.category, p.name
                );
            }
        }
        Commands::Price { sku } => {
            let price = watch.retailer.get_current_price(&sku).await?;
            println!("{sku}: {price} USD");
        }
        Commands::Check { sku } => {
            let product = tracked(&watch, &sku).await?;
            let live = watch.retailer.get_product(&product.sku).await?;
            let report = product.validation_rules.evaluate(&live);
            if report.is_valid() {
                println!("{sku}: ok ({} at {})", live.name, live.attributes.regular_price);
            } else {
                println!("{sku}: {} violation(s)", report.violations.len());
                for v in &report.violations {
                    println!("  - {v}");
                }
            }
        }
        Commands::History {
            sku,
            days,
            min_change,
        } => {
            let product = tracked(&watch, &sku).await?;
            let end = Utc::now();
            let start = history_start(end, days)?;
            let rows = watch.prices.find_in_range(product.id, start, end).await?;
            for row in &rows {
                println!("{}  {} {}", row.timestamp.format("%Y-%m-%d %H:%M"), row.price, row.currency);
            }
            if let Some(avg) = watch.prices.average_price(product.id).await? {
                println!("average: {}", avg.round_dp(2));
            }
            for change in watch.prices.price_changes(product.id, min_change).await? {
                println!(
                    "{} -> {} ({}%) at {}",
                    change.from.price,
                    change.to.price,
                    change.percent_change.round_dp(2),
                    change.to.timestamp.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }

    Ok(())
}
