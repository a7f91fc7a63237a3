use tracing_subscriber::EnvFilter;

/// Default filter directives for a base level; `RUST_LOG` still wins.
pub fn default_filter(level: &str) -> String {
    format!(
        "{level},pricewatch_sync={level},pricewatch_adapters={level},pricewatch_storage={level},sqlx=warn,reqwest=warn"
    )
}

pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_driver_crates() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("sqlx=warn"));
        assert!(filter.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
