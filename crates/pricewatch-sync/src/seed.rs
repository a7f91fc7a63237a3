//! Tracked-product seed file (`tracked_products.yaml`).

use std::path::Path;

use anyhow::{Context, Result};
use pricewatch_core::{NewTrackedProduct, TrackedProductUpdate, ValidationRule};
use pricewatch_storage::TrackedProductStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFile {
    pub products: Vec<SeedProduct>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedProduct {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub validation_rules: ValidationRule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

pub fn parse_seed_file(yaml: &str) -> Result<SeedFile> {
    let file: SeedFile = serde_yaml::from_str(yaml).context("parsing tracked products yaml")?;
    for product in &file.products {
        anyhow::ensure!(!product.sku.trim().is_empty(), "seed product {:?} has an empty sku", product.name);
        if let Some(range) = &product.validation_rules.price_range {
            anyhow::ensure!(
                range.min <= range.max,
                "seed product {} has price range min {} above max {}",
                product.sku,
                range.min,
                range.max
            );
        }
    }
    Ok(file)
}

pub fn load_seed_file(path: impl AsRef<Path>) -> Result<SeedFile> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_seed_file(&raw).with_context(|| format!("loading {}", path.display()))
}

/// Creates missing products and refreshes name/rules on existing ones.
pub async fn seed_tracked_products(
    store: &dyn TrackedProductStore,
    retailer_id: Uuid,
    products: &[SeedProduct],
) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for seed in products {
        let sku = seed.sku.trim();
        match store.find_by_sku(retailer_id, sku).await? {
            None => {
                store
                    .create(NewTrackedProduct {
                        sku: sku.to_string(),
                        retailer_id,
                        product_id: None,
                        name: seed.name.clone(),
                        validation_rules: seed.validation_rules.clone(),
                    })
                    .await
                    .with_context(|| format!("creating tracked product {sku}"))?;
                report.created += 1;
            }
            Some(existing)
                if existing.name == seed.name
                    && existing.validation_rules == seed.validation_rules =>
            {
                debug!(sku, "seed product unchanged");
                report.unchanged += 1;
            }
            Some(existing) => {
                store
                    .update(
                        existing.id,
                        TrackedProductUpdate {
                            name: Some(seed.name.clone()),
                            validation_rules: Some(seed.validation_rules.clone()),
                            ..TrackedProductUpdate::default()
                        },
                    )
                    .await
                    .with_context(|| format!("updating tracked product {sku}"))?;
                report.updated += 1;
            }
        }
    }
    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        "tracked products seeded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_storage::memory::MemoryTrackedProductStore;
    use rust_decimal_macros::dec;
    use std::io::Write;

    const SEED: &str = r#"
products:
  - sku: "6525421"
    name: Sony WH-1000XM5 Headphones
    validation_rules:
      exact_name_match: Sony - WH-1000XM5 Wireless Noise Cancelling Headphones
      price_range: { min: 300, max: 450 }
      excluded_terms: [renewed, refurbished]
  - sku: "6522642"
    name: PlayStation 5 Slim
"#;

    #[test]
    fn parses_rules_and_defaults() {
        let file = parse_seed_file(SEED).unwrap();
        assert_eq!(file.products.len(), 2);
        let range = file.products[0].validation_rules.price_range.unwrap();
        assert_eq!((range.min, range.max), (dec!(300), dec!(450)));
        assert!(file.products[1].validation_rules.is_empty());
    }

    #[test]
    fn workspace_seed_file_loads() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let file = load_seed_file(root.join("tracked_products.yaml")).unwrap();
        assert_eq!(file.products.len(), 20);
        assert!(file
            .products
            .iter()
            .all(|p| p.validation_rules.price_range.is_some()));
    }

    #[test]
    fn rejects_inverted_ranges() {
        let err = parse_seed_file(
            "products:\n  - sku: '1'\n    name: x\n    validation_rules:\n      price_range: { min: 10, max: 5 }\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("above max"));
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_refreshes_changes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();
        let seed = load_seed_file(file.path()).unwrap();

        let store = MemoryTrackedProductStore::new();
        let retailer_id = Uuid::new_v4();

        let first = seed_tracked_products(&store, retailer_id, &seed.products).await.unwrap();
        assert_eq!(first, SeedReport { created: 2, updated: 0, unchanged: 0 });

        let mut changed = seed.products.clone();
        changed[1].name = "PlayStation 5 Slim Console".into();
        let second = seed_tracked_products(&store, retailer_id, &changed).await.unwrap();
        assert_eq!(second, SeedReport { created: 0, updated: 1, unchanged: 1 });

        let stored = store.find_by_sku(retailer_id, "6522642").await.unwrap().unwrap();
        assert_eq!(stored.name, "PlayStation 5 Slim Console");
    }
}
