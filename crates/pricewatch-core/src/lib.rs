//! Core domain model for price tracking: tracked products, price history,
//! retailer-facing product shape, warnings and validation rules.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Currency recorded for every observation polled from a US retailer.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Open key/value bag attached to a price observation.
pub type Metadata = JsonMap<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retailer {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    /// Requests per minute the retailer API tolerates.
    pub rate_limit: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inclusive price bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl PriceRange {
    pub fn new(min: Decimal, max: Decimal) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, price: Decimal) -> bool {
        self.min <= price && price <= self.max
    }
}

/// Expectations a fetched product must meet to be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_name_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_range: Option<PriceRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_terms: Vec<String>,
}

/// A `(retailer, sku)` pair the system monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProduct {
    pub id: Uuid,
    pub sku: String,
    pub retailer_id: Uuid,
    pub product_id: Option<Uuid>,
    pub name: String,
    pub validation_rules: ValidationRule,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrackedProduct {
    pub sku: String,
    pub retailer_id: Uuid,
    pub product_id: Option<Uuid>,
    pub name: String,
    pub validation_rules: ValidationRule,
}

/// Partial update for a tracked product; `None` leaves a column untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackedProductUpdate {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub product_id: Option<Uuid>,
    pub validation_rules: Option<ValidationRule>,
}

impl TrackedProductUpdate {
    pub fn is_empty(&self) -> bool {
        self.sku.is_none()
            && self.name.is_none()
            && self.product_id.is_none()
            && self.validation_rules.is_none()
    }

    pub fn apply_to(&self, product: &mut TrackedProduct) {
        if let Some(sku) = &self.sku {
            product.sku = sku.clone();
        }
        if let Some(name) = &self.name {
            product.name = name.clone();
        }
        if let Some(product_id) = self.product_id {
            product.product_id = Some(product_id);
        }
        if let Some(rules) = &self.validation_rules {
            product.validation_rules = rules.clone();
        }
    }
}

/// One append-only price snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub price: Decimal,
    pub currency: String,
    pub is_available: bool,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceObservation {
    pub product_id: Uuid,
    pub price: Decimal,
    pub currency: String,
    pub is_available: bool,
    pub metadata: Metadata,
}

impl NewPriceObservation {
    pub fn available_usd(product_id: Uuid, price: Decimal) -> Self {
        Self {
            product_id,
            price,
            currency: DEFAULT_CURRENCY.to_string(),
            is_available: true,
            metadata: Metadata::new(),
        }
    }
}

/// Consecutive pair of observations whose relative change crossed a threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub from: PriceObservation,
    pub to: PriceObservation,
    pub percent_change: Decimal,
}

impl PriceChange {
    /// Returns `None` when `from` has a zero price.
    pub fn between(from: PriceObservation, to: PriceObservation) -> Option<Self> {
        if from.price.is_zero() {
            return None;
        }
        let percent_change = (to.price - from.price) / from.price * Decimal::ONE_HUNDRED;
        Some(Self {
            from,
            to,
            percent_change,
        })
    }

    pub fn relative_change(&self) -> Decimal {
        (self.percent_change / Decimal::ONE_HUNDRED).abs()
    }
}

/// Retailer product mapped into the canonical shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub external_id: String,
    pub name: String,
    pub category: String,
    pub attributes: ProductAttributes,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttributes {
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub regular_price: Decimal,
    pub in_store_availability: bool,
    pub online_availability: bool,
    pub category_path: Vec<String>,
}

/// Stored catalogue row for a retailer product, keyed by `(retailer_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub retailer_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub category: String,
    pub attributes: ProductAttributes,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogProduct {
    pub fn to_product(&self) -> Product {
        Product {
            external_id: self.external_id.clone(),
            name: self.name.clone(),
            category: self.category.clone(),
            attributes: self.attributes.clone(),
            active: self.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogProductUpdate {
    pub name: Option<String>,
    pub category: Option<String>,
    pub attributes: Option<ProductAttributes>,
    pub active: Option<bool>,
}

impl CatalogProductUpdate {
    /// Every mutable column taken from a freshly mapped product.
    pub fn refresh_from(product: &Product) -> Self {
        Self {
            name: Some(product.name.clone()),
            category: Some(product.category.clone()),
            attributes: Some(product.attributes.clone()),
            active: Some(product.active),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.attributes.is_none()
            && self.active.is_none()
    }

    pub fn apply_to(&self, row: &mut CatalogProduct) {
        if let Some(name) = &self.name {
            row.name = name.clone();
        }
        if let Some(category) = &self.category {
            row.category = category.clone();
        }
        if let Some(attributes) = &self.attributes {
            row.attributes = attributes.clone();
        }
        if let Some(active) = self.active {
            row.active = active;
        }
    }
}

/// Non-exceptional failure returned inline by retailer calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{status_code} {message}")]
pub struct HttpWarning {
    pub status_code: u16,
    pub message: String,
    pub code: Option<String>,
}

/// Outcome of a retailer call: data, or a warning the caller must inspect.
pub type RetailerResult<T> = Result<T, HttpWarning>;

impl HttpWarning {
    pub fn new(status_code: u16, message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status_code,
            message: message.into(),
            code: code.map(str::to_string),
        }
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request", Some("BAD_REQUEST"))
    }

    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized", Some("UNAUTHORIZED"))
    }

    pub fn forbidden() -> Self {
        Self::new(403, "Forbidden", Some("FORBIDDEN"))
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found", Some("NOT_FOUND"))
    }

    pub fn rate_limit_exceeded() -> Self {
        Self::new(429, "Too Many Requests", Some("RATE_LIMIT_EXCEEDED"))
    }

    pub fn internal_server() -> Self {
        Self::new(500, "Internal Server Error", Some("INTERNAL_SERVER_ERROR"))
    }

    pub fn bad_gateway() -> Self {
        Self::new(502, "Bad Gateway", Some("BAD_GATEWAY"))
    }

    pub fn service_unavailable() -> Self {
        Self::new(503, "Service Unavailable", Some("SERVICE_UNAVAILABLE"))
    }

    pub fn http_error(status_code: u16) -> Self {
        Self::new(
            status_code,
            format!("HTTP error {status_code}"),
            Some("HTTP_ERROR"),
        )
    }

    /// Transport failures and unexpected errors collapse into a 500-class warning.
    pub fn unknown(detail: impl fmt::Display) -> Self {
        Self::new(500, format!("Unknown error: {detail}"), Some("UNKNOWN"))
    }

    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            400 => Self::bad_request(),
            401 => Self::unauthorized(),
            403 => Self::forbidden(),
            404 => Self::not_found(),
            429 => Self::rate_limit_exceeded(),
            500 => Self::internal_server(),
            502 => Self::bad_gateway(),
            503 => Self::service_unavailable(),
            other => Self::http_error(other),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Idle,
    Polling,
    Error,
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Process-local poller counters. Snapshots are plain owned copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollMetrics {
    pub last_run_time: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// No rule means every price is acceptable.
pub fn is_valid_price(price: Decimal, range: Option<&PriceRange>) -> bool {
    range.map_or(true, |r| r.contains(price))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationViolation {
    NameMismatch { expected: String, actual: String },
    PriceOutOfRange { price: Decimal, range: PriceRange },
    MissingRequiredTerm { term: String },
    ExcludedTermPresent { term: String },
}

impl fmt::Display for ValidationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameMismatch { expected, actual } => {
                write!(f, "name mismatch: expected `{expected}`, got `{actual}`")
            }
            Self::PriceOutOfRange { price, range } => {
                write!(f, "price {price} outside [{}, {}]", range.min, range.max)
            }
            Self::MissingRequiredTerm { term } => write!(f, "missing required term `{term}`"),
            Self::ExcludedTermPresent { term } => write!(f, "contains excluded term `{term}`"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub violations: Vec<ValidationViolation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

impl ValidationRule {
    pub fn is_empty(&self) -> bool {
        self.exact_name_match.is_none()
            && self.price_range.is_none()
            && self.required_terms.is_empty()
            && self.excluded_terms.is_empty()
    }

    pub fn check_price(&self, price: Decimal) -> Option<ValidationViolation> {
        match &self.price_range {
            Some(range) if !range.contains(price) => Some(ValidationViolation::PriceOutOfRange {
                price,
                range: *range,
            }),
            _ => None,
        }
    }

    /// Runs every configured check against a fetched product.
    ///
    /// Term checks are case-insensitive and look at the name and description.
    pub fn evaluate(&self, product: &Product) -> ValidationReport {
        let mut violations = Vec::new();

        if let Some(expected) = &self.exact_name_match {
            if expected.trim() != product.name.trim() {
                violations.push(ValidationViolation::NameMismatch {
                    expected: expected.clone(),
                    actual: product.name.clone(),
                });
            }
        }

        if let Some(v) = self.check_price(product.attributes.regular_price) {
            violations.push(v);
        }

        let haystack = format!(
            "{} {}",
            product.name,
            product.attributes.description.as_deref().unwrap_or_default()
        )
        .to_lowercase();

        for term in &self.required_terms {
            if !haystack.contains(&term.to_lowercase()) {
                violations.push(ValidationViolation::MissingRequiredTerm { term: term.clone() });
            }
        }
        for term in &self.excluded_terms {
            if haystack.contains(&term.to_lowercase()) {
                violations.push(ValidationViolation::ExcludedTermPresent { term: term.clone() });
            }
        }

        ValidationReport { violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn mk_product(name: &str, description: &str, price: Decimal) -> Product {
        Product {
            external_id: "6525421".into(),
            name: name.to_string(),
            category: "Cell Phones".into(),
            attributes: ProductAttributes {
                manufacturer: Some("Apple".into()),
                model_number: None,
                description: Some(description.to_string()),
                image: None,
                regular_price: price,
                in_store_availability: true,
                online_availability: true,
                category_path: vec!["Cell Phones".into()],
            },
            active: true,
        }
    }

    #[test]
    fn price_range_is_inclusive_and_optional() {
        let range = PriceRange::new(dec!(100), dec!(200));
        assert!(is_valid_price(dec!(150), Some(&range)));
        assert!(is_valid_price(dec!(100), Some(&range)));
        assert!(is_valid_price(dec!(200), Some(&range)));
        assert!(!is_valid_price(dec!(99), Some(&range)));
        assert!(!is_valid_price(dec!(200.01), Some(&range)));
        assert!(is_valid_price(dec!(123456), None));
    }

    #[test]
    fn evaluate_collects_every_violation() {
        let rule = ValidationRule {
            exact_name_match: Some("iPhone 15 Pro Max".into()),
            price_range: Some(PriceRange::new(dec!(900), dec!(1500))),
            required_terms: vec!["256GB".into(), "Unlocked".into()],
            excluded_terms: vec!["refurbished".into()],
        };
        let product = mk_product(
            "Apple - iPhone 15 Pro Max 256GB (Refurbished)",
            "Unlocked phone",
            dec!(799.99),
        );

        let report = rule.evaluate(&product);
        assert!(!report.is_valid());
        assert_eq!(report.violations.len(), 3);
        assert!(matches!(report.violations[0], ValidationViolation::NameMismatch { .. }));
        assert!(matches!(report.violations[1], ValidationViolation::PriceOutOfRange { .. }));
        assert_eq!(
            report.violations[2],
            ValidationViolation::ExcludedTermPresent {
                term: "refurbished".into()
            }
        );
    }

    #[test]
    fn evaluate_passes_matching_product() {
        let rule = ValidationRule {
            exact_name_match: Some("iPhone 15 Pro Max".into()),
            price_range: Some(PriceRange::new(dec!(900), dec!(1500))),
            required_terms: vec!["256gb".into()],
            excluded_terms: vec!["case".into()],
        };
        let product = mk_product(" iPhone 15 Pro Max ", "256GB Natural Titanium", dec!(1199.99));
        assert!(rule.evaluate(&product).is_valid());
        assert!(ValidationRule::default().evaluate(&product).is_valid());
    }

    #[test]
    fn warning_factory_maps_known_statuses() {
        assert_eq!(HttpWarning::from_status(404), HttpWarning::not_found());
        assert_eq!(HttpWarning::from_status(429).status_code, 429);
        assert_eq!(HttpWarning::from_status(502).message, "Bad Gateway");
        let teapot = HttpWarning::from_status(418);
        assert_eq!(teapot.status_code, 418);
        assert_eq!(teapot.code.as_deref(), Some("HTTP_ERROR"));

        let unknown = HttpWarning::unknown("connection reset").with_prefix("Best Buy API");
        assert_eq!(unknown.status_code, 500);
        assert_eq!(unknown.to_string(), "500 Best Buy API: Unknown error: connection reset");
    }

    #[test]
    fn price_change_reports_signed_percent() {
        let id = Uuid::new_v4();
        let at = Utc::now();
        let obs = |price| PriceObservation {
            id: Uuid::new_v4(),
            product_id: id,
            price,
            currency: DEFAULT_CURRENCY.into(),
            is_available: true,
            metadata: Metadata::new(),
            timestamp: at,
        };
        let change = PriceChange::between(obs(dec!(200)), obs(dec!(150))).unwrap();
        assert_eq!(change.percent_change, dec!(-25));
        assert_eq!(change.relative_change(), dec!(0.25));
        assert!(PriceChange::between(obs(Decimal::ZERO), obs(dec!(1))).is_none());
    }

    #[test]
    fn validation_rule_yaml_style_defaults() {
        let rule: ValidationRule =
            serde_json::from_str(r#"{"price_range":{"min":"10","max":"20"}}"#).unwrap();
        assert!(rule.required_terms.is_empty());
        assert_eq!(rule.price_range, Some(PriceRange::new(dec!(10), dec!(20))));
        let json = serde_json::to_value(&ValidationRule::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn catalog_refresh_overwrites_mutable_columns() {
        let now = Utc::now();
        let mut row = CatalogProduct {
            id: Uuid::new_v4(),
            retailer_id: Uuid::new_v4(),
            external_id: "6525421".into(),
            name: "Old name".into(),
            category: "Uncategorized".into(),
            attributes: mk_product("x", "", dec!(1)).attributes,
            active: false,
            created_at: now,
            updated_at: now,
        };
        let fresh = mk_product("iPhone 15", "128GB", dec!(799.99));

        assert!(CatalogProductUpdate::default().is_empty());
        CatalogProductUpdate::refresh_from(&fresh).apply_to(&mut row);
        assert_eq!(row.to_product(), fresh);
        assert_eq!(row.external_id, "6525421");
    }
}
