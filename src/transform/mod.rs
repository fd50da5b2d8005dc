pub mod fields;
pub mod price;

use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use fields::{as_count, as_f64, as_text, clean_field, first, first_map, lookup, parse_timestamp, text_field};

/// One warehouse row. Field order and names follow [`crate::schema::COLUMNS`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductRow {
    pub product_id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency_id: Option<String>,
    pub condition: Option<String>,
    pub category_id: Option<String>,
    pub thumbnail_url: Option<String>,
    pub permalink: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub seller_id: Option<String>,
    pub seller_nickname: Option<String>,
    #[serde(serialize_with = "json_string")]
    pub seller_reputation: Option<Value>,
    pub seller_power_seller_status: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(serialize_with = "json_string")]
    pub attributes: Option<Value>,
    pub pictures: Vec<String>,
    pub warranty: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub memory: Option<String>,
    pub color: Option<String>,
    pub extraction_date: DateTime<Utc>,
    #[serde(rename = "JOB_RUN")]
    pub job_run: DateTime<Utc>,
}

/// JSON columns travel as encoded strings in newline-delimited loads.
fn json_string<S: Serializer>(value: &Option<Value>, ser: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => ser.serialize_str(&v.to_string()),
        None => ser.serialize_none(),
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no product id")]
    MissingId,
}

#[derive(Debug)]
pub struct Rejection {
    pub index: usize,
    pub product_id: Option<String>,
    pub error: TransformError,
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub rows: Vec<ProductRow>,
    pub rejected: Vec<Rejection>,
}

const ID_KEYS: &[&str] = &["id", "product_id", "productId", "itemId", "item_id", "sku"];
const TITLE_KEYS: &[&str] = &["title", "name", "productName"];
const PRICE_KEYS: &[&str] = &["price", "currentPrice", "current_price", "priceText", "price_text"];
const CURRENCY_KEYS: &[&str] = &["currency_id", "currencyId", "currency", "price.currency"];
const CONDITION_KEYS: &[&str] = &["condition", "itemCondition", "item_condition"];
const CATEGORY_KEYS: &[&str] = &["category_id", "categoryId", "category"];
const THUMBNAIL_KEYS: &[&str] = &["thumbnail", "thumbnail_url", "thumbnailUrl", "image", "imageUrl"];
const PERMALINK_KEYS: &[&str] = &["permalink", "url", "link", "productUrl"];
const RATING_KEYS: &[&str] = &[
    "rating",
    "rating_average",
    "ratingAverage",
    "reviews.rating_average",
    "reviews.rating",
    "stars",
];
const REVIEW_COUNT_KEYS: &[&str] = &[
    "reviews.total",
    "review_count",
    "reviewCount",
    "reviewsCount",
    "ratingCount",
];
const SELLER_ID_KEYS: &[&str] = &["seller_id", "sellerId", "seller.id", "seller_info.id"];
const SELLER_NICK_KEYS: &[&str] = &[
    "seller_nickname",
    "sellerNickname",
    "seller.nickname",
    "seller_info.nickname",
    "sellerName",
    "seller_name",
];
const CITY_KEYS: &[&str] = &["address.city_name", "seller_address.city.name", "location.city", "city"];
const STATE_KEYS: &[&str] = &["address.state_name", "seller_address.state.name", "location.state", "state"];
const DATE_KEYS: &[&str] = &["extraction_date", "scrapedAt", "scraped_at", "timestamp"];

pub struct ProductTransformer {
    job_run: DateTime<Utc>,
    default_currency: Option<String>,
}

impl ProductTransformer {
    /// `default_currency` is used when a record neither names nor implies its currency.
    pub fn new(job_run: DateTime<Utc>, default_currency: Option<&str>) -> Self {
        Self {
            job_run: job_run.trunc_subsecs(6),
            default_currency: default_currency.map(str::to_string),
        }
    }

    pub fn job_run(&self) -> DateTime<Utc> {
        self.job_run
    }

    /// Map every record, keeping input order. Bad records are collected, never fatal.
    pub fn transform_products(&self, records: &[Value]) -> TransformOutput {
        let results: Vec<_> = records.par_iter().map(|r| self.transform_one(r)).collect();

        let mut out = TransformOutput::default();
        for (index, (record, result)) in records.iter().zip(results).enumerate() {
            match result {
                Ok(row) => out.rows.push(row),
                Err(error) => {
                    let product_id = first_map(record, ID_KEYS, as_text);
                    warn!(
                        index,
                        product_id = product_id.as_deref().unwrap_or("-"),
                        "Skipping record: {}",
                        error
                    );
                    out.rejected.push(Rejection { index, product_id, error });
                }
            }
        }
        debug!(rows = out.rows.len(), rejected = out.rejected.len(), "Transform finished");
        out
    }

    pub fn transform_one(&self, record: &Value) -> Result<ProductRow, TransformError> {
        if !record.is_object() {
            return Err(TransformError::NotAnObject);
        }
        let product_id = first_map(record, ID_KEYS, as_text).ok_or(TransformError::MissingId)?;

        let (price, price_currency) = extract_price(record);
        let currency_id = first_map(record, CURRENCY_KEYS, |v| {
            as_text(v).and_then(|c| price::normalize_currency(&c))
        })
            .or(price_currency.map(str::to_string))
            .or_else(|| self.default_currency.clone());

        let attrs = lookup(record, "attributes").and_then(Value::as_array);
        let attr = |id: &str| attrs.and_then(|a| attribute_value(a, id));

        let seller_info = lookup(record, "seller_info");
        let seller_reputation = seller_info.and_then(reputation);
        let seller_power_seller_status = seller_info
            .and_then(|s| text_field(s, &["power_seller_status", "seller_reputation.power_seller_status"]))
            .or_else(|| text_field(record, &["seller_power_seller_status", "powerSellerStatus"]));

        let thumbnail_url = text_field(record, THUMBNAIL_KEYS);
        let mut pictures = extract_pictures(record);
        if pictures.is_empty() {
            pictures.extend(thumbnail_url.clone());
        }

        let extraction_date = text_field(record, DATE_KEYS)
            .and_then(|d| parse_timestamp(&d))
            .map(|d| d.trunc_subsecs(6))
            .unwrap_or(self.job_run);

        Ok(ProductRow {
            product_id,
            title: clean_field(record, TITLE_KEYS),
            price,
            currency_id,
            condition: text_field(record, CONDITION_KEYS).and_then(|c| normalize_condition(&c)),
            category_id: text_field(record, CATEGORY_KEYS),
            thumbnail_url,
            permalink: text_field(record, PERMALINK_KEYS),
            rating: first_map(record, RATING_KEYS, |v| {
                as_f64(v).filter(|r| (0.0..=5.0).contains(r))
            }),
            review_count: first_map(record, REVIEW_COUNT_KEYS, as_count),
            seller_id: text_field(record, SELLER_ID_KEYS),
            seller_nickname: clean_field(record, SELLER_NICK_KEYS),
            seller_reputation,
            seller_power_seller_status,
            city: clean_field(record, CITY_KEYS),
            state: clean_field(record, STATE_KEYS),
            attributes: attrs.map(|a| attribute_map(a)),
            pictures,
            warranty: clean_field(record, &["warranty"]),
            brand: attr("BRAND").or_else(|| clean_field(record, &["brand"])),
            model: attr("MODEL").or_else(|| clean_field(record, &["model"])),
            memory: attr("INTERNAL_MEMORY").or_else(|| clean_field(record, &["memory"])),
            color: attr("COLOR").or_else(|| clean_field(record, &["color"])),
            extraction_date,
            job_run: self.job_run,
        })
    }
}

// ── Field helpers ──

/// Price plus any currency its text carries, from the first price alias that parses.
fn extract_price(record: &Value) -> (Option<f64>, Option<&'static str>) {
    match first_map(record, PRICE_KEYS, price_value) {
        Some((amount, currency)) => (Some(amount), currency),
        None => (None, None),
    }
}

/// Accepts numbers, strings and `{amount, currency}` objects.
fn price_value(raw: &Value) -> Option<(f64, Option<&'static str>)> {
    let (amount, currency) = match raw {
        Value::Number(n) => (n.as_f64(), None),
        Value::String(s) => (price::parse_price(s), price::currency_from_text(s)),
        Value::Object(_) => {
            let amount = first(raw, &["amount", "value", "price"]).and_then(|v| match v {
                Value::String(s) => price::parse_price(s),
                other => other.as_f64(),
            });
            let currency = text_field(raw, &["currency", "currency_id", "currencyId"])
                .and_then(|c| price::currency_from_text(&c));
            (amount, currency)
        }
        _ => (None, None),
    };
    amount
        .filter(|p| p.is_finite() && *p >= 0.0)
        .map(|p| (p, currency))
}

fn normalize_condition(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let normalized = match lower.as_str() {
        "" => return None,
        "new" | "nuevo" | "novo" => "new",
        "used" | "usado" => "used",
        "refurbished" | "reacondicionado" | "recondicionado" => "refurbished",
        other => other,
    };
    Some(normalized.to_string())
}

fn attribute_value(attrs: &[Value], id: &str) -> Option<String> {
    attrs
        .iter()
        .find(|a| lookup(a, "id").and_then(Value::as_str) == Some(id))
        .and_then(|a| clean_field(a, &["value_name", "value"]))
}

fn attribute_map(attrs: &[Value]) -> Value {
    let mut map = Map::new();
    for a in attrs {
        let (Some(id), Some(value)) = (text_field(a, &["id"]), clean_field(a, &["value_name"])) else {
            continue;
        };
        let name = clean_field(a, &["name"]).unwrap_or_default();
        map.insert(id, json!({ "name": name, "value": value }));
    }
    Value::Object(map)
}

fn reputation(seller_info: &Value) -> Option<Value> {
    let rep = lookup(seller_info, "seller_reputation")?;
    let count = |path: &str| lookup(rep, path).and_then(as_count).unwrap_or(0);
    Some(json!({
        "level_id": text_field(rep, &["level_id"]),
        "power_seller_status": text_field(rep, &["power_seller_status"]),
        "transactions_total": count("transactions.total"),
        "transactions_completed": count("transactions.completed"),
    }))
}

/// Image URLs from `pictures` (objects or strings) or flat string lists; blanks and repeats dropped.
fn extract_pictures(record: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for key in ["pictures", "images", "imageUrls", "image_urls"] {
        let Some(items) = lookup(record, key).and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let url = match item {
                Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
                Value::Object(_) => text_field(item, &["secure_url", "url", "src"]),
                _ => None,
            };
            if let Some(url) = url {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
    }
    urls
}
