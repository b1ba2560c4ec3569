//! Catalog normalization.
//!
//! Turns heterogeneous raw product records into canonical [`Product`]
//! entities. Raw records come from whatever dump the catalog source
//! provides, so every field is resolved through an ordered list of
//! candidate keys: first present, well-typed value wins. Coercion
//! failures produce absent attributes, never errors.

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Candidate keys for the stable identifier, in priority order.
const ID_KEYS: &[&str] = &["id", "parent_asin", "asin", "sku", "product_id"];
/// Candidate keys for the display title.
const TITLE_KEYS: &[&str] = &["title", "name", "product_title"];
/// Candidate keys for price.
const PRICE_KEYS: &[&str] = &["price", "sale_price", "list_price"];
/// Candidate keys for rating.
const RATING_KEYS: &[&str] = &["rating", "average_rating", "stars"];

static MALE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(men|mens|male|boy|boys|guy|guys|man)\b").expect("male keyword regex")
});
static FEMALE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(women|womens|female|girl|girls|lady|ladies|woman)\b")
        .expect("female keyword regex")
});
static UNISEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bunisex\b").expect("unisex keyword regex"));

/// Categorical gender attribute, used only for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Men,
    Women,
    Unisex,
    Unknown,
}

impl Gender {
    /// Derive a gender attribute from free text (typically a title).
    ///
    /// Possessives are folded before matching so "men's" hits the
    /// "men" keyword.
    pub fn detect(text: &str) -> Gender {
        let text = text.replace('\u{2019}', "'").replace("'s", "s");
        if UNISEX_RE.is_match(&text) {
            return Gender::Unisex;
        }
        let male = MALE_RE.is_match(&text);
        let female = FEMALE_RE.is_match(&text);
        match (male, female) {
            (true, false) => Gender::Men,
            (false, true) => Gender::Women,
            (true, true) => Gender::Unisex,
            (false, false) => Gender::Unknown,
        }
    }

    /// Detect gender intent in a search query. Returns `None` when the
    /// query gives no clear signal either way.
    pub fn detect_query_intent(query: &str) -> Option<Gender> {
        match Gender::detect(query) {
            Gender::Unknown => None,
            g => Some(g),
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "men" | "male" | "man" => Ok(Gender::Men),
            "women" | "female" | "woman" => Ok(Gender::Women),
            "unisex" => Ok(Gender::Unisex),
            other => Err(format!(
                "unknown gender '{other}', expected men, women or unisex"
            )),
        }
    }
}

/// One image descriptor with its resolution variants. Provider order is
/// preserved in `Product::image_refs`; the first entry is the canonical
/// display image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub thumbnail: Option<String>,
    pub large: Option<String>,
    pub hi_res: Option<String>,
}

/// Canonical catalog entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Stable unique identifier, taken from the raw record's native key.
    pub id: String,
    /// Display text, always non-empty after normalization.
    pub title: String,
    /// Non-negative price; absent when unparsable or negative.
    pub price: Option<f64>,
    /// Rating in [0, 5]; absent when unparsable or out of range.
    pub rating: Option<f64>,
    pub gender: Gender,
    pub image_refs: Vec<ImageRef>,
    /// The original unmodified source record, kept for API passthrough.
    pub raw: Value,
}

impl Product {
    /// Assemble the text that gets embedded for this product: title,
    /// feature bullets, categories, descriptions, then price and rating
    /// sentences, joined with " . " separators.
    pub fn document_text(&self) -> String {
        let mut parts: Vec<String> = vec![self.title.clone()];

        for key in ["features", "categories", "description", "product_description"] {
            if let Some(text) = value_as_joined_text(self.raw.get(key)) {
                parts.push(text);
            }
        }
        if let Some(price) = self.price {
            parts.push(format!("price: {}", price));
        }
        if let Some(rating) = self.rating {
            parts.push(format!("rating: {}", rating));
        }

        parts.join(" . ")
    }
}

/// Normalize one raw record into a [`Product`].
///
/// Total over JSON-like input: missing or malformed fields become absent
/// attributes. Pure, so re-normalizing `product.raw` reproduces the same
/// `Product`.
pub fn normalize(raw: &Value) -> Product {
    let id = probe(raw, ID_KEYS)
        .and_then(coerce_id)
        .unwrap_or_else(|| fallback_id(raw));

    let title = probe(raw, TITLE_KEYS)
        .and_then(coerce_text)
        .unwrap_or_else(|| "untitled item".to_string());

    let price = probe(raw, PRICE_KEYS)
        .and_then(coerce_number)
        .filter(|p| *p >= 0.0);

    let rating = probe(raw, RATING_KEYS)
        .and_then(coerce_number)
        .filter(|r| (0.0..=5.0).contains(r));

    let gender = Gender::detect(&title);
    let image_refs = extract_image_refs(raw);

    Product {
        id,
        title,
        price,
        rating,
        gender,
        image_refs,
        raw: raw.clone(),
    }
}

/// Normalize a batch of raw records, order-preserving.
pub fn normalize_all(records: &[Value]) -> Vec<Product> {
    records.par_iter().map(normalize).collect()
}

/// Load raw records from a JSON array file or a JSONL file.
/// Unparsable JSONL lines are skipped.
pub fn load_raw_records(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read catalog file {}: {e}", path.display()))?;
    let raw = raw.trim();

    if raw.starts_with('[') {
        if let Ok(records) = serde_json::from_str::<Vec<Value>>(raw) {
            return Ok(records);
        }
        // fall through to line-by-line
    }

    let mut records = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => records.push(value),
            Err(e) => log::warn!("skipping malformed catalog line: {e}"),
        }
    }
    Ok(records)
}

/// Return the first present, non-null value among `keys`.
fn probe<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(key))
        .find(|v| !v.is_null())
}

fn coerce_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Coerce a JSON value to a float. Strings may carry currency symbols
/// and thousands separators ("$1,299.99").
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Deterministic identifier for records with no usable native key:
/// a digest of the canonical JSON serialization.
fn fallback_id(raw: &Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = raw.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("gen-{:016x}", u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8])))
}

fn extract_image_refs(raw: &Value) -> Vec<ImageRef> {
    let Some(images) = raw.get("images").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    images
        .iter()
        .filter_map(|entry| match entry {
            // {"thumb": ..., "large": ..., "hi_res": ...}
            Value::Object(_) => {
                let image = ImageRef {
                    thumbnail: entry.get("thumb").and_then(coerce_text),
                    large: entry.get("large").and_then(coerce_text),
                    hi_res: entry.get("hi_res").and_then(coerce_text),
                };
                if image == ImageRef::default() {
                    None
                } else {
                    Some(image)
                }
            }
            // plain URL string
            Value::String(_) => coerce_text(entry).map(|url| ImageRef {
                large: Some(url),
                ..Default::default()
            }),
            _ => None,
        })
        .collect()
}

fn value_as_joined_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => {
            let joined = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" . ");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    }
}
