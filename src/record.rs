//! Typed business record produced by every engine.
//!
//! Engines never assemble a `Record` by hand; they go through
//! `RecordBuilder`, which owns all field cleanup so the rest of the crate can
//! trust coordinates, ratings and phone numbers.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::error::EngineError;

static PHONE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9+()\-\s]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

// ============================================================================
// Data Structures
// ============================================================================

/// Latitude/longitude pair, always within Earth bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }
}

/// A single customer review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Review {
    pub reviewer: String,
    pub rating: Option<f32>,
    pub text: String,
    /// Provider-relative date such as "3 weeks ago".
    pub relative_date: Option<String>,
}

impl Review {
    /// Content hash used to de-duplicate reviews across scrapes.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_text(&self.reviewer).as_bytes());
        hasher.update(b"\x1f");
        hasher.update(normalize_text(&self.text).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A business photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Image {
    pub url: String,
    /// Resolution tag as reported by the engine ("thumbnail", "high", ...).
    pub resolution: Option<String>,
}

/// Structured business record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Record {
    // Identity
    pub name: String,
    pub cid: Option<u64>,
    pub place_id: Option<String>,

    // Contact
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,

    // Geo
    pub location: Option<GeoPoint>,
    pub plus_code: Option<String>,

    // Categorical
    pub category: Option<String>,
    pub rating: Option<f32>,
    pub review_count: Option<u32>,
    pub price_range: Option<String>,
    pub hours: Option<String>,
    pub status: Option<String>,
    pub description: Option<String>,

    // Media
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub images: Vec<Image>,

    pub source_url: Option<String>,
    pub quality_score: u8,
    #[schema(value_type = String)]
    pub extracted_at: DateTime<Utc>,
}

impl Record {
    pub fn builder(name: impl Into<String>) -> RecordBuilder {
        RecordBuilder::new(name)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Validating builder for `Record`.
///
/// Every setter accepts raw engine output; invalid values are dropped rather
/// than stored, so a missing field and a garbage field look the same.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            record: Record {
                name: clean_text(&name.into()).unwrap_or_default(),
                cid: None,
                place_id: None,
                address: None,
                phone: None,
                website: None,
                emails: Vec::new(),
                location: None,
                plus_code: None,
                category: None,
                rating: None,
                review_count: None,
                price_range: None,
                hours: None,
                status: None,
                description: None,
                reviews: Vec::new(),
                images: Vec::new(),
                source_url: None,
                quality_score: 0,
                extracted_at: Utc::now(),
            },
        }
    }

    pub fn cid(mut self, cid: Option<u64>) -> Self {
        self.record.cid = cid.filter(|c| *c != 0);
        self
    }

    pub fn place_id(mut self, place_id: Option<&str>) -> Self {
        self.record.place_id = place_id.and_then(clean_text);
        self
    }

    pub fn address(mut self, address: Option<&str>) -> Self {
        self.record.address = address.and_then(clean_text);
        self
    }

    pub fn phone(mut self, phone: Option<&str>) -> Self {
        self.record.phone = phone.and_then(clean_phone);
        self
    }

    pub fn website(mut self, website: Option<&str>) -> Self {
        self.record.website = website
            .and_then(clean_text)
            .filter(|w| w.starts_with("http://") || w.starts_with("https://"));
        self
    }

    pub fn email(mut self, email: &str) -> Self {
        let email = email.trim().to_lowercase();
        if EMAIL.is_match(&email) && !self.record.emails.contains(&email) {
            self.record.emails.push(email);
        }
        self
    }

    pub fn coordinates(mut self, lat: Option<f64>, lng: Option<f64>) -> Self {
        self.record.location = match (lat, lng) {
            (Some(lat), Some(lng)) => GeoPoint::new(lat, lng),
            _ => None,
        };
        self
    }

    pub fn plus_code(mut self, code: Option<&str>) -> Self {
        self.record.plus_code = code.and_then(clean_text);
        self
    }

    pub fn category(mut self, category: Option<&str>) -> Self {
        self.record.category = category.and_then(clean_text);
        self
    }

    pub fn rating(mut self, rating: Option<f32>) -> Self {
        self.record.rating = rating.and_then(valid_rating);
        self
    }

    pub fn review_count(mut self, count: Option<u32>) -> Self {
        self.record.review_count = count;
        self
    }

    pub fn price_range(mut self, price: Option<&str>) -> Self {
        self.record.price_range = price.and_then(clean_text);
        self
    }

    pub fn hours(mut self, hours: Option<&str>) -> Self {
        self.record.hours = hours.and_then(clean_text);
        self
    }

    pub fn status(mut self, status: Option<&str>) -> Self {
        self.record.status = status.and_then(clean_text);
        self
    }

    pub fn description(mut self, description: Option<&str>) -> Self {
        self.record.description = description.and_then(clean_text);
        self
    }

    pub fn review(mut self, reviewer: &str, rating: Option<f32>, text: &str, relative_date: Option<&str>) -> Self {
        let reviewer = clean_text(reviewer).unwrap_or_default();
        let text = clean_text(text).unwrap_or_default();
        if reviewer.is_empty() && text.is_empty() {
            return self;
        }
        let review = Review {
            reviewer,
            rating: rating.and_then(valid_rating),
            text,
            relative_date: relative_date.and_then(clean_text),
        };
        let key = review.dedup_key();
        if !self.record.reviews.iter().any(|r| r.dedup_key() == key) {
            self.record.reviews.push(review);
        }
        self
    }

    pub fn image(mut self, url: &str, resolution: Option<&str>) -> Self {
        let url = url.trim();
        if (url.starts_with("http://") || url.starts_with("https://"))
            && !self.record.images.iter().any(|i| i.url == url)
        {
            self.record.images.push(Image {
                url: url.to_string(),
                resolution: resolution.and_then(clean_text),
            });
        }
        self
    }

    pub fn source_url(mut self, url: Option<&str>) -> Self {
        self.record.source_url = url.and_then(clean_text);
        self
    }

    pub fn extracted_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.extracted_at = at;
        self
    }

    /// Finish the record. A record without a name is not a record.
    pub fn build(self) -> Result<Record, EngineError> {
        if self.record.name.is_empty() {
            return Err(EngineError::ElementNotFound("name".to_string()));
        }
        let mut record = self.record;
        record.quality_score = crate::quality::score(&record);
        Ok(record)
    }
}

// ============================================================================
// Field Cleanup Helpers
// ============================================================================

/// Trim, collapse whitespace, and map empty strings to `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    let collapsed = WHITESPACE.replace_all(raw.trim(), " ").to_string();
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Strip everything but phone punctuation; require at least 7 digits.
pub fn clean_phone(raw: &str) -> Option<String> {
    let stripped = PHONE_CHARS.replace_all(raw, "");
    let cleaned = clean_text(&stripped)?;
    let digits = cleaned.chars().filter(|c| c.is_ascii_digit()).count();
    (digits >= 7).then_some(cleaned)
}

fn valid_rating(rating: f32) -> Option<f32> {
    (rating.is_finite() && (0.0..=5.0).contains(&rating)).then_some(rating)
}

fn normalize_text(raw: &str) -> String {
    clean_text(raw).unwrap_or_default().to_lowercase()
}
