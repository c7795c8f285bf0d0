//! Field-completeness scoring.
//!
//! Pure and deterministic: the same record always gets the same score, which
//! keeps acceptance decisions reproducible.

use crate::record::Record;

// Core fields: 60 points.
const IDENTITY_WEIGHT: u32 = 10;
const NAME_WEIGHT: u32 = 15;
const GEO_WEIGHT: u32 = 10;
const ADDRESS_WEIGHT: u32 = 15;
const PHONE_WEIGHT: u32 = 10;

// Secondary fields: 25 points.
const CATEGORY_WEIGHT: u32 = 7;
const RATING_WEIGHT: u32 = 6;
const WEBSITE_WEIGHT: u32 = 6;
const HOURS_WEIGHT: u32 = 6;

// Media bonus: 15 points.
const REVIEW_BONUS_CAP: u32 = 8;
const IMAGE_BONUS_CAP: u32 = 5;
const EMAIL_BONUS: u32 = 2;

/// Default acceptance floor.
pub const DEFAULT_QUALITY_FLOOR: u8 = 50;

/// Score a record from 0 to 100.
pub fn score(record: &Record) -> u8 {
    let mut total = 0u32;

    if record.cid.is_some() || record.place_id.is_some() {
        total += IDENTITY_WEIGHT;
    }
    if !record.name.trim().is_empty() {
        total += NAME_WEIGHT;
    }
    if record.location.is_some() {
        total += GEO_WEIGHT;
    }
    if record.address.is_some() {
        total += ADDRESS_WEIGHT;
    }
    if record.phone.is_some() {
        total += PHONE_WEIGHT;
    }

    if record.category.is_some() {
        total += CATEGORY_WEIGHT;
    }
    if record.rating.is_some() {
        total += RATING_WEIGHT;
    }
    if record.website.is_some() {
        total += WEBSITE_WEIGHT;
    }
    if record.hours.is_some() {
        total += HOURS_WEIGHT;
    }

    total += (record.reviews.len() as u32).min(REVIEW_BONUS_CAP);
    total += (record.images.len() as u32).min(IMAGE_BONUS_CAP);
    if !record.emails.is_empty() {
        total += EMAIL_BONUS;
    }

    total.min(100) as u8
}

/// Acceptance gate used by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct QualityScorer {
    floor: u8,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self { floor: DEFAULT_QUALITY_FLOOR }
    }
}

impl QualityScorer {
    pub fn new(floor: u8) -> Self {
        Self { floor: floor.min(100) }
    }

    pub fn floor(&self) -> u8 {
        self.floor
    }

    pub fn score(&self, record: &Record) -> u8 {
        score(record)
    }

    pub fn accepts(&self, score: u8) -> bool {
        score >= self.floor
    }
}
