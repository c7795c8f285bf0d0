//! Read-merge-write rules for cached records.
//!
//! Scalars take the newer value only when the newer value is present.
//! Reviews, images and e-mails accumulate; nothing already captured is lost.

use std::collections::HashSet;

use crate::quality;
use crate::record::Record;

/// Merge `incoming` onto `existing`, returning the combined record.
pub fn merge_records(existing: &Record, incoming: &Record) -> Record {
    let mut merged = existing.clone();

    if !incoming.name.trim().is_empty() {
        merged.name = incoming.name.clone();
    }

    merged.cid = incoming.cid.or(existing.cid);
    merged.place_id = newer(&existing.place_id, &incoming.place_id);
    merged.address = newer(&existing.address, &incoming.address);
    merged.phone = newer(&existing.phone, &incoming.phone);
    merged.website = newer(&existing.website, &incoming.website);
    merged.location = incoming.location.or(existing.location);
    merged.plus_code = newer(&existing.plus_code, &incoming.plus_code);
    merged.category = newer(&existing.category, &incoming.category);
    merged.rating = incoming.rating.or(existing.rating);
    merged.review_count = incoming.review_count.or(existing.review_count);
    merged.price_range = newer(&existing.price_range, &incoming.price_range);
    merged.hours = newer(&existing.hours, &incoming.hours);
    merged.status = newer(&existing.status, &incoming.status);
    merged.description = newer(&existing.description, &incoming.description);
    merged.source_url = newer(&existing.source_url, &incoming.source_url);

    for email in &incoming.emails {
        if !merged.emails.contains(email) {
            merged.emails.push(email.clone());
        }
    }

    let mut seen_reviews: HashSet<String> = merged.reviews.iter().map(|r| r.dedup_key()).collect();
    for review in &incoming.reviews {
        if seen_reviews.insert(review.dedup_key()) {
            merged.reviews.push(review.clone());
        }
    }

    let mut seen_images: HashSet<String> = merged.images.iter().map(|i| i.url.clone()).collect();
    for image in &incoming.images {
        if seen_images.insert(image.url.clone()) {
            merged.images.push(image.clone());
        }
    }

    merged.extracted_at = existing.extracted_at.max(incoming.extracted_at);
    merged.quality_score = quality::score(&merged);
    merged
}

fn newer(existing: &Option<String>, incoming: &Option<String>) -> Option<String> {
    match incoming {
        Some(value) if !value.trim().is_empty() => Some(value.clone()),
        _ => existing.clone(),
    }
}
