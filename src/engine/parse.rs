//! DOM parsing for the maps place panel.
//!
//! Both engines hand the rendered HTML here, so the record shape never
//! depends on which engine produced it. Every field helper returns an
//! `Option`; a missing field is not an error. Only a missing name is.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::EngineError;
use crate::identity::UrlIdentifiers;
use crate::record::{clean_text, Record, RecordBuilder};

static NAME: Lazy<Selector> = Lazy::new(|| Selector::parse("h1.DUwDvf, h1.fontHeadlineLarge, div[role='main'] h1").unwrap());
static ADDRESS: Lazy<Selector> = Lazy::new(|| Selector::parse("button[data-item-id='address']").unwrap());
static PHONE: Lazy<Selector> = Lazy::new(|| Selector::parse("button[data-item-id^='phone:tel:']").unwrap());
static WEBSITE: Lazy<Selector> = Lazy::new(|| Selector::parse("a[data-item-id='authority']").unwrap());
static PLUS_CODE: Lazy<Selector> = Lazy::new(|| Selector::parse("button[data-item-id='oloc']").unwrap());
static CATEGORY: Lazy<Selector> = Lazy::new(|| Selector::parse("button.DkEaL, button[jsaction*='category']").unwrap());
static RATING: Lazy<Selector> = Lazy::new(|| Selector::parse("div.F7nice span[aria-hidden='true']").unwrap());
static REVIEW_COUNT: Lazy<Selector> = Lazy::new(|| Selector::parse("div.F7nice span[aria-label]").unwrap());
static PRICE: Lazy<Selector> = Lazy::new(|| Selector::parse("span.mgr77e, span[aria-label^='Price']").unwrap());
static HOURS: Lazy<Selector> = Lazy::new(|| Selector::parse("div.t39EBf[aria-label], table.eK4R0e").unwrap());
static STATUS: Lazy<Selector> = Lazy::new(|| Selector::parse("span.ZDu9vd, div.MkV9 span").unwrap());
static DESCRIPTION: Lazy<Selector> = Lazy::new(|| Selector::parse("div.PYvSYb, div.WeS02d").unwrap());
static REVIEW: Lazy<Selector> = Lazy::new(|| Selector::parse("div.jftiEf").unwrap());
static REVIEWER: Lazy<Selector> = Lazy::new(|| Selector::parse(".d4r55").unwrap());
static REVIEW_STARS: Lazy<Selector> = Lazy::new(|| Selector::parse("span.kvMYJc[aria-label]").unwrap());
static REVIEW_TEXT: Lazy<Selector> = Lazy::new(|| Selector::parse("span.wiI7pd").unwrap());
static REVIEW_DATE: Lazy<Selector> = Lazy::new(|| Selector::parse("span.rsqaWe").unwrap());
static PHOTO: Lazy<Selector> = Lazy::new(|| Selector::parse("button.aoRNLd img, div.RZ66Rb img, a.p0Hhde img").unwrap());
static RESULT_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a.hfpxzc[href]").unwrap());
static CANONICAL: Lazy<Selector> = Lazy::new(|| Selector::parse("link[rel='canonical'], meta[itemprop='url']").unwrap());

static COORDS_DATA: Lazy<Regex> = Lazy::new(|| Regex::new(r"!3d(-?\d+(?:\.\d+)?)!4d(-?\d+(?:\.\d+)?)").unwrap());
static COORDS_AT: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(-?\d+(?:\.\d+)?),(-?\d+(?:\.\d+)?)").unwrap());
static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?").unwrap());
static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d[\d,.\u{a0} ]*").unwrap());
static EMAIL_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap());
static PHOTO_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"=w(\d+)-h(\d+)").unwrap());

/// What the parser should pull besides the core panel.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    pub include_reviews: bool,
    pub max_reviews: usize,
}

/// Build a record from a rendered place panel.
///
/// `page_url` is the URL the browser ended on; it carries coordinates and
/// usually the CID.
pub fn parse_place(html: &str, page_url: &str, options: ParseOptions) -> Result<Record, EngineError> {
    let document = Html::parse_document(html);

    let name = first_text(&document, &NAME).ok_or_else(|| EngineError::ElementNotFound("place name".to_string()))?;

    let mut ids = UrlIdentifiers::from_url(page_url);
    if ids.cid.is_none() || ids.place_id.is_none() {
        for link in canonical_links(&document) {
            let more = UrlIdentifiers::from_url(&link);
            ids.cid = ids.cid.or(more.cid);
            ids.place_id = ids.place_id.or(more.place_id);
        }
    }

    let (lat, lng) = match coordinates_from_url(page_url) {
        Some((lat, lng)) => (Some(lat), Some(lng)),
        None => (None, None),
    };

    let mut builder = Record::builder(name)
        .cid(ids.cid)
        .place_id(ids.place_id.as_deref())
        .address(labelled(&document, &ADDRESS, "Address:").as_deref())
        .phone(labelled(&document, &PHONE, "Phone:").as_deref())
        .website(first_attr(&document, &WEBSITE, "href").as_deref())
        .plus_code(labelled(&document, &PLUS_CODE, "Plus code:").as_deref())
        .coordinates(lat, lng)
        .category(first_text(&document, &CATEGORY).as_deref())
        .rating(first_text(&document, &RATING).and_then(|t| parse_decimal(&t)))
        .review_count(review_count(&document))
        .price_range(price_range(&document).as_deref())
        .hours(hours(&document).as_deref())
        .status(first_text(&document, &STATUS).as_deref())
        .description(first_text(&document, &DESCRIPTION).as_deref())
        .source_url(Some(page_url));

    for email in panel_emails(&document) {
        builder = builder.email(&email);
    }

    builder = add_photos(builder, &document);
    if options.include_reviews {
        builder = add_reviews(builder, &document, options.max_reviews);
    }

    builder.build()
}

/// First place link on a search-results list, if the search did not land on a
/// single place.
pub fn first_result_link(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    first_attr(&document, &RESULT_LINK, "href")
}

/// Coordinates from a maps URL. The `!3d!4d` data pair is the pin; `@lat,lng`
/// is only the viewport centre, so it is the fallback.
pub fn coordinates_from_url(url: &str) -> Option<(f64, f64)> {
    let caps = COORDS_DATA.captures(url).or_else(|| COORDS_AT.captures(url))?;
    let lat = caps[1].parse().ok()?;
    let lng = caps[2].parse().ok()?;
    Some((lat, lng))
}

// ============================================================================
// Field Helpers
// ============================================================================

fn text_of(element: ElementRef<'_>) -> Option<String> {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document.select(selector).find_map(text_of)
}

fn first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
    document
        .select(selector)
        .find_map(|el| el.value().attr(attr).and_then(clean_text))
}

/// Panel buttons carry the value in `aria-label` as "Label: value"; fall back
/// to the visible text.
fn labelled(document: &Html, selector: &Selector, prefix: &str) -> Option<String> {
    let element = document.select(selector).next()?;
    if let Some(label) = element.value().attr("aria-label") {
        let value = label.strip_prefix(prefix).unwrap_or(label);
        if let Some(value) = clean_text(value) {
            return Some(value);
        }
    }
    text_of(element)
}

fn parse_decimal(raw: &str) -> Option<f32> {
    FIRST_NUMBER.find(raw)?.as_str().replace(',', ".").parse().ok()
}

fn parse_count(raw: &str) -> Option<u32> {
    let digits: String = DIGITS.find(raw)?.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn review_count(document: &Html) -> Option<u32> {
    document
        .select(&REVIEW_COUNT)
        .filter_map(|el| el.value().attr("aria-label"))
        .find(|label| label.to_lowercase().contains("review"))
        .and_then(parse_count)
}

fn price_range(document: &Html) -> Option<String> {
    let element = document.select(&PRICE).next()?;
    match element.value().attr("aria-label") {
        Some(label) => clean_text(label.strip_prefix("Price:").unwrap_or(label)),
        None => text_of(element),
    }
}

fn hours(document: &Html) -> Option<String> {
    let element = document.select(&HOURS).next()?;
    match element.value().attr("aria-label") {
        Some(label) => clean_text(label.trim_end_matches(". Hide open hours for the week").trim_end_matches('.')),
        None => text_of(element),
    }
}

fn canonical_links(document: &Html) -> Vec<String> {
    document
        .select(&CANONICAL)
        .filter_map(|el| el.value().attr("href").or_else(|| el.value().attr("content")))
        .map(str::to_string)
        .collect()
}

fn panel_emails(document: &Html) -> Vec<String> {
    let Some(description) = first_text(document, &DESCRIPTION) else {
        return Vec::new();
    };
    EMAIL_IN_TEXT
        .find_iter(&description)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn add_photos(mut builder: RecordBuilder, document: &Html) -> RecordBuilder {
    for img in document.select(&PHOTO) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        let resolution = PHOTO_SIZE.captures(src).map(|c| {
            let width: u32 = c[1].parse().unwrap_or(0);
            if width >= 400 { "high" } else { "thumbnail" }
        });
        builder = builder.image(src, resolution.or(Some("unknown")));
    }
    builder
}

fn add_reviews(mut builder: RecordBuilder, document: &Html, max_reviews: usize) -> RecordBuilder {
    for review in document.select(&REVIEW).take(max_reviews) {
        let reviewer = review.select(&REVIEWER).find_map(text_of).unwrap_or_default();
        let rating = review
            .select(&REVIEW_STARS)
            .find_map(|el| el.value().attr("aria-label"))
            .and_then(parse_decimal);
        let text = review.select(&REVIEW_TEXT).find_map(text_of).unwrap_or_default();
        let date = review.select(&REVIEW_DATE).find_map(text_of);
        builder = builder.review(&reviewer, rating, &text, date.as_deref());
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLACE_URL: &str = "https://www.google.com/maps/place/Starbucks/@40.7579,-73.9857,17z/data=!3m1!4b1!4m6!3m5!1s0x89c25855c6480299:0x55194ec5a1ae072e!8m2!3d40.7580!4d-73.9855?hl=en";

    const PLACE_HTML: &str = r#"
        <html><head><link rel="canonical" href="https://www.google.com/maps?cid=6132208262146062126"></head>
        <body><div role="main">
          <h1 class="DUwDvf">Starbucks</h1>
          <div class="F7nice">
            <span><span aria-hidden="true">4.1</span></span>
            <span><span aria-label="1,234 reviews">(1,234)</span></span>
          </div>
          <span class="mgr77e" aria-label="Price: Inexpensive">$</span>
          <button class="DkEaL">Coffee shop</button>
          <span class="ZDu9vd">Open · Closes 9 PM</span>
          <div class="PYvSYb">Seattle-based coffeehouse chain. Contact nyc@starbucks.example</div>
          <button data-item-id="address" aria-label="Address: 1585 Broadway, New York, NY 10036">1585 Broadway</button>
          <button data-item-id="phone:tel:+12125550100" aria-label="Phone: (212) 555-0100">(212) 555-0100</button>
          <a data-item-id="authority" href="https://www.starbucks.com/">starbucks.com</a>
          <button data-item-id="oloc" aria-label="Plus code: Q248+5R New York">Q248+5R</button>
          <div class="t39EBf" aria-label="Monday, 6 AM to 9 PM; Tuesday, 6 AM to 9 PM. Hide open hours for the week"></div>
          <button class="aoRNLd"><img src="https://lh5.googleusercontent.com/p/AF1Q=w408-h306-k-no"></button>
          <button class="aoRNLd"><img src="https://lh5.googleusercontent.com/p/AF2Q=w80-h92-k-no"></button>
          <div class="jftiEf">
            <div class="d4r55">Ann Lee</div>
            <span class="kvMYJc" aria-label="5 stars"></span>
            <span class="rsqaWe">2 weeks ago</span>
            <span class="wiI7pd">Fast service even at rush hour.</span>
          </div>
          <div class="jftiEf">
            <div class="d4r55">Bo Chen</div>
            <span class="kvMYJc" aria-label="2 stars"></span>
            <span class="rsqaWe">a month ago</span>
            <span class="wiI7pd">Crowded.</span>
          </div>
        </div></body></html>
    "#;

    fn all() -> ParseOptions {
        ParseOptions { include_reviews: true, max_reviews: 20 }
    }

    #[test]
    fn test_parse_full_panel() {
        let record = parse_place(PLACE_HTML, PLACE_URL, all()).unwrap();

        assert_eq!(record.name, "Starbucks");
        assert_eq!(record.cid, Some(0x55194ec5a1ae072e));
        assert_eq!(record.address.as_deref(), Some("1585 Broadway, New York, NY 10036"));
        assert_eq!(record.phone.as_deref(), Some("(212) 555-0100"));
        assert_eq!(record.website.as_deref(), Some("https://www.starbucks.com/"));
        assert_eq!(record.plus_code.as_deref(), Some("Q248+5R New York"));
        assert_eq!(record.category.as_deref(), Some("Coffee shop"));
        assert_eq!(record.rating, Some(4.1));
        assert_eq!(record.review_count, Some(1234));
        assert_eq!(record.price_range.as_deref(), Some("Inexpensive"));
        assert_eq!(record.hours.as_deref(), Some("Monday, 6 AM to 9 PM; Tuesday, 6 AM to 9 PM"));
        assert_eq!(record.status.as_deref(), Some("Open · Closes 9 PM"));
        assert_eq!(record.emails, vec!["nyc@starbucks.example".to_string()]);

        let location = record.location.unwrap();
        assert!((location.lat - 40.7580).abs() < 1e-9);
        assert!((location.lng + 73.9855).abs() < 1e-9);

        assert_eq!(record.images.len(), 2);
        assert_eq!(record.images[0].resolution.as_deref(), Some("high"));
        assert_eq!(record.images[1].resolution.as_deref(), Some("thumbnail"));

        assert_eq!(record.reviews.len(), 2);
        assert_eq!(record.reviews[0].reviewer, "Ann Lee");
        assert_eq!(record.reviews[0].rating, Some(5.0));
        assert_eq!(record.reviews[1].relative_date.as_deref(), Some("a month ago"));
        assert!(record.quality_score >= 90);
    }

    #[test]
    fn test_reviews_respect_options() {
        let none = parse_place(PLACE_HTML, PLACE_URL, ParseOptions { include_reviews: false, max_reviews: 20 }).unwrap();
        assert!(none.reviews.is_empty());

        let one = parse_place(PLACE_HTML, PLACE_URL, ParseOptions { include_reviews: true, max_reviews: 1 }).unwrap();
        assert_eq!(one.reviews.len(), 1);
    }

    #[test]
    fn test_missing_name_is_element_not_found() {
        let err = parse_place("<html><body><div>nothing here</div></body></html>", PLACE_URL, all()).unwrap_err();
        assert!(matches!(err, EngineError::ElementNotFound(_)));
    }

    #[test]
    fn test_sparse_panel_still_parses() {
        let html = r#"<div role="main"><h1 class="DUwDvf">Corner Deli</h1>
            <button data-item-id="address">12 Main St</button></div>"#;
        let record = parse_place(html, "https://www.google.com/maps/search/corner+deli", all()).unwrap();
        assert_eq!(record.name, "Corner Deli");
        assert_eq!(record.address.as_deref(), Some("12 Main St"));
        assert_eq!(record.cid, None);
        assert_eq!(record.location, None);
        assert_eq!(record.quality_score, 30);
    }

    #[test]
    fn test_canonical_link_supplies_cid() {
        let html = r#"<html><head><link rel="canonical" href="https://www.google.com/maps?cid=42"></head>
            <body><h1 class="DUwDvf">Tiny Cafe</h1></body></html>"#;
        let record = parse_place(html, "https://www.google.com/maps/search/tiny+cafe", all()).unwrap();
        assert_eq!(record.cid, Some(42));
    }

    #[test]
    fn test_first_result_link() {
        let html = r#"<div role="feed">
            <a class="hfpxzc" href="https://www.google.com/maps/place/A/data=!1s0x1:0x2"></a>
            <a class="hfpxzc" href="https://www.google.com/maps/place/B/data=!1s0x3:0x4"></a></div>"#;
        assert_eq!(
            first_result_link(html).as_deref(),
            Some("https://www.google.com/maps/place/A/data=!1s0x1:0x2")
        );
        assert_eq!(first_result_link("<div></div>"), None);
    }

    #[test]
    fn test_coordinates_prefer_pin_over_viewport() {
        assert_eq!(coordinates_from_url(PLACE_URL), Some((40.7580, -73.9855)));
        assert_eq!(
            coordinates_from_url("https://www.google.com/maps/@51.5007,-0.1246,15z"),
            Some((51.5007, -0.1246))
        );
        assert_eq!(coordinates_from_url("https://www.google.com/maps/search/pizza"), None);
    }
}
