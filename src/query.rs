//! Query normalization.
//!
//! Free text becomes a search phrase; map URLs pass through with the locale
//! parameter forced, so both engines always navigate to the same page.

use reqwest::Url;

use crate::identity::{BusinessIdentity, UrlIdentifiers};
use crate::record::clean_text;

const MAPS_SEARCH_BASE: &str = "https://www.google.com/maps/search/";

/// Canonical form of a caller query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedQuery {
    /// Free-text search phrase, whitespace collapsed.
    Search { phrase: String, locale: String },
    /// Provider map URL with `hl=<locale>` applied.
    MapUrl { url: String, canonical: String },
}

impl NormalizedQuery {
    /// Normalize raw input. Returns `None` for blank input.
    pub fn parse(input: &str, locale: &str) -> Option<Self> {
        let trimmed = clean_text(input)?;
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            if let Ok(url) = Url::parse(&trimmed) {
                return Some(NormalizedQuery::MapUrl {
                    url: with_locale(&url, Some(locale)),
                    canonical: with_locale(&url, None),
                });
            }
        }
        Some(NormalizedQuery::Search {
            phrase: trimmed,
            locale: locale.to_string(),
        })
    }

    /// URL an engine should navigate to.
    pub fn navigation_url(&self) -> String {
        match self {
            NormalizedQuery::Search { phrase, locale } => format!(
                "{}{}?hl={}",
                MAPS_SEARCH_BASE,
                urlencoding::encode(phrase),
                urlencoding::encode(locale)
            ),
            NormalizedQuery::MapUrl { url, .. } => url.clone(),
        }
    }

    /// Locale-independent alias under which the cache remembers this query.
    pub fn cache_key(&self) -> String {
        match self {
            NormalizedQuery::Search { phrase, .. } => format!("query:{}", phrase.to_lowercase()),
            NormalizedQuery::MapUrl { canonical, .. } => format!("url:{}", canonical),
        }
    }

    /// Identity carried by the URL itself, when the input is a place link.
    pub fn identity_hint(&self) -> Option<BusinessIdentity> {
        match self {
            NormalizedQuery::Search { .. } => None,
            NormalizedQuery::MapUrl { url, .. } => UrlIdentifiers::from_url(url).identity(),
        }
    }

    /// Text form used in logs and error reports.
    pub fn display(&self) -> &str {
        match self {
            NormalizedQuery::Search { phrase, .. } => phrase,
            NormalizedQuery::MapUrl { url, .. } => url,
        }
    }
}

fn with_locale(url: &Url, locale: Option<&str>) -> String {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "hl")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut out = url.clone();
    out.set_query(None);
    if !pairs.is_empty() || locale.is_some() {
        let mut query = out.query_pairs_mut();
        for (k, v) in &pairs {
            query.append_pair(k, v);
        }
        if let Some(locale) = locale {
            query.append_pair("hl", locale);
        }
    }
    out.to_string()
}
