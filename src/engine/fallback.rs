use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Tab;
use tracing::{debug, info};

use super::fast::open_place;
use super::parse::{self, ParseOptions};
use super::session::{run_session, BrowserSession, SessionConfig};
use super::{EngineAdapter, ExtractOptions};
use crate::error::EngineError;
use crate::query::NormalizedQuery;
use crate::record::Record;

const REVIEWS_TAB: &str = "button[role='tab'][aria-label*='Reviews'], button[jsaction*='reviewChart']";
const REVIEW_ITEM: &str = "div.jftiEf";
const MAX_SCROLLS: usize = 15;

// Scrolls the reviews pane and reports how many reviews are loaded.
const SCROLL_REVIEWS_JS: &str = r#"
(() => {
    const pane = document.querySelector('div.m6QErb.DxyBCb') || document.querySelector('div[role="main"] div.m6QErb');
    if (pane) { pane.scrollTop = pane.scrollHeight; }
    document.querySelectorAll('button.w8nwRe').forEach(b => b.click());
    return document.querySelectorAll('div.jftiEf').length;
})()
"#;

/// Slower, more thorough engine: images on, longer waits, opens the
/// reviews pane and scrolls it until enough reviews are loaded.
pub struct FallbackEngine {
    session: SessionConfig,
    element_wait: Duration,
    scroll_pause: Duration,
}

impl FallbackEngine {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session: SessionConfig { load_images: true, ..session },
            element_wait: Duration::from_secs(20),
            scroll_pause: Duration::from_millis(1200),
        }
    }
}

#[async_trait]
impl EngineAdapter for FallbackEngine {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn extract(&self, query: &NormalizedQuery, options: &ExtractOptions) -> Result<Record, EngineError> {
        let url = query.navigation_url();
        let wait = self.element_wait.min(options.timeout);
        let pause = self.scroll_pause;
        let parse_options = ParseOptions {
            include_reviews: options.include_reviews,
            max_reviews: options.max_reviews,
        };
        info!(engine = "fallback", query = %query.display(), "🔎 extracting");

        run_session(&self.session, options, move |session| {
            let tab = session.new_tab()?;
            let (_, final_url) = open_place(session, &tab, &url, wait)?;

            // Give lazy panel sections (hours, photos) time to hydrate.
            std::thread::sleep(pause);
            session.check_aborted()?;
            let html = tab.get_content().map_err(|e| EngineError::from_browser(&e, wait))?;
            let panel = parse::parse_place(&html, &final_url, ParseOptions { include_reviews: false, ..parse_options })?;

            if parse_options.include_reviews && parse_options.max_reviews > 0 {
                if let Some(reviews_html) = load_reviews(session, &tab, parse_options.max_reviews, wait, pause)? {
                    let with_reviews = parse::parse_place(&reviews_html, &final_url, parse_options)?;
                    return Ok(crate::cache::merge_records(&panel, &with_reviews));
                }
            }
            Ok(panel)
        })
        .await
    }
}

/// Open the reviews tab and scroll until `max_reviews` are loaded or the
/// pane stops growing. `None` when the place has no reviews tab.
fn load_reviews(
    session: &BrowserSession,
    tab: &Arc<Tab>,
    max_reviews: usize,
    wait: Duration,
    pause: Duration,
) -> Result<Option<String>, EngineError> {
    let Ok(button) = tab.find_element(REVIEWS_TAB) else {
        debug!("no reviews tab");
        return Ok(None);
    };
    button.click().map_err(|e| EngineError::from_browser(&e, wait))?;
    if tab.wait_for_element_with_custom_timeout(REVIEW_ITEM, wait).is_err() {
        return Ok(None);
    }

    let mut loaded = 0usize;
    for _ in 0..MAX_SCROLLS {
        session.check_aborted()?;
        let count = tab
            .evaluate(SCROLL_REVIEWS_JS, false)
            .map_err(|e| EngineError::from_browser(&e, wait))?
            .value
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if count >= max_reviews || count == loaded {
            loaded = count;
            break;
        }
        loaded = count;
        std::thread::sleep(pause);
    }
    debug!(loaded, "reviews pane loaded");

    tab.get_content().map(Some).map_err(|e| EngineError::from_browser(&e, wait))
}
