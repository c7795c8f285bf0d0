use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Tab;
use tracing::{debug, info};

use super::parse::{self, ParseOptions};
use super::session::{run_session, BrowserSession, SessionConfig};
use super::{EngineAdapter, ExtractOptions};
use crate::error::EngineError;
use crate::query::NormalizedQuery;
use crate::record::Record;

const PANEL_OR_LIST: &str = "h1.DUwDvf, a.hfpxzc";
const PANEL: &str = "h1.DUwDvf";
const CONSENT_BUTTON: &str = "form[action*='consent'] button, button[aria-label*='Accept all']";

/// Primary engine: images off, short waits, overview reviews only.
pub struct FastEngine {
    session: SessionConfig,
    element_wait: Duration,
}

impl FastEngine {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session: SessionConfig { load_images: false, ..session },
            element_wait: Duration::from_secs(8),
        }
    }
}

#[async_trait]
impl EngineAdapter for FastEngine {
    fn name(&self) -> &str {
        "fast"
    }

    async fn extract(&self, query: &NormalizedQuery, options: &ExtractOptions) -> Result<Record, EngineError> {
        let url = query.navigation_url();
        let wait = self.element_wait.min(options.timeout);
        let parse_options = ParseOptions {
            include_reviews: options.include_reviews,
            max_reviews: options.max_reviews,
        };
        info!(engine = "fast", query = %query.display(), "🔎 extracting");

        run_session(&self.session, options, move |session| {
            let tab = session.new_tab()?;
            let (html, final_url) = open_place(session, &tab, &url, wait)?;
            parse::parse_place(&html, &final_url, parse_options)
        })
        .await
    }
}

/// Navigate to `url` and end up on a single place panel, following the first
/// search result if the search landed on a list. Returns the panel HTML and
/// the URL the tab ended on.
pub(super) fn open_place(
    session: &BrowserSession,
    tab: &Arc<Tab>,
    url: &str,
    wait: Duration,
) -> Result<(String, String), EngineError> {
    debug!(url, "navigating");
    tab.navigate_to(url).map_err(|e| EngineError::from_browser(&e, wait))?;
    tab.wait_until_navigated().map_err(|e| EngineError::from_browser(&e, wait))?;
    session.check_aborted()?;

    accept_consent(tab, wait);

    tab.wait_for_element_with_custom_timeout(PANEL_OR_LIST, wait)
        .map_err(|_| EngineError::ElementNotFound("place panel or result list".to_string()))?;
    session.check_aborted()?;

    let mut html = tab.get_content().map_err(|e| EngineError::from_browser(&e, wait))?;
    if tab.find_element(PANEL).is_err() {
        let link = parse::first_result_link(&html)
            .ok_or_else(|| EngineError::ElementNotFound("search result".to_string()))?;
        debug!(link = %link, "search returned a list, opening first result");
        tab.navigate_to(&link).map_err(|e| EngineError::from_browser(&e, wait))?;
        tab.wait_for_element_with_custom_timeout(PANEL, wait)
            .map_err(|_| EngineError::ElementNotFound("place panel".to_string()))?;
        session.check_aborted()?;
        html = tab.get_content().map_err(|e| EngineError::from_browser(&e, wait))?;
    }

    Ok((html, tab.get_url()))
}

fn accept_consent(tab: &Arc<Tab>, wait: Duration) {
    if !tab.get_url().contains("consent.") {
        return;
    }
    debug!("consent page detected");
    if let Ok(button) = tab.wait_for_element_with_custom_timeout(CONSENT_BUTTON, wait) {
        if button.click().is_ok() {
            let _ = tab.wait_until_navigated();
        }
    }
}
