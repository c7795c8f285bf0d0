//! Browser extraction engines.
//!
//! The orchestrator only sees `EngineAdapter`. Selectors, page structure and
//! browser lifecycle stay behind it.

pub mod fallback;
pub mod fast;
pub mod parse;
pub mod session;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::query::NormalizedQuery;
use crate::record::Record;

pub use fallback::FallbackEngine;
pub use fast::FastEngine;
pub use session::SessionConfig;

/// Per-call knobs handed to an engine.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub include_reviews: bool,
    pub max_reviews: usize,
    /// Wall-clock budget for the whole call, browser launch included.
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            include_reviews: true,
            max_reviews: 20,
            timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }
}

/// One browser-automation backend.
///
/// On success the record always has a name. On failure the engine returns a
/// typed error, never a half-filled record. Each call owns exactly one browser
/// session and tears it down on every exit path.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Stable name used for provenance, history and logs.
    fn name(&self) -> &str;

    async fn extract(&self, query: &NormalizedQuery, options: &ExtractOptions) -> Result<Record, EngineError>;
}
