//! Typed errors for engines, the cache and the orchestrator.
//!
//! Engine errors are recoverable inside the orchestrator (retry, then the
//! next engine). Cache errors never reach callers. The only failure a caller
//! sees for a well-formed query is `ExtractionError::AllEnginesExhausted`.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::record::Record;

/// Failure of a single engine call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Browser process could not be started.
    #[error("failed to launch browser: {0}")]
    Launch(String),

    /// Page did not respond before the deadline.
    #[error("navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    /// A required element never appeared on the page.
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// The browser session died mid-extraction.
    #[error("browser session crashed: {0}")]
    Crashed(String),

    /// Caller tripped the cancellation token.
    #[error("extraction cancelled")]
    Cancelled,
}

impl EngineError {
    /// Map a `headless_chrome` failure onto the taxonomy.
    ///
    /// The browser crate reports everything through `anyhow`, so the
    /// classification works on the rendered message.
    pub fn from_browser(err: &anyhow::Error, timeout: Duration) -> Self {
        let message = format!("{:#}", err);
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("never came") {
            EngineError::NavigationTimeout(timeout)
        } else if lower.contains("no element found") || lower.contains("could not find node") {
            EngineError::ElementNotFound(message)
        } else {
            EngineError::Crashed(message)
        }
    }
}

/// Why a single attempt did not produce an accepted record.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Hard error from the engine.
    Failed(EngineError),
    /// Soft failure: a record came back but scored under the floor.
    BelowQualityFloor { score: u8, floor: u8 },
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Failed(e) => write!(f, "{}", e),
            AttemptOutcome::BelowQualityFloor { score, floor } => {
                write!(f, "quality {} below floor {}", score, floor)
            }
        }
    }
}

/// One engine attempt as recorded in the exhaustion report.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub engine: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Per-engine digest of an exhausted extraction, handy for API responses.
#[derive(Debug, Clone, Serialize, PartialEq, ToSchema)]
pub struct EngineFailureSummary {
    pub engine: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Terminal failures returned by the orchestrator.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Every engine was tried and none produced an acceptable record.
    #[error("all engines exhausted for '{query}': {}", summarize(.attempts))]
    AllEnginesExhausted {
        query: String,
        attempts: Vec<AttemptRecord>,
        /// Highest-scoring soft-failed record, if any engine produced one.
        best_effort: Option<Box<Record>>,
    },

    /// The query was empty after normalization.
    #[error("query is empty")]
    EmptyQuery,
}

impl ExtractionError {
    /// Engines tried, in order, with their attempt counts and last errors.
    pub fn engine_summaries(&self) -> Vec<EngineFailureSummary> {
        match self {
            ExtractionError::AllEnginesExhausted { attempts, .. } => summaries(attempts),
            ExtractionError::EmptyQuery => Vec::new(),
        }
    }

    /// True when the chain stopped because the caller cancelled it.
    pub fn was_cancelled(&self) -> bool {
        match self {
            ExtractionError::AllEnginesExhausted { attempts, .. } => attempts
                .last()
                .map(|a| a.outcome == AttemptOutcome::Failed(EngineError::Cancelled))
                .unwrap_or(false),
            ExtractionError::EmptyQuery => false,
        }
    }
}

fn summaries(attempts: &[AttemptRecord]) -> Vec<EngineFailureSummary> {
    let mut out: Vec<EngineFailureSummary> = Vec::new();
    for record in attempts {
        match out.iter_mut().find(|s| s.engine == record.engine) {
            Some(summary) => {
                summary.attempts += 1;
                summary.last_error = record.outcome.to_string();
            }
            None => out.push(EngineFailureSummary {
                engine: record.engine.clone(),
                attempts: 1,
                last_error: record.outcome.to_string(),
            }),
        }
    }
    out
}

fn summarize(attempts: &[AttemptRecord]) -> String {
    if attempts.is_empty() {
        return "no engine attempted".to_string();
    }
    summaries(attempts)
        .iter()
        .map(|s| format!("{} x{} (last: {})", s.engine, s.attempts, s.last_error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Storage-layer errors. Logged and swallowed by the orchestrator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
