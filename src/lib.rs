//! Maps business extraction with engine fallback and a persistent cache.
//!
//! - [`engine`] - browser engines behind the `EngineAdapter` trait
//! - [`quality`] - completeness scoring and the acceptance floor
//! - [`cache`] - SQLite cache with merge-on-write upserts
//! - [`orchestrator`] - cache lookup, retry, fallback and write-back
//! - [`batch`] - bounded-concurrency batch runs
//! - [`testing`] - scripted engines and fixture records

pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod quality;
pub mod query;
pub mod record;
pub mod testing;

pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use config::Config;
pub use engine::{EngineAdapter, ExtractOptions, FallbackEngine, FastEngine};
pub use error::{CacheError, EngineError, ExtractionError};
pub use identity::BusinessIdentity;
pub use orchestrator::{ExtractRequest, Extraction, Orchestrator, OrchestratorPolicy};
pub use quality::QualityScorer;
pub use record::Record;
