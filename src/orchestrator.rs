//! Extraction orchestrator.
//!
//! Runs one query through the chain:
//!
//! ```text
//! CacheLookup -> EngineAttempt(0) -> EngineAttempt(1) -> ... -> Accepted | Exhausted
//! ```
//!
//! - A fresh cache hit goes straight to `Accepted` without touching an engine.
//! - Each engine gets `max_attempts` tries with linear backoff. A record at or
//!   above the quality floor is accepted; hard errors and soft failures move on.
//! - Across engines the best-scoring record wins, not the first engine.
//! - The cache is best effort: read errors count as a miss, write errors are
//!   logged and dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::cache::{CacheEntry, CacheStore, ExtractionEvent};
use crate::engine::{EngineAdapter, ExtractOptions};
use crate::error::{AttemptOutcome, AttemptRecord, EngineError, ExtractionError};
use crate::identity::BusinessIdentity;
use crate::quality::{QualityScorer, DEFAULT_QUALITY_FLOOR};
use crate::query::NormalizedQuery;
use crate::record::Record;

// ============================================================================
// Configuration
// ============================================================================

/// Knobs fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    pub quality_floor: u8,
    /// Tries per engine, at least 1.
    pub max_attempts: u32,
    /// Attempt `n` on an engine waits `retry_backoff * (n - 1)` first.
    pub retry_backoff: Duration,
    pub cache_max_age: Duration,
    /// Accept the best soft-failed record instead of failing the query.
    pub accept_best_effort: bool,
    pub locale: String,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            quality_floor: DEFAULT_QUALITY_FLOOR,
            max_attempts: 2,
            retry_backoff: Duration::from_secs(3),
            cache_max_age: Duration::from_secs(168 * 3600),
            accept_best_effort: false,
            locale: "en".to_string(),
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub force_refresh: bool,
    pub include_reviews: bool,
    pub max_reviews: usize,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        Self {
            force_refresh: false,
            include_reviews: true,
            max_reviews: 20,
            timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }
}

impl ExtractRequest {
    fn engine_options(&self) -> ExtractOptions {
        ExtractOptions {
            include_reviews: self.include_reviews,
            max_reviews: self.max_reviews,
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Where an accepted record came from.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Provenance {
    pub source_engine: String,
    pub from_cache: bool,
    pub extraction_time_seconds: f64,
    /// Engine calls made for this query (0 on a cache hit).
    pub attempts: u32,
}

/// Successful outcome of `Orchestrator::extract`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Extraction {
    pub record: Record,
    pub provenance: Provenance,
    /// The stored entry after write-back, when the cache was reachable.
    pub entry: Option<CacheEntry>,
}

struct Candidate {
    record: Record,
    engine: String,
}

enum State {
    CacheLookup,
    EngineAttempt(usize),
    Accepted(Candidate),
    Exhausted,
}

enum EngineRun {
    Accepted(Record),
    /// Engine gave up; carries its best soft-failed record, if any.
    Exhausted(Option<Record>),
    Cancelled,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Composition root: one cache, an ordered engine chain, one policy.
pub struct Orchestrator {
    cache: Arc<CacheStore>,
    engines: Vec<Arc<dyn EngineAdapter>>,
    scorer: QualityScorer,
    policy: OrchestratorPolicy,
}

impl Orchestrator {
    pub fn new(cache: Arc<CacheStore>, engines: Vec<Arc<dyn EngineAdapter>>, policy: OrchestratorPolicy) -> Self {
        Self {
            cache,
            engines,
            scorer: QualityScorer::new(policy.quality_floor),
            policy: OrchestratorPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn policy(&self) -> &OrchestratorPolicy {
        &self.policy
    }

    /// Extract one business.
    pub async fn extract(&self, query: &str, request: &ExtractRequest) -> Result<Extraction, ExtractionError> {
        let normalized = NormalizedQuery::parse(query, &self.policy.locale).ok_or(ExtractionError::EmptyQuery)?;
        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut calls = 0u32;
        let mut best: Option<Candidate> = None;
        let mut state = State::CacheLookup;

        loop {
            state = match state {
                State::CacheLookup => {
                    if request.force_refresh {
                        debug!(query = %normalized.display(), "forced refresh, skipping cache");
                        State::EngineAttempt(0)
                    } else if let Some(entry) = self.lookup(&normalized).await {
                        info!(query = %normalized.display(), identity = %entry.identity, "⚡ cache hit");
                        return Ok(Extraction {
                            record: entry.record.clone(),
                            provenance: Provenance {
                                source_engine: entry.source_engine.clone(),
                                from_cache: true,
                                extraction_time_seconds: started.elapsed().as_secs_f64(),
                                attempts: 0,
                            },
                            entry: Some(entry),
                        });
                    } else {
                        debug!(query = %normalized.display(), "cache miss");
                        State::EngineAttempt(0)
                    }
                }

                State::EngineAttempt(index) => match self.engines.get(index) {
                    None => State::Exhausted,
                    Some(engine) => {
                        debug!(query = %normalized.display(), engine = engine.name(), "engine attempt");
                        match self.run_engine(engine.as_ref(), &normalized, request, &mut attempts, &mut calls).await {
                            EngineRun::Accepted(record) => {
                                let candidate = Candidate { record, engine: engine.name().to_string() };
                                // Best score wins, even over the engine that just passed the floor.
                                match best.take() {
                                    Some(prev) if prev.record.quality_score > candidate.record.quality_score => {
                                        State::Accepted(prev)
                                    }
                                    _ => State::Accepted(candidate),
                                }
                            }
                            EngineRun::Exhausted(record) => {
                                if let Some(record) = record {
                                    let better = best
                                        .as_ref()
                                        .map_or(true, |b| record.quality_score > b.record.quality_score);
                                    if better {
                                        best = Some(Candidate { record, engine: engine.name().to_string() });
                                    }
                                }
                                State::EngineAttempt(index + 1)
                            }
                            EngineRun::Cancelled => State::Exhausted,
                        }
                    }
                },

                State::Accepted(candidate) => {
                    return Ok(self.accept(&normalized, candidate, calls, started).await);
                }

                State::Exhausted => {
                    let cancelled = attempts
                        .last()
                        .map_or(false, |a| a.outcome == AttemptOutcome::Failed(EngineError::Cancelled));
                    if self.policy.accept_best_effort && !cancelled {
                        if let Some(candidate) = best.take() {
                            info!(
                                query = %normalized.display(),
                                engine = %candidate.engine,
                                score = candidate.record.quality_score,
                                "accepting best-effort record below floor"
                            );
                            State::Accepted(candidate)
                        } else {
                            return Err(self.exhausted(&normalized, attempts, None));
                        }
                    } else {
                        return Err(self.exhausted(&normalized, attempts, best.map(|b| b.record)));
                    }
                }
            };
        }
    }

    /// Try one engine up to `max_attempts` times.
    async fn run_engine(
        &self,
        engine: &dyn EngineAdapter,
        query: &NormalizedQuery,
        request: &ExtractRequest,
        attempts: &mut Vec<AttemptRecord>,
        calls: &mut u32,
    ) -> EngineRun {
        let name = engine.name().to_string();
        let options = request.engine_options();
        let mut best: Option<Record> = None;

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                let backoff = self.policy.retry_backoff * (attempt - 1);
                debug!(engine = %name, attempt, backoff = ?backoff, "⏳ backing off before retry");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = request.cancel.cancelled() => {}
                }
            }
            if request.cancel.is_cancelled() {
                attempts.push(AttemptRecord {
                    engine: name.clone(),
                    attempt,
                    outcome: AttemptOutcome::Failed(EngineError::Cancelled),
                });
                return EngineRun::Cancelled;
            }

            *calls += 1;
            let attempt_started = Instant::now();
            let result = engine.extract(query, &options).await;
            let duration = attempt_started.elapsed();

            match result {
                Ok(mut record) => {
                    record.quality_score = self.scorer.score(&record);
                    let score = record.quality_score;
                    if self.scorer.accepts(score) {
                        info!(engine = %name, attempt, score, "✅ record accepted");
                        self.record_history(query, &name, duration, Some(&record), None).await;
                        return EngineRun::Accepted(record);
                    }

                    let outcome = AttemptOutcome::BelowQualityFloor { score, floor: self.scorer.floor() };
                    warn!(engine = %name, attempt, score, floor = self.scorer.floor(), "record below quality floor");
                    self.record_history(query, &name, duration, Some(&record), Some(outcome.to_string()))
                        .await;
                    attempts.push(AttemptRecord { engine: name.clone(), attempt, outcome });
                    if best.as_ref().map_or(true, |b| score > b.quality_score) {
                        best = Some(record);
                    }
                }
                Err(error) => {
                    warn!(engine = %name, attempt, error = %error, "❌ engine attempt failed");
                    self.record_history(query, &name, duration, None, Some(error.to_string())).await;
                    let cancelled = error == EngineError::Cancelled;
                    attempts.push(AttemptRecord {
                        engine: name.clone(),
                        attempt,
                        outcome: AttemptOutcome::Failed(error),
                    });
                    if cancelled {
                        return EngineRun::Cancelled;
                    }
                }
            }
        }

        EngineRun::Exhausted(best)
    }

    async fn lookup(&self, query: &NormalizedQuery) -> Option<CacheEntry> {
        let max_age = self.policy.cache_max_age;
        let by_identity = match query.identity_hint() {
            Some(identity) => self.cache.get(&identity, max_age).await,
            None => Ok(None),
        };
        let result = match by_identity {
            Ok(None) => self.cache.get_by_query(&query.cache_key(), max_age).await,
            other => other,
        };
        match result {
            Ok(entry) => entry,
            Err(e) => {
                warn!(query = %query.display(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn accept(&self, query: &NormalizedQuery, candidate: Candidate, attempts: u32, started: Instant) -> Extraction {
        let entry = match self.cache.upsert(&candidate.record, &candidate.engine).await {
            Ok(entry) => {
                if let Err(e) = self.cache.remember_query(&query.cache_key(), &entry.identity).await {
                    warn!(query = %query.display(), error = %e, "failed to remember query alias");
                }
                Some(entry)
            }
            Err(e) => {
                warn!(query = %query.display(), error = %e, "cache write failed, returning uncached record");
                None
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            query = %query.display(),
            engine = %candidate.engine,
            score = candidate.record.quality_score,
            seconds = elapsed,
            "extraction accepted"
        );

        Extraction {
            record: candidate.record,
            provenance: Provenance {
                source_engine: candidate.engine,
                from_cache: false,
                extraction_time_seconds: elapsed,
                attempts,
            },
            entry,
        }
    }

    fn exhausted(&self, query: &NormalizedQuery, attempts: Vec<AttemptRecord>, best: Option<Record>) -> ExtractionError {
        let error = ExtractionError::AllEnginesExhausted {
            query: query.display().to_string(),
            attempts,
            best_effort: best.map(Box::new),
        };
        warn!(error = %error, "extraction exhausted");
        error
    }

    async fn record_history(
        &self,
        query: &NormalizedQuery,
        engine: &str,
        duration: Duration,
        record: Option<&Record>,
        error: Option<String>,
    ) {
        let event = ExtractionEvent {
            business_key: record.map(|r| BusinessIdentity::from_record(r).key()),
            query: query.display().to_string(),
            engine: engine.to_string(),
            duration,
            quality_score: record.map(|r| r.quality_score),
            success: error.is_none(),
            error,
        };
        if let Err(e) = self.cache.record_extraction(&event).await {
            warn!(engine, error = %e, "failed to record extraction history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{core_record, rich_record, sparse_record, ScriptedEngine};

    fn policy() -> OrchestratorPolicy {
        OrchestratorPolicy {
            retry_backoff: Duration::from_millis(10),
            ..OrchestratorPolicy::default()
        }
    }

    async fn orchestrator(fast: &ScriptedEngine, fallback: &ScriptedEngine, policy: OrchestratorPolicy) -> Orchestrator {
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let engines: Vec<Arc<dyn EngineAdapter>> = vec![Arc::new(fast.clone()), Arc::new(fallback.clone())];
        Orchestrator::new(cache, engines, policy)
    }

    #[tokio::test]
    async fn test_primary_accepted_and_cached() {
        let fast = ScriptedEngine::new("fast").always_return(rich_record("Starbucks", 7));
        let fallback = ScriptedEngine::new("fallback");
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let result = orch.extract("Starbucks Times Square NYC", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.record.quality_score, 78);
        assert_eq!(result.provenance.source_engine, "fast");
        assert!(!result.provenance.from_cache);
        assert_eq!(result.provenance.attempts, 1);
        assert_eq!(result.entry.as_ref().unwrap().update_count, 1);
        assert_eq!(fallback.call_count(), 0);

        let again = orch.extract("starbucks  times square nyc", &ExtractRequest::default()).await.unwrap();
        assert!(again.provenance.from_cache);
        assert_eq!(again.provenance.attempts, 0);
        assert_eq!(again.entry.unwrap().update_count, 1);
        assert_eq!(fast.call_count(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let fast = ScriptedEngine::new("fast").always_return(rich_record("Starbucks", 7));
        let orch = orchestrator(&fast, &ScriptedEngine::new("fallback"), policy()).await;

        orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        let request = ExtractRequest { force_refresh: true, ..ExtractRequest::default() };
        let refreshed = orch.extract("starbucks", &request).await.unwrap();
        assert!(!refreshed.provenance.from_cache);
        assert_eq!(refreshed.entry.unwrap().update_count, 2);
        assert_eq!(fast.call_count(), 2);
    }

    #[tokio::test]
    async fn test_soft_failure_falls_back() {
        let fast = ScriptedEngine::new("fast").always_return(sparse_record("Starbucks"));
        let fallback = ScriptedEngine::new("fallback").always_return(core_record("Starbucks", 7));
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let result = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.provenance.source_engine, "fallback");
        assert_eq!(result.record.quality_score, 65);
        assert_eq!(fast.call_count(), 2);
        assert_eq!(fallback.call_count(), 1);
        assert_eq!(result.provenance.attempts, 3);
    }

    #[tokio::test]
    async fn test_hard_errors_fall_back() {
        let fast = ScriptedEngine::new("fast").always_fail(EngineError::Launch("chrome missing".to_string()));
        let fallback = ScriptedEngine::new("fallback").always_return(core_record("Starbucks", 7));
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let result = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.provenance.source_engine, "fallback");
        assert_eq!(fast.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_on_same_engine() {
        let fast = ScriptedEngine::new("fast")
            .then_fail(EngineError::NavigationTimeout(Duration::from_secs(1)))
            .then_return(rich_record("Starbucks", 7));
        let fallback = ScriptedEngine::new("fallback");
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let result = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.provenance.source_engine, "fast");
        assert_eq!(result.provenance.attempts, 2);
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_soft_failures_exhaust_with_best_candidate() {
        let weak = Record::builder("Starbucks").build().unwrap();
        let fast = ScriptedEngine::new("fast").always_return(sparse_record("Starbucks"));
        let fallback = ScriptedEngine::new("fallback").always_return(weak);
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let err = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap_err();
        match &err {
            ExtractionError::AllEnginesExhausted { attempts, best_effort, .. } => {
                assert_eq!(attempts.len(), 4);
                assert_eq!(best_effort.as_ref().unwrap().quality_score, 30);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let summaries = err.engine_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].last_error, "quality 15 below floor 50");
        assert_eq!(orch.cache().stats().await.unwrap().total_entries, 0);
    }

    #[tokio::test]
    async fn test_best_effort_keeps_higher_score_from_primary() {
        let weak = Record::builder("Starbucks").build().unwrap();
        let fast = ScriptedEngine::new("fast").always_return(sparse_record("Starbucks"));
        let fallback = ScriptedEngine::new("fallback").always_return(weak);
        let orch = orchestrator(&fast, &fallback, OrchestratorPolicy { accept_best_effort: true, ..policy() }).await;

        let result = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.provenance.source_engine, "fast");
        assert_eq!(result.record.quality_score, 30);
        assert!(result.entry.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_chain() {
        let fast = ScriptedEngine::new("fast").then_hang();
        let fallback = ScriptedEngine::new("fallback").always_return(rich_record("Starbucks", 7));
        let orch = orchestrator(&fast, &fallback, policy()).await;

        let request = ExtractRequest { timeout: Duration::from_secs(30), ..ExtractRequest::default() };
        let cancel = request.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = orch.extract("starbucks", &request).await.unwrap_err();
        assert!(err.was_cancelled());
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let orch = orchestrator(&ScriptedEngine::new("fast"), &ScriptedEngine::new("fallback"), policy()).await;
        let err = orch.extract("   ", &ExtractRequest::default()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::EmptyQuery));
    }

    #[tokio::test]
    async fn test_url_query_hits_cache_by_identity() {
        let fast = ScriptedEngine::new("fast").always_return(rich_record("Starbucks", 42));
        let orch = orchestrator(&fast, &ScriptedEngine::new("fallback"), policy()).await;

        orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        let hit = orch.extract("https://maps.google.com/?cid=42", &ExtractRequest::default()).await.unwrap();
        assert!(hit.provenance.from_cache);
        assert_eq!(fast.call_count(), 1);
    }

    #[tokio::test]
    async fn test_history_records_every_attempt() {
        let fast = ScriptedEngine::new("fast").always_fail(EngineError::Crashed("gone".to_string()));
        let fallback = ScriptedEngine::new("fallback").always_return(rich_record("Starbucks", 7));
        let orch = orchestrator(&fast, &fallback, policy()).await;

        orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        let stats = orch.cache().stats().await.unwrap();
        let fast_stats = stats.engines.iter().find(|e| e.engine == "fast").unwrap();
        let fallback_stats = stats.engines.iter().find(|e| e.engine == "fallback").unwrap();
        assert_eq!((fast_stats.attempts, fast_stats.successes), (2, 0));
        assert_eq!((fallback_stats.attempts, fallback_stats.successes), (1, 1));
    }

    #[tokio::test]
    async fn test_broken_cache_never_fails_extraction() {
        let fast = ScriptedEngine::new("fast").always_return(rich_record("Starbucks", 7));
        let orch = orchestrator(&fast, &ScriptedEngine::new("fallback"), policy()).await;
        orch.cache().pool().close().await;

        let result = orch.extract("starbucks", &ExtractRequest::default()).await.unwrap();
        assert_eq!(result.provenance.source_engine, "fast");
        assert!(result.entry.is_none());
    }
}
