//! Batch coordinator.
//!
//! Every query holds a browser session while it runs, so concurrency is
//! always bounded by a semaphore. Results come back in input order no matter
//! which query finishes first. Dropping a running batch cancels its queries.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::EngineFailureSummary;
use crate::orchestrator::{ExtractRequest, Extraction, Orchestrator};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 5;

/// Result for one query of a batch.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Extracted { extraction: Extraction },
    Failed { error: String, engines: Vec<EngineFailureSummary> },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchItem {
    pub index: usize,
    pub query: String,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub from_cache: usize,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchReport {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub items: Vec<BatchItem>,
    pub summary: BatchSummary,
}

/// Runs many queries through one orchestrator with bounded concurrency.
pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    workers: usize,
}

impl BatchCoordinator {
    /// `workers` is clamped to `MIN_WORKERS..=MAX_WORKERS`.
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        Self {
            orchestrator,
            workers: workers.clamp(MIN_WORKERS, MAX_WORKERS),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run(&self, queries: Vec<String>, request: ExtractRequest) -> BatchReport {
        let id = Uuid::new_v4();
        let started = Instant::now();
        let total = queries.len();
        info!(batch_id = %id, total, workers = self.workers, "📦 batch started");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(total);

        // Cancels every query still queued or running if this future is dropped.
        let batch_cancel = request.cancel.child_token();
        let _cancel_on_drop = batch_cancel.clone().drop_guard();

        for query in &queries {
            let semaphore = semaphore.clone();
            let orchestrator = self.orchestrator.clone();
            let query = query.clone();
            let request = ExtractRequest {
                cancel: batch_cancel.child_token(),
                ..request.clone()
            };

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                orchestrator.extract(&query, &request).await
            }));
        }

        let mut items = Vec::with_capacity(total);
        let mut summary = BatchSummary { total, ..BatchSummary::default() };

        // Handles are awaited in spawn order, which is input order.
        for (index, (query, handle)) in queries.into_iter().zip(handles).enumerate() {
            let outcome = match handle.await {
                Ok(Ok(extraction)) => {
                    summary.succeeded += 1;
                    if extraction.provenance.from_cache {
                        summary.from_cache += 1;
                    }
                    BatchOutcome::Extracted { extraction }
                }
                Ok(Err(e)) => {
                    summary.failed += 1;
                    BatchOutcome::Failed {
                        error: e.to_string(),
                        engines: e.engine_summaries(),
                    }
                }
                Err(e) => {
                    error!(batch_id = %id, index, error = %e, "batch worker panicked");
                    summary.failed += 1;
                    BatchOutcome::Failed {
                        error: format!("worker panicked: {}", e),
                        engines: Vec::new(),
                    }
                }
            };
            items.push(BatchItem { index, query, outcome });
        }

        summary.elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            batch_id = %id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            from_cache = summary.from_cache,
            seconds = summary.elapsed_seconds,
            "📊 batch finished"
        );

        BatchReport { id, items, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::CacheStore;
    use crate::engine::{EngineAdapter, ExtractOptions};
    use crate::error::EngineError;
    use crate::orchestrator::OrchestratorPolicy;
    use crate::query::NormalizedQuery;
    use crate::record::Record;
    use crate::testing::{rich_record, ScriptedEngine};

    /// Tracks how many calls run at once; sleeps longer for earlier queries so
    /// completion order is the reverse of input order.
    #[derive(Default)]
    struct ProbeEngine {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EngineAdapter for ProbeEngine {
        fn name(&self) -> &str {
            "probe"
        }

        async fn extract(&self, query: &NormalizedQuery, _options: &ExtractOptions) -> Result<Record, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let n: u64 = query.display().trim_start_matches("shop ").parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(80 - n * 10)).await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            if n == 3 {
                return Err(EngineError::ElementNotFound("place name".to_string()));
            }
            Ok(rich_record(&format!("Shop {}", n), 100 + n))
        }
    }

    async fn coordinator(engine: Arc<ProbeEngine>, workers: usize) -> BatchCoordinator {
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let policy = OrchestratorPolicy {
            max_attempts: 1,
            ..OrchestratorPolicy::default()
        };
        let orchestrator = Arc::new(Orchestrator::new(cache, vec![engine as Arc<dyn EngineAdapter>], policy));
        BatchCoordinator::new(orchestrator, workers)
    }

    #[tokio::test]
    async fn test_results_keep_input_order_and_bound() {
        let engine = Arc::new(ProbeEngine::default());
        let batch = coordinator(engine.clone(), 2).await;
        let queries: Vec<String> = (0..6).map(|i| format!("shop {}", i)).collect();

        let report = batch.run(queries.clone(), ExtractRequest::default()).await;

        assert_eq!(report.items.len(), 6);
        for (i, item) in report.items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.query, queries[i]);
        }
        match &report.items[5].outcome {
            BatchOutcome::Extracted { extraction } => assert_eq!(extraction.record.name, "Shop 5"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(report.items[3].outcome, BatchOutcome::Failed { .. }));
        assert_eq!(report.summary.succeeded, 5);
        assert_eq!(report.summary.failed, 1);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_abandoned_batch_starts_no_new_extractions() {
        let engine = ScriptedEngine::new("fast")
            .always_return(rich_record("Shop", 1))
            .with_delay(Duration::from_millis(300));
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let policy = OrchestratorPolicy {
            max_attempts: 1,
            ..OrchestratorPolicy::default()
        };
        let engines: Vec<Arc<dyn EngineAdapter>> = vec![Arc::new(engine.clone())];
        let batch = BatchCoordinator::new(Arc::new(Orchestrator::new(cache, engines, policy)), 2);
        let queries: Vec<String> = (0..6).map(|i| format!("shop {}", i)).collect();

        let outer = tokio::time::timeout(Duration::from_millis(80), batch.run(queries, ExtractRequest::default())).await;
        assert!(outer.is_err());
        let at_drop = engine.call_count();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(at_drop, 2);
        assert_eq!(engine.call_count(), at_drop);
    }

    #[tokio::test]
    async fn test_worker_count_is_clamped() {
        let engine = Arc::new(ProbeEngine::default());
        assert_eq!(coordinator(engine.clone(), 0).await.workers(), 1);
        assert_eq!(coordinator(engine, 64).await.workers(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_repeated_queries_hit_cache() {
        let engine = Arc::new(ProbeEngine::default());
        let batch = coordinator(engine, 1).await;

        batch.run(vec!["shop 1".to_string()], ExtractRequest::default()).await;
        let report = batch.run(vec!["shop 1".to_string()], ExtractRequest::default()).await;
        assert_eq!(report.summary.from_cache, 1);
    }
}
