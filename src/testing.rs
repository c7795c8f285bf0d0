//! Testing utilities.
//!
//! `ScriptedEngine` stands in for a browser engine so orchestrator and batch
//! behaviour can be tested without launching Chrome.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{EngineAdapter, ExtractOptions};
use crate::error::EngineError;
use crate::query::NormalizedQuery;
use crate::record::Record;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    Return(Record),
    Fail(EngineError),
    /// Block until cancelled or the call's timeout elapses.
    Hang,
}

/// A deterministic engine that replays queued steps in order.
///
/// Once the queue is empty the fallback step (if any) repeats forever;
/// without one the engine fails with `ElementNotFound`.
#[derive(Clone)]
pub struct ScriptedEngine {
    name: String,
    steps: Arc<RwLock<VecDeque<Step>>>,
    repeat: Option<Step>,
    delay: Duration,
    calls: Arc<RwLock<Vec<String>>>,
}

impl ScriptedEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Arc::new(RwLock::new(VecDeque::new())),
            repeat: None,
            delay: Duration::ZERO,
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn then_return(self, record: Record) -> Self {
        self.steps.write().unwrap().push_back(Step::Return(record));
        self
    }

    pub fn then_fail(self, error: EngineError) -> Self {
        self.steps.write().unwrap().push_back(Step::Fail(error));
        self
    }

    pub fn then_hang(self) -> Self {
        self.steps.write().unwrap().push_back(Step::Hang);
        self
    }

    pub fn always_return(mut self, record: Record) -> Self {
        self.repeat = Some(Step::Return(record));
        self
    }

    pub fn always_fail(mut self, error: EngineError) -> Self {
        self.repeat = Some(Step::Fail(error));
        self
    }

    /// Simulated work time per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queries this engine was called with, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    fn next_step(&self) -> Option<Step> {
        self.steps.write().unwrap().pop_front().or_else(|| self.repeat.clone())
    }
}

#[async_trait]
impl EngineAdapter for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, query: &NormalizedQuery, options: &ExtractOptions) -> Result<Record, EngineError> {
        self.calls.write().unwrap().push(query.display().to_string());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = options.cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }

        match self.next_step() {
            Some(Step::Return(record)) => Ok(record),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                tokio::select! {
                    _ = tokio::time::sleep(options.timeout) => Err(EngineError::NavigationTimeout(options.timeout)),
                    _ = options.cancel.cancelled() => Err(EngineError::Cancelled),
                }
            }
            None => Err(EngineError::ElementNotFound("scripted engine has no more steps".to_string())),
        }
    }
}

// ============================================================================
// Fixture Records
// ============================================================================

fn core(name: &str, cid: u64) -> crate::record::RecordBuilder {
    Record::builder(name)
        .cid(Some(cid))
        .address(Some("1585 Broadway, New York, NY 10036"))
        .phone(Some("+1 212-555-0100"))
        .coordinates(Some(40.7580), Some(-73.9855))
}

fn with_images(mut builder: crate::record::RecordBuilder, count: usize) -> crate::record::RecordBuilder {
    for i in 0..count {
        builder = builder.image(&format!("https://img.example/{}.jpg", i), Some("high"));
    }
    builder
}

/// Core fields, category, rating and five photos: scores 78.
pub fn rich_record(name: &str, cid: u64) -> Record {
    let builder = core(name, cid).category(Some("Coffee shop")).rating(Some(4.1));
    with_images(builder, 5).build().unwrap()
}

/// Core fields and five photos: scores 65.
pub fn core_record(name: &str, cid: u64) -> Record {
    with_images(core(name, cid), 5).build().unwrap()
}

/// Name and address only: scores 30.
pub fn sparse_record(name: &str) -> Record {
    Record::builder(name)
        .address(Some("1585 Broadway, New York, NY 10036"))
        .build()
        .unwrap()
}
