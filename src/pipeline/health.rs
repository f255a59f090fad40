//! Health monitoring and metrics for pipeline stages

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single stage
///
/// All fields use atomic operations so the orchestrator can read them while
/// the stage thread is still updating them.
#[derive(Debug)]
pub struct StageHealth {
    name: &'static str,

    /// Units popped from the input queue (or read from the source)
    pub received: AtomicU64,

    /// Units pushed to the output queue (or consumed by the sink)
    pub emitted: AtomicU64,

    /// Units dropped without output: foreign streams, transient failures
    pub skipped: AtomicU64,

    /// Transient failures reported by the collaborator
    pub failures: AtomicU64,
}

impl StageHealth {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            received: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, count: u64) {
        self.emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> StageSummary {
        StageSummary {
            name: self.name,
            received: self.received(),
            emitted: self.emitted(),
            skipped: self.skipped(),
            failures: self.failures(),
        }
    }
}

/// Health metrics for a whole pipeline, one entry per stage in topology order
#[derive(Debug, Default)]
pub struct PipelineHealth {
    stages: Vec<Arc<StageHealth>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage and get the counters it should update
    pub fn register(&mut self, name: &'static str) -> Arc<StageHealth> {
        let stage = Arc::new(StageHealth::new(name));
        self.stages.push(stage.clone());
        stage
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<StageHealth>> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stages(&self) -> &[Arc<StageHealth>] {
        &self.stages
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            stages: self.stages.iter().map(|s| s.summary()).collect(),
        }
    }
}

/// Snapshot of one stage's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub name: &'static str,
    pub received: u64,
    pub emitted: u64,
    pub skipped: u64,
    pub failures: u64,
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: in={} out={}", self.name, self.received, self.emitted)?;
        if self.skipped > 0 {
            write!(f, " skipped={}", self.skipped)?;
        }
        if self.failures > 0 {
            write!(f, " failures={}", self.failures)?;
        }
        Ok(())
    }
}

/// Snapshot of every stage, printable as a single log line
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub stages: Vec<StageSummary>,
}

impl fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}
