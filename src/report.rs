//! Run report.
//!
//! Collects one [`TestOutcome`] per executed test, grouped by job in the
//! order the jobs were first run.

use crate::strategy::{ExecutionResult, serialize_duration};
use std::path::PathBuf;
use std::time::Duration;

/// Result of running a single test.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestOutcome {
    pub collection: String,
    pub job: String,
    pub test: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub failures: Vec<String>,
    /// Absent when the test failed before its job could run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
    /// The simulated directory, when it was kept for inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_directory: Option<PathBuf>,
}

/// The outcomes of one job's executed tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobReport {
    pub collection: String,
    pub job: String,
    pub tests: Vec<TestOutcome>,
}

impl JobReport {
    /// A job passes when every executed test under it passes.
    pub fn passed(&self) -> bool {
        self.tests.iter().all(|t| t.passed)
    }

    pub fn duration(&self) -> Duration {
        self.tests.iter().map(|t| t.duration).sum()
    }
}

/// Accumulated outcomes of a whole run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    /// RFC 3339 start time.
    pub started_at: String,
    pub jobs: Vec<JobReport>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            jobs: Vec::new(),
        }
    }

    /// Add an outcome under its job.
    pub fn record(&mut self, outcome: TestOutcome) {
        match self
            .jobs
            .iter_mut()
            .find(|j| j.collection == outcome.collection && j.job == outcome.job)
        {
            Some(job) => job.tests.push(outcome),
            None => self.jobs.push(JobReport {
                collection: outcome.collection.clone(),
                job: outcome.job.clone(),
                tests: vec![outcome],
            }),
        }
    }

    /// The run passes when every executed job passes.
    pub fn passed(&self) -> bool {
        self.jobs.iter().all(JobReport::passed)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &TestOutcome> {
        self.jobs.iter().flat_map(|j| j.tests.iter())
    }

    /// `(passed, failed)` test counts.
    pub fn counts(&self) -> (usize, usize) {
        let passed = self.outcomes().filter(|t| t.passed).count();
        (passed, self.outcomes().count() - passed)
    }

    pub fn duration(&self) -> Duration {
        self.jobs.iter().map(JobReport::duration).sum()
    }
}
