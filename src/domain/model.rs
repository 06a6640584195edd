use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 100;

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn offset(at: Instant, started_at: Instant) -> f64 {
    seconds(at.saturating_duration_since(started_at))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureExpanded {
    pub expanded: Vec<String>,
    pub backtrace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestResult {
    Passed,
    Failed {
        failure_reason: Option<String>,
        failure_expanded: Vec<FailureExpanded>,
    },
    Skipped,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestResult::Passed => "passed",
            TestResult::Failed { .. } => "failed",
            TestResult::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanSection {
    Http,
    Sql,
    Sleep,
    Annotation,
}

impl SpanSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanSection::Http => "http",
            SpanSection::Sql => "sql",
            SpanSection::Sleep => "sleep",
            SpanSection::Annotation => "annotation",
        }
    }
}

/// A traced section of a single test execution (an HTTP call, a query, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpan {
    pub section: SpanSection,
    pub duration: Duration,
    pub start_at: Option<Instant>,
    pub end_at: Option<Instant>,
    pub detail: Option<String>,
}

impl TestSpan {
    pub fn new(section: SpanSection, duration: Duration) -> Self {
        Self {
            section,
            duration,
            start_at: None,
            end_at: None,
            detail: None,
        }
    }

    pub fn with_bounds(mut self, start_at: Instant, end_at: Instant) -> Self {
        self.start_at = Some(start_at);
        self.end_at = Some(end_at);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn as_json(&self, started_at: Instant) -> Value {
        let mut attrs = Map::new();
        attrs.insert("section".into(), json!(self.section.as_str()));
        attrs.insert("duration".into(), json!(seconds(self.duration)));

        if let Some(detail) = &self.detail {
            attrs.insert("detail".into(), json!(detail));
        }
        if let Some(start_at) = self.start_at {
            attrs.insert("start_at".into(), json!(offset(start_at, started_at)));
        }
        if let Some(end_at) = self.end_at {
            attrs.insert("end_at".into(), json!(offset(end_at, started_at)));
        }

        Value::Object(attrs)
    }
}

/// Top level of the timing tree for one test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestHistory {
    pub start_at: Option<Instant>,
    pub end_at: Option<Instant>,
    pub duration: Option<Duration>,
    pub children: Vec<TestSpan>,
}

impl TestHistory {
    pub fn is_finished(&self) -> bool {
        self.end_at.is_some()
    }

    pub fn push_span(&mut self, span: TestSpan) {
        self.children.push(span);
    }

    pub fn as_json(&self, started_at: Instant) -> Value {
        let children: Vec<Value> = self
            .children
            .iter()
            .map(|span| span.as_json(started_at))
            .collect();

        let mut attrs = Map::new();
        attrs.insert("section".into(), json!("top"));
        attrs.insert("children".into(), Value::Array(children));

        if let Some(start_at) = self.start_at {
            attrs.insert("start_at".into(), json!(offset(start_at, started_at)));
        }
        if let Some(end_at) = self.end_at {
            attrs.insert("end_at".into(), json!(offset(end_at, started_at)));
        }
        if let Some(duration) = self.duration {
            attrs.insert("duration".into(), json!(seconds(duration)));
        }

        Value::Object(attrs)
    }
}

/// One test execution as reported to the analytics API.
#[derive(Debug, Clone, PartialEq)]
pub struct TestData {
    pub id: Uuid,
    pub scope: String,
    pub name: String,
    pub location: Option<String>,
    pub file_name: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub history: TestHistory,
    pub result: Option<TestResult>,
}

impl TestData {
    pub fn start(id: Uuid, scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self::start_at(id, scope, name, Instant::now())
    }

    pub fn start_at(
        id: Uuid,
        scope: impl Into<String>,
        name: impl Into<String>,
        at: Instant,
    ) -> Self {
        Self {
            id,
            scope: scope.into(),
            name: name.into(),
            location: None,
            file_name: None,
            tags: BTreeMap::new(),
            history: TestHistory {
                start_at: Some(at),
                ..TestHistory::default()
            },
            result: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>, file_name: Option<String>) -> Self {
        self.location = location;
        self.file_name = file_name;
        self
    }

    pub fn tag_execution(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.tags.insert(key.into(), val.into());
    }

    /// Sets `end_at` and `duration`. Calling it on a finished test is a no-op.
    pub fn finish(&mut self) {
        self.finish_at(Instant::now(), None);
    }

    /// Like [`finish`](Self::finish), preferring a runner-reported duration
    /// over the wall-clock difference.
    pub fn finish_at(&mut self, end_at: Instant, reported: Option<Duration>) {
        if self.is_finished() {
            return;
        }

        let start_at = *self.history.start_at.get_or_insert(end_at);
        self.history.end_at = Some(end_at);
        self.history.duration =
            Some(reported.unwrap_or_else(|| end_at.saturating_duration_since(start_at)));
    }

    pub fn passed(&mut self) {
        self.result = Some(TestResult::Passed);
    }

    pub fn failed(&mut self, failure_reason: Option<String>, failure_expanded: Vec<FailureExpanded>) {
        self.result = Some(TestResult::Failed {
            failure_reason,
            failure_expanded,
        });
    }

    pub fn skipped(&mut self) {
        self.result = Some(TestResult::Skipped);
    }

    pub fn is_finished(&self) -> bool {
        self.history.is_finished()
    }

    pub fn push_span(&mut self, span: TestSpan) {
        self.history.push_span(span);
    }

    pub fn as_json(&self, started_at: Instant) -> Value {
        let mut attrs = Map::new();
        attrs.insert("id".into(), json!(self.id.to_string()));
        attrs.insert("scope".into(), json!(self.scope));
        attrs.insert("name".into(), json!(self.name));
        attrs.insert("location".into(), json!(self.location));
        attrs.insert("file_name".into(), json!(self.file_name));
        attrs.insert("history".into(), self.history.as_json(started_at));

        if !self.tags.is_empty() {
            attrs.insert("tags".into(), json!(self.tags));
        }

        if let Some(result) = &self.result {
            attrs.insert("result".into(), json!(result.as_str()));

            if let TestResult::Failed {
                failure_reason,
                failure_expanded,
            } = result
            {
                if let Some(reason) = failure_reason {
                    attrs.insert("failure_reason".into(), json!(reason));
                }
                if !failure_expanded.is_empty() {
                    attrs.insert("failure_expanded".into(), json!(failure_expanded));
                }
            }
        }

        Value::Object(attrs)
    }
}

/// Description of the CI build the results belong to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunEnv {
    #[serde(rename = "CI", skip_serializing_if = "Option::is_none")]
    pub ci: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub collector: String,
    pub version: String,
}

impl RunEnv {
    pub fn as_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The full upload document for a test run.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub run_env: RunEnv,
    pub data: Vec<TestData>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl Payload {
    pub fn init(run_env: RunEnv) -> Self {
        Self {
            run_env,
            data: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn started(self) -> Self {
        self.started_at_instant(Instant::now())
    }

    pub fn started_at_instant(mut self, at: Instant) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished_at = Some(Instant::now());
        self
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn push_test_data(&mut self, test: TestData) {
        self.data.push(test);
    }

    pub fn finished_count(&self) -> usize {
        self.data.iter().filter(|t| t.is_finished()).count()
    }

    /// Serialised records for finished tests only.
    pub fn data_json(&self) -> Vec<Value> {
        let started_at = self.reference_instant();
        let finished: Vec<Value> = self
            .data
            .iter()
            .filter(|t| t.is_finished())
            .map(|t| t.as_json(started_at))
            .collect();

        if finished.len() < self.data.len() {
            tracing::warn!(
                "Unexpected unfinished test data, skipping {} unfinished test records...",
                self.data.len() - finished.len()
            );
        }

        finished
    }

    pub fn as_json(&self) -> Value {
        json!({
            "format": "json",
            "run_env": self.run_env.as_json(),
            "data": self.data_json(),
        })
    }

    /// Splits the payload into consecutive chunks of at most `batch_size`
    /// tests. Always yields at least one batch.
    pub fn into_batches(self, batch_size: usize) -> Vec<Payload> {
        let batch_size = batch_size.max(1);
        if self.data.len() <= batch_size {
            return vec![self];
        }

        let Payload {
            run_env,
            data,
            started_at,
            finished_at,
        } = self;

        data.chunks(batch_size)
            .map(|chunk| Payload {
                run_env: run_env.clone(),
                data: chunk.to_vec(),
                started_at,
                finished_at,
            })
            .collect()
    }

    fn reference_instant(&self) -> Instant {
        self.started_at
            .or_else(|| self.data.iter().filter_map(|t| t.history.start_at).min())
            .unwrap_or_else(Instant::now)
    }
}

/// Counts reported by the runner when a test binary finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteSummary {
    pub passed: u64,
    pub failed: u64,
    pub ignored: u64,
    pub measured: u64,
    pub filtered_out: u64,
    pub ok: bool,
}

/// Everything read from one runner event stream.
#[derive(Debug, Clone)]
pub struct CollectedRun {
    pub started_at: Instant,
    pub tests: Vec<TestData>,
    pub suites: Vec<SuiteSummary>,
    /// The stream ended inside a suite or a running test.
    pub aborted: bool,
}

impl CollectedRun {
    /// True when the run aborted, or any suite or test failed.
    pub fn has_failures(&self) -> bool {
        self.aborted
            || self.suites.iter().any(|s| !s.ok)
            || self
                .tests
                .iter()
                .any(|t| matches!(t.result, Some(TestResult::Failed { .. })))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub tests_reported: usize,
    pub tests_unfinished: usize,
    pub batches_sent: usize,
    pub batches_accepted: usize,
    pub batches_failed: usize,
    pub json_written: Option<String>,
    pub json_error: Option<String>,
}
