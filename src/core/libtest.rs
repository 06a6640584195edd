//! Parser for the libtest JSON event stream.
//!
//! Produced by `cargo test -- -Z unstable-options --format json --report-time`
//! and by `cargo nextest run --message-format libtest-json`. One JSON object
//! per line; anything else on the stream (cargo's progress output, compiler
//! diagnostics) is skipped.

use crate::domain::model::{CollectedRun, FailureExpanded, SuiteSummary, TestData};
use crate::utils::error::{CollectorError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

// Rust >= 1.73: "thread 'x' panicked at src/lib.rs:10:5:" followed by the message.
static PANIC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^thread '(?P<thread>[^']*)' panicked at (?P<file>.+?):(?P<line>\d+):(?P<col>\d+):$")
        .expect("panic header pattern")
});

// Older toolchains: "thread 'x' panicked at 'message', src/lib.rs:10:5".
static LEGACY_PANIC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^thread '(?P<thread>[^']*)' panicked at '(?P<msg>.*)', (?P<file>.+?):(?P<line>\d+):(?P<col>\d+)$",
    )
    .expect("legacy panic header pattern")
});

const BACKTRACE_NOTE: &str = "note: run with `RUST_BACKTRACE=1`";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LibtestEvent {
    Suite(SuiteEvent),
    Test(TestEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SuiteEvent {
    pub event: String,
    pub test_count: Option<u64>,
    pub passed: Option<u64>,
    pub failed: Option<u64>,
    pub ignored: Option<u64>,
    pub measured: Option<u64>,
    pub filtered_out: Option<u64>,
    pub exec_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestEvent {
    pub event: String,
    pub name: String,
    pub stdout: Option<String>,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub exec_time: Option<f64>,
}

/// Reason, expanded output, and panic site extracted from captured output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureDetails {
    pub reason: Option<String>,
    pub expanded: Vec<FailureExpanded>,
    pub file_name: Option<String>,
    pub location: Option<String>,
}

pub const BINARY_TAG: &str = "binary";

/// Splits `a::b::c` into scope `a::b` and name `c`.
pub fn split_test_name(full_name: &str) -> (String, String) {
    match full_name.rsplit_once("::") {
        Some((scope, name)) => (scope.to_string(), name.to_string()),
        None => (String::new(), full_name.to_string()),
    }
}

/// nextest prefixes names with the binary id: `crate::bin/x$mod::test`.
pub fn split_binary_id(full_name: &str) -> (Option<&str>, &str) {
    match full_name.split_once('$') {
        Some((binary, rest)) if !binary.is_empty() && !rest.is_empty() => (Some(binary), rest),
        _ => (None, full_name),
    }
}

fn new_test(full_name: &str, at: Instant) -> TestData {
    let (binary, test_name) = split_binary_id(full_name);
    let (scope, name) = split_test_name(test_name);
    let mut test = TestData::start_at(Uuid::new_v4(), scope, name, at);
    if let Some(binary) = binary {
        test.tag_execution(BINARY_TAG, binary);
    }
    test
}

pub fn parse_failure(stdout: Option<&str>, message: Option<&str>) -> FailureDetails {
    let mut details = FailureDetails::default();
    let mut expanded = Vec::new();
    let mut backtrace = Vec::new();
    let mut in_backtrace = false;
    let mut expect_message = false;

    for line in stdout.unwrap_or_default().lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() || trimmed.starts_with(BACKTRACE_NOTE) {
            continue;
        }

        if trimmed == "stack backtrace:" {
            in_backtrace = true;
            continue;
        }
        if in_backtrace {
            backtrace.push(trimmed.trim().to_string());
            continue;
        }

        if details.reason.is_none() {
            if let Some(caps) = PANIC_HEADER.captures(trimmed) {
                details.file_name = Some(caps["file"].to_string());
                details.location = Some(format!("{}:{}", &caps["file"], &caps["line"]));
                expect_message = true;
                continue;
            }
            if let Some(caps) = LEGACY_PANIC_HEADER.captures(trimmed) {
                details.file_name = Some(caps["file"].to_string());
                details.location = Some(format!("{}:{}", &caps["file"], &caps["line"]));
                details.reason = Some(caps["msg"].to_string());
                continue;
            }
            if expect_message {
                details.reason = Some(trimmed.to_string());
                expect_message = false;
                continue;
            }
        }

        expanded.push(trimmed.to_string());
    }

    if details.reason.is_none() {
        details.reason = message
            .map(str::to_string)
            .or_else(|| expanded.first().cloned());
    }

    if !expanded.is_empty() || !backtrace.is_empty() {
        details.expanded.push(FailureExpanded {
            expanded,
            backtrace,
        });
    }

    details
}

/// Incremental parser: feed it lines as they arrive.
///
/// Tests are stamped with the instant their events are processed, so timings
/// are only meaningful when the stream is consumed live. The runner's own
/// `exec_time` is preferred for durations whenever it is reported.
pub struct StreamingParser {
    started_at: Instant,
    in_flight: HashMap<String, TestData>,
    completed: Vec<TestData>,
    suites: Vec<SuiteSummary>,
    open_suites: usize,
    line_number: usize,
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingParser {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(started_at: Instant) -> Self {
        Self {
            started_at,
            in_flight: HashMap::new(),
            completed: Vec::new(),
            suites: Vec::new(),
            open_suites: 0,
            line_number: 0,
        }
    }

    /// Returns the decoded event, or `None` for lines that are not libtest
    /// JSON at all.
    pub fn process_line(&mut self, line: &str) -> Result<Option<LibtestEvent>> {
        self.line_number += 1;
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Ok(None);
        }

        let event: LibtestEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(e) => {
                // A JSON object that is not a libtest event; other tools share the pipe.
                tracing::debug!("Skipping line {}: {}", self.line_number, e);
                return Ok(None);
            }
        };

        self.apply(&event, Instant::now())?;
        Ok(Some(event))
    }

    fn apply(&mut self, event: &LibtestEvent, now: Instant) -> Result<()> {
        match event {
            LibtestEvent::Suite(suite) => self.apply_suite(suite),
            LibtestEvent::Test(test) => self.apply_test(test, now)?,
            LibtestEvent::Other => {}
        }
        Ok(())
    }

    fn apply_suite(&mut self, suite: &SuiteEvent) {
        match suite.event.as_str() {
            "started" => {
                tracing::debug!("Suite started with {} tests", suite.test_count.unwrap_or(0));
                self.open_suites += 1;
            }
            "ok" | "failed" => {
                self.open_suites = self.open_suites.saturating_sub(1);
                self.suites.push(SuiteSummary {
                    passed: suite.passed.unwrap_or(0),
                    failed: suite.failed.unwrap_or(0),
                    ignored: suite.ignored.unwrap_or(0),
                    measured: suite.measured.unwrap_or(0),
                    filtered_out: suite.filtered_out.unwrap_or(0),
                    ok: suite.event == "ok",
                });
            }
            other => tracing::debug!("Ignoring suite event '{}'", other),
        }
    }

    fn apply_test(&mut self, event: &TestEvent, now: Instant) -> Result<()> {
        if event.event == "started" {
            let test = new_test(&event.name, now);
            if self.in_flight.insert(event.name.clone(), test).is_some() {
                tracing::warn!("Test '{}' started twice; keeping the latest", event.name);
            }
            return Ok(());
        }

        // Only a warning that the test has run past 60s; its result follows.
        if event.event == "timeout" {
            tracing::warn!("Test '{}' has been running for over 60 seconds", event.name);
            if !self.in_flight.contains_key(&event.name) {
                self.in_flight.insert(event.name.clone(), new_test(&event.name, now));
            }
            return Ok(());
        }

        let mut test = self
            .in_flight
            .remove(&event.name)
            .unwrap_or_else(|| new_test(&event.name, now));

        match event.event.as_str() {
            "ok" => test.passed(),
            "ignored" => test.skipped(),
            "failed" => {
                // `reason` carries "time limit exceeded" under --ensure-time.
                let message = event.message.as_deref().or(event.reason.as_deref());
                let details = parse_failure(event.stdout.as_deref(), message);
                test.location = details.location;
                test.file_name = details.file_name;
                test.failed(details.reason, details.expanded);
            }
            other => {
                return Err(CollectorError::ParseError {
                    line: self.line_number,
                    message: format!("unknown test event '{}' for {}", other, event.name),
                });
            }
        }

        let reported = event
            .exec_time
            .and_then(|t| Duration::try_from_secs_f64(t).ok());
        test.finish_at(now, reported);
        self.completed.push(test);
        Ok(())
    }

    pub fn completed(&self) -> &[TestData] {
        &self.completed
    }

    pub fn suites(&self) -> &[SuiteSummary] {
        &self.suites
    }

    /// Tests still running at end of input are kept, unfinished. A stream
    /// that ends inside a suite or a test means the test binary aborted.
    pub fn finish(mut self) -> CollectedRun {
        let aborted = self.open_suites > 0 || !self.in_flight.is_empty();
        if self.open_suites > 0 {
            tracing::warn!(
                "{} test suites ended without a result; the test binary likely crashed",
                self.open_suites
            );
        }
        if !self.in_flight.is_empty() {
            tracing::warn!(
                "{} tests never reported a result: {:?}",
                self.in_flight.len(),
                self.in_flight.keys().collect::<Vec<_>>()
            );
        }

        let mut unfinished: Vec<TestData> = self.in_flight.into_values().collect();
        unfinished.sort_by(|a, b| (&a.scope, &a.name).cmp(&(&b.scope, &b.name)));
        self.completed.extend(unfinished);

        CollectedRun {
            started_at: self.started_at,
            tests: self.completed,
            suites: self.suites,
            aborted,
        }
    }
}

pub fn parse_run_output(output: &str) -> Result<CollectedRun> {
    let mut parser = StreamingParser::new();
    for line in output.lines() {
        parser.process_line(line)?;
    }
    Ok(parser.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TestResult;

    const RUN: &str = r#"
   Compiling widgets v0.1.0 (/src/widgets)
    Finished `test` profile [unoptimized + debuginfo] target(s) in 0.52s
     Running unittests src/lib.rs (target/debug/deps/widgets-1234)
{ "type": "suite", "event": "started", "test_count": 3 }
{ "type": "test", "event": "started", "name": "tests::adds" }
{ "type": "test", "event": "started", "name": "tests::subtracts" }
{ "type": "test", "event": "started", "name": "tests::slow" }
{ "type": "test", "name": "tests::adds", "event": "ok", "exec_time": 0.001 }
{ "type": "test", "name": "tests::slow", "event": "ignored" }
{ "type": "test", "name": "tests::subtracts", "event": "failed", "exec_time": 0.25, "stdout": "thread 'tests::subtracts' panicked at src/lib.rs:21:9:\nassertion `left == right` failed\n  left: 1\n right: 2\nnote: run with `RUST_BACKTRACE=1` environment variable to display a backtrace\n" }
{ "type": "suite", "event": "failed", "passed": 1, "failed": 1, "ignored": 1, "measured": 0, "filtered_out": 0, "exec_time": 0.26 }
"#;

    #[test]
    fn test_parse_run_output() {
        let run = parse_run_output(RUN).unwrap();

        assert_eq!(run.tests.len(), 3);
        assert!(run.tests.iter().all(|t| t.is_finished()));
        assert_eq!(run.suites.len(), 1);
        assert!(!run.suites[0].ok);
        assert_eq!(run.suites[0].failed, 1);
        assert!(run.has_failures());

        let adds = &run.tests[0];
        assert_eq!(adds.scope, "tests");
        assert_eq!(adds.name, "adds");
        assert_eq!(adds.result, Some(TestResult::Passed));
        let duration = adds.history.duration.unwrap().as_secs_f64();
        assert!((duration - 0.001).abs() < 1e-6);

        assert_eq!(run.tests[1].name, "slow");
        assert_eq!(run.tests[1].result, Some(TestResult::Skipped));

        let failed = &run.tests[2];
        assert_eq!(failed.location.as_deref(), Some("src/lib.rs:21"));
        assert_eq!(failed.file_name.as_deref(), Some("src/lib.rs"));
        match &failed.result {
            Some(TestResult::Failed {
                failure_reason,
                failure_expanded,
            }) => {
                assert_eq!(
                    failure_reason.as_deref(),
                    Some("assertion `left == right` failed")
                );
                assert_eq!(failure_expanded[0].expanded, vec!["  left: 1", " right: 2"]);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_split_test_name() {
        assert_eq!(
            split_test_name("a::b::c"),
            ("a::b".to_string(), "c".to_string())
        );
        assert_eq!(split_test_name("top"), (String::new(), "top".to_string()));
    }

    #[test]
    fn test_legacy_panic_format() {
        let details = parse_failure(
            Some("thread 'main' panicked at 'boom', tests/it.rs:5:3\n"),
            None,
        );
        assert_eq!(details.reason.as_deref(), Some("boom"));
        assert_eq!(details.location.as_deref(), Some("tests/it.rs:5"));
        assert!(details.expanded.is_empty());
    }

    #[test]
    fn test_failure_with_backtrace() {
        let stdout = "captured print\nthread 't' panicked at src/a.rs:1:1:\nexplode\nstack backtrace:\n   0: rust_begin_unwind\n   1: a::t\n";
        let details = parse_failure(Some(stdout), None);
        assert_eq!(details.reason.as_deref(), Some("explode"));
        assert_eq!(details.expanded[0].expanded, vec!["captured print"]);
        assert_eq!(
            details.expanded[0].backtrace,
            vec!["0: rust_begin_unwind", "1: a::t"]
        );
    }

    #[test]
    fn test_failure_without_output_uses_message() {
        let details = parse_failure(None, Some("test did not panic as expected"));
        assert_eq!(
            details.reason.as_deref(),
            Some("test did not panic as expected")
        );
        assert!(details.expanded.is_empty());
    }

    #[test]
    fn test_result_without_start_event() {
        let run = parse_run_output(r#"{ "type": "test", "name": "lone", "event": "ok" }"#).unwrap();
        assert_eq!(run.tests.len(), 1);
        assert!(run.tests[0].is_finished());
        assert!(!run.has_failures());
    }

    #[test]
    fn test_slow_test_warning_is_not_a_result() {
        let run = parse_run_output(
            r#"{ "type": "suite", "event": "started", "test_count": 1 }
{ "type": "test", "event": "started", "name": "m::slow" }
{ "type": "test", "event": "timeout", "name": "m::slow" }
{ "type": "test", "name": "m::slow", "event": "ok", "exec_time": 75.0 }
{ "type": "suite", "event": "ok", "passed": 1, "failed": 0, "ignored": 0, "measured": 0, "filtered_out": 0 }"#,
        )
        .unwrap();

        assert_eq!(run.tests.len(), 1);
        assert_eq!(run.tests[0].result, Some(TestResult::Passed));
        assert_eq!(run.tests[0].history.duration, Some(Duration::from_secs(75)));
        assert!(!run.has_failures());
    }

    #[test]
    fn test_time_limit_reason_becomes_failure_reason() {
        let run = parse_run_output(
            r#"{ "type": "test", "name": "m::slow", "event": "failed", "reason": "time limit exceeded" }"#,
        )
        .unwrap();
        match &run.tests[0].result {
            Some(TestResult::Failed { failure_reason, .. }) => {
                assert_eq!(failure_reason.as_deref(), Some("time limit exceeded"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_unfinished_tests_are_kept() {
        let run = parse_run_output(r#"{ "type": "test", "event": "started", "name": "m::hangs" }"#)
            .unwrap();
        assert_eq!(run.tests.len(), 1);
        assert!(!run.tests[0].is_finished());
    }

    #[test]
    fn test_aborted_binary_counts_as_failure() {
        let run = parse_run_output(
            r#"{ "type": "suite", "event": "started", "test_count": 2 }
{ "type": "test", "event": "started", "name": "m::overflows" }"#,
        )
        .unwrap();
        assert!(run.aborted);
        assert!(run.has_failures());

        let run = parse_run_output(
            r#"{ "type": "suite", "event": "started", "test_count": 1 }
{ "type": "test", "name": "m::exits", "event": "ok" }"#,
        )
        .unwrap();
        assert!(run.tests.iter().all(|t| t.is_finished()));
        assert!(run.has_failures());
    }

    #[test]
    fn test_huge_exec_time_falls_back_to_wall_clock() {
        let run = parse_run_output(
            r#"{ "type": "test", "name": "m::x", "event": "ok", "exec_time": 1e30 }
{ "type": "test", "name": "m::y", "event": "ok", "exec_time": -1.0 }"#,
        )
        .unwrap();
        assert_eq!(run.tests.len(), 2);
        assert!(run.tests.iter().all(|t| t.history.duration.unwrap() < Duration::from_secs(60)));
    }

    #[test]
    fn test_nextest_binary_id_becomes_tag() {
        let run = parse_run_output(
            r#"{ "type": "test", "event": "started", "name": "widgets::bin/cli$args::tests::parses" }
{ "type": "test", "name": "widgets::bin/cli$args::tests::parses", "event": "ok" }"#,
        )
        .unwrap();
        assert_eq!(run.tests.len(), 1);
        let test = &run.tests[0];
        assert_eq!(test.scope, "args::tests");
        assert_eq!(test.name, "parses");
        assert_eq!(test.tags[BINARY_TAG], "widgets::bin/cli");

        assert_eq!(split_binary_id("plain::name"), (None, "plain::name"));
    }

    #[test]
    fn test_bench_and_foreign_json_ignored() {
        let mut parser = StreamingParser::new();
        let bench = r#"{ "type": "bench", "name": "b", "median": 10, "deviation": 1 }"#;
        assert_eq!(parser.process_line(bench).unwrap(), Some(LibtestEvent::Other));
        assert_eq!(parser.process_line(r#"{"reason":"compiler-artifact"}"#).unwrap(), None);
        assert_eq!(parser.process_line("not json").unwrap(), None);
        assert!(parser.completed().is_empty());
    }

    #[test]
    fn test_unknown_test_event_is_an_error() {
        let mut parser = StreamingParser::new();
        let err = parser
            .process_line(r#"{ "type": "test", "name": "x", "event": "exploded" }"#)
            .unwrap_err();
        assert!(matches!(err, CollectorError::ParseError { line: 1, .. }));
    }
}
