use crate::core::{Pipeline, UploadSummary};
use crate::utils::error::Result;

/// Outcome of one collector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub tests_collected: usize,
    pub tests_failed: bool,
    pub upload: UploadSummary,
}

impl RunReport {
    /// The test run's status, not the upload's: an analytics outage must
    /// not turn a green build red.
    pub fn exit_code(&self) -> i32 {
        if self.tests_failed {
            1
        } else {
            0
        }
    }
}

pub struct CollectorEngine<P: Pipeline> {
    pipeline: P,
}

impl<P: Pipeline> CollectorEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }

    pub async fn run(&self) -> Result<RunReport> {
        tracing::debug!("Collecting test results...");
        let run = self.pipeline.extract().await?;
        let tests_collected = run.tests.len();
        let tests_failed = run.has_failures();
        tracing::info!(
            "Collected {} tests from {} suites{}",
            tests_collected,
            run.suites.len(),
            if tests_failed { " (with failures)" } else { "" }
        );

        let payload = self.pipeline.transform(run).await?;
        let upload = self.pipeline.load(payload).await?;

        if upload.batches_failed > 0 {
            tracing::warn!(
                "{} of {} upload batches failed",
                upload.batches_failed,
                upload.batches_sent
            );
        } else if upload.batches_sent > 0 {
            tracing::info!(
                "Uploaded {} tests in {} batches",
                upload.tests_reported,
                upload.batches_sent
            );
        }
        if let Some(error) = &upload.json_error {
            tracing::warn!("JSON report was not written: {}", error);
        }
        if upload.tests_unfinished > 0 {
            tracing::warn!("{} tests never finished and were skipped", upload.tests_unfinished);
        }

        Ok(RunReport {
            tests_collected,
            tests_failed,
            upload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{CollectedRun, Payload, RunEnv, SuiteSummary};
    use crate::utils::error::CollectorError;
    use std::time::Instant;

    #[derive(Default)]
    struct StubPipeline {
        suites_ok: bool,
        aborted: bool,
        fail_extract: bool,
        json_error: bool,
    }

    #[async_trait::async_trait]
    impl Pipeline for StubPipeline {
        async fn extract(&self) -> Result<CollectedRun> {
            if self.fail_extract {
                return Err(CollectorError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "events.json",
                )));
            }
            Ok(CollectedRun {
                started_at: Instant::now(),
                tests: Vec::new(),
                suites: vec![SuiteSummary {
                    ok: self.suites_ok,
                    ..SuiteSummary::default()
                }],
                aborted: self.aborted,
            })
        }

        async fn transform(&self, run: CollectedRun) -> Result<Payload> {
            Ok(Payload::init(RunEnv::default()).started_at_instant(run.started_at))
        }

        async fn load(&self, _payload: Payload) -> Result<UploadSummary> {
            Ok(UploadSummary {
                json_error: self
                    .json_error
                    .then(|| "lock on report.json.lock is held".to_string()),
                ..UploadSummary::default()
            })
        }
    }

    #[tokio::test]
    async fn test_exit_code_follows_test_status() {
        let passing = CollectorEngine::new(StubPipeline {
            suites_ok: true,
            ..StubPipeline::default()
        });
        assert_eq!(passing.run().await.unwrap().exit_code(), 0);

        let failing = CollectorEngine::new(StubPipeline::default());
        let report = failing.run().await.unwrap();
        assert!(report.tests_failed);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_aborted_run_exits_nonzero() {
        let engine = CollectorEngine::new(StubPipeline {
            suites_ok: true,
            aborted: true,
            ..StubPipeline::default()
        });
        assert_eq!(engine.run().await.unwrap().exit_code(), 1);
    }

    #[tokio::test]
    async fn test_json_report_failure_keeps_test_status() {
        let engine = CollectorEngine::new(StubPipeline {
            suites_ok: true,
            json_error: true,
            ..StubPipeline::default()
        });
        let report = engine.run().await.unwrap();
        assert!(report.upload.json_error.is_some());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_extract_errors_propagate() {
        let engine = CollectorEngine::new(StubPipeline {
            fail_extract: true,
            ..StubPipeline::default()
        });
        assert!(matches!(
            engine.run().await,
            Err(CollectorError::IoError(_))
        ));
    }
}
