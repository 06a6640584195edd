use crate::core::api::ApiClient;
use crate::core::json_output::{JsonReportWriter, LOCK_TIMEOUT};
use crate::core::libtest::StreamingParser;
use crate::core::run_env::RunEnvBuilder;
use crate::core::{CollectedRun, ConfigProvider, Payload, Pipeline, Storage, UploadSummary};
use crate::utils::error::{CollectorError, Result};
use crate::utils::validation::usable_token;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Reads a libtest event stream, builds the payload and reports it.
pub struct CollectorPipeline<S: Storage, C: ConfigProvider> {
    storage: S,
    config: C,
    env: HashMap<String, String>,
    lock_timeout: Duration,
}

impl<S: Storage, C: ConfigProvider> CollectorPipeline<S, C> {
    pub fn new(storage: S, config: C, env: HashMap<String, String>) -> Self {
        Self {
            storage,
            config,
            env,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// How long `--merge-json` waits for another shard's lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Parses every line of `reader`, echoing it to stdout when enabled.
    /// Malformed events are logged and skipped so the echo never stops.
    /// Lines are echoed byte for byte; invalid UTF-8 is decoded lossily.
    pub async fn collect_lines<R>(&self, mut reader: R) -> Result<CollectedRun>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut parser = StreamingParser::new();
        let mut stdout = tokio::io::stdout();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            if self.config.echo() {
                stdout.write_all(&buf).await?;
                if !buf.ends_with(b"\n") {
                    stdout.write_all(b"\n").await?;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            match parser.process_line(line) {
                Ok(_) => {}
                Err(e @ CollectorError::ParseError { .. }) => tracing::warn!("{}", e),
                Err(e) => return Err(e),
            }
        }

        if self.config.echo() {
            stdout.flush().await?;
        }

        Ok(parser.finish())
    }
}

#[async_trait::async_trait]
impl<S: Storage, C: ConfigProvider> Pipeline for CollectorPipeline<S, C> {
    async fn extract(&self) -> Result<CollectedRun> {
        match self.config.input_path() {
            Some(path) => {
                tracing::debug!("Reading test events from {}", path);
                let data = self.storage.read_file(path).await?;
                self.collect_lines(&data[..]).await
            }
            None => {
                tracing::debug!("Reading test events from stdin");
                self.collect_lines(BufReader::new(tokio::io::stdin())).await
            }
        }
    }

    async fn transform(&self, run: CollectedRun) -> Result<Payload> {
        let run_env = RunEnvBuilder::new(&self.env).build();
        tracing::debug!(
            "Run env: ci={:?} key={:?}",
            run_env.ci.as_deref(),
            run_env.key.as_deref()
        );

        let mut payload = Payload::init(run_env).started_at_instant(run.started_at);
        for mut test in run.tests {
            for (key, value) in self.config.tags() {
                test.tag_execution(key.as_str(), value.as_str());
            }
            payload.push_test_data(test);
        }

        Ok(payload.finished())
    }

    async fn load(&self, payload: Payload) -> Result<UploadSummary> {
        let finished = payload.finished_count();
        let mut summary = UploadSummary {
            tests_reported: finished,
            tests_unfinished: payload.data.len() - finished,
            ..UploadSummary::default()
        };

        // A report that cannot be written is recorded, never fatal: the
        // exit status belongs to the test run.
        if let Some(path) = self.config.json_output() {
            let writer = JsonReportWriter::new(&self.storage).with_lock_timeout(self.lock_timeout);
            match writer.write(path, &payload, self.config.merge_json()).await {
                Ok(records) => {
                    tracing::debug!("{} now holds {} test records", path, records);
                    summary.json_written = Some(path.to_string());
                }
                Err(e) => {
                    tracing::error!("Could not write {}: {}", path, e);
                    summary.json_error = Some(e.to_string());
                }
            }
        }

        if !self.config.upload_enabled() {
            tracing::info!("Upload disabled; {} tests collected", finished);
            return Ok(summary);
        }

        let has_token = usable_token(self.config.token()).is_some();
        let client = ApiClient::from_config(&self.config)?;
        let outcomes = client.submit(payload, self.config.batch_size()).await;

        if has_token {
            summary.batches_sent = outcomes.len();
            summary.batches_accepted = outcomes.iter().filter(|o| o.is_some()).count();
            summary.batches_failed = summary.batches_sent - summary.batches_accepted;
        }

        if let Some(run_url) = outcomes.iter().flatten().find_map(|r| r.run_url()) {
            tracing::info!("Test results: {}", run_url);
        }

        Ok(summary)
    }
}
