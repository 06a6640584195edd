//! Writes collected test records to a local JSON file.
//!
//! With merging enabled, several collector processes (parallel shards of one
//! build) can append to the same report. Access is serialised through a
//! sibling `<file>.lock` created exclusively.

use crate::core::Storage;
use crate::domain::model::Payload;
use crate::utils::error::{CollectorError, Result};
use serde_json::Value;
use std::time::{Duration, Instant};

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(50);

pub struct JsonReportWriter<'a, S: Storage> {
    storage: &'a S,
    lock_timeout: Duration,
}

impl<'a, S: Storage> JsonReportWriter<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self {
            storage,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Writes the payload's finished tests to `path` and returns how many
    /// records the file now holds.
    pub async fn write(&self, path: &str, payload: &Payload, merge: bool) -> Result<usize> {
        let records = payload.data_json();

        if !merge {
            self.storage
                .write_file(path, &serde_json::to_vec_pretty(&records)?)
                .await?;
            return Ok(records.len());
        }

        let lock_path = format!("{}.lock", path);
        self.acquire(&lock_path).await?;
        let result = self.merge_into(path, records).await;
        if let Err(e) = self.storage.remove_file(&lock_path).await {
            tracing::warn!("Could not remove {}: {}", lock_path, e);
        }
        result
    }

    async fn merge_into(&self, path: &str, records: Vec<Value>) -> Result<usize> {
        let mut merged = if self.storage.exists(path).await {
            let existing = self.storage.read_file(path).await?;
            match serde_json::from_slice::<Value>(&existing)? {
                Value::Array(items) => items,
                _ => {
                    return Err(CollectorError::ConfigError {
                        message: format!("{} does not contain a JSON array", path),
                    })
                }
            }
        } else {
            Vec::new()
        };

        merged.extend(records);
        self.storage
            .write_file(path, &serde_json::to_vec_pretty(&merged)?)
            .await?;
        Ok(merged.len())
    }

    async fn acquire(&self, lock_path: &str) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            if self.storage.create_exclusive(lock_path).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CollectorError::LockError {
                    path: lock_path.to_string(),
                    message: format!("still held after {:?}", self.lock_timeout),
                });
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }
}
