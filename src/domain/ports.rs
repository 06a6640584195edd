use crate::domain::model::{CollectedRun, Payload, UploadSummary};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn exists(&self, path: &str) -> impl std::future::Future<Output = bool> + Send;
    /// Creates `path` only if it does not exist yet. Returns `false` when it
    /// already exists.
    fn create_exclusive(&self, path: &str)
        -> impl std::future::Future<Output = Result<bool>> + Send;
    fn remove_file(&self, path: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn api_url(&self) -> &str;
    fn token(&self) -> Option<&str>;
    fn batch_size(&self) -> usize;
    fn request_timeout(&self) -> Duration;
    fn max_retries(&self) -> u32;
    fn retry_delay(&self) -> Duration;
    fn input_path(&self) -> Option<&str>;
    fn json_output(&self) -> Option<&str>;
    fn merge_json(&self) -> bool;
    fn tags(&self) -> &[(String, String)];
    fn upload_enabled(&self) -> bool;
    fn echo(&self) -> bool;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn extract(&self) -> Result<CollectedRun>;
    async fn transform(&self, run: CollectedRun) -> Result<Payload>;
    async fn load(&self, payload: Payload) -> Result<UploadSummary>;
}
