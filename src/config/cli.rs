use crate::core::Storage;
use crate::utils::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

#[cfg(feature = "cli")]
use crate::config::ConfigOverrides;
#[cfg(feature = "cli")]
use clap::{Parser, ValueEnum};

/// Files relative to `base_path` (the working directory for the CLI).
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: String) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.full_path(path)).await?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(full_path, data).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        fs::try_exists(self.full_path(path)).await.unwrap_or(false)
    }

    async fn create_exclusive(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        Ok(fs::remove_file(self.full_path(path)).await?)
    }
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "buildkite-test-collector")]
#[command(version)]
#[command(about = "Uploads Rust test results to Buildkite Test Engine")]
#[command(
    after_help = "Example:\n  cargo test -- -Z unstable-options --format json --report-time | buildkite-test-collector"
)]
pub struct CliArgs {
    /// Read libtest JSON from this file instead of stdin
    #[arg(long)]
    pub input: Option<String>,

    /// TOML config file with a [collector] table
    #[arg(long)]
    pub config: Option<String>,

    /// Also write the collected test records to this JSON file
    #[arg(long)]
    pub json: Option<String>,

    /// Append to the --json file instead of overwriting it
    #[arg(long)]
    pub merge_json: bool,

    /// Execution tag added to every test, as key=value (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Overrides BUILDKITE_ANALYTICS_API_URL
    #[arg(long)]
    pub api_url: Option<String>,

    /// Collect and write --json output without uploading
    #[arg(long)]
    pub no_upload: bool,

    /// Do not echo the test output to stdout
    #[arg(long, short)]
    pub quiet: bool,

    #[arg(long, short, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

#[cfg(feature = "cli")]
impl From<&CliArgs> for ConfigOverrides {
    fn from(args: &CliArgs) -> Self {
        Self {
            input: args.input.clone(),
            json: args.json.clone(),
            merge_json: args.merge_json,
            tags: args.tags.clone(),
            batch_size: args.batch_size,
            timeout_secs: args.timeout_secs,
            max_retries: args.max_retries,
            retry_delay_ms: args.retry_delay_ms,
            api_url: args.api_url.clone(),
            no_upload: args.no_upload,
            quiet: args.quiet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_exclusive_create() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_str().unwrap().to_string());

        assert!(storage.create_exclusive("out/report.json.lock").await.unwrap());
        assert!(!storage.create_exclusive("out/report.json.lock").await.unwrap());
        assert!(storage.exists("out/report.json.lock").await);

        storage.remove_file("out/report.json.lock").await.unwrap();
        assert!(!storage.exists("out/report.json.lock").await);
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_cli_args_to_overrides() {
        let args = CliArgs::parse_from([
            "buildkite-test-collector",
            "--tag",
            "team=storage",
            "--tag",
            "os=linux",
            "--batch-size",
            "25",
            "--no-upload",
            "-q",
        ]);
        let overrides = ConfigOverrides::from(&args);

        assert_eq!(overrides.tags, vec!["team=storage", "os=linux"]);
        assert_eq!(overrides.batch_size, Some(25));
        assert!(overrides.no_upload);
        assert!(overrides.quiet);
        assert_eq!(args.log_format, LogFormat::Compact);
    }
}
