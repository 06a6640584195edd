pub mod cli;
pub mod toml_config;

use crate::core::api::{DEFAULT_API_URL, DEFAULT_TIMEOUT};
use crate::core::ConfigProvider;
use crate::domain::model::DEFAULT_BATCH_SIZE;
use crate::utils::error::{CollectorError, Result};
use crate::utils::validation::{
    parse_tag, usable_token, validate_path, validate_range, validate_url, Validate,
};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use toml_config::FileConfig;

pub const TOKEN_ENV: &str = "BUILDKITE_ANALYTICS_TOKEN";
pub const API_URL_ENV: &str = "BUILDKITE_ANALYTICS_API_URL";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Values given explicitly on the command line. They win over the
/// environment and the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub input: Option<String>,
    pub json: Option<String>,
    pub merge_json: bool,
    pub tags: Vec<String>,
    pub batch_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub api_url: Option<String>,
    pub no_upload: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub batch_size: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub input_path: Option<String>,
    pub json_output: Option<String>,
    pub merge_json: bool,
    pub tags: Vec<(String, String)>,
    pub upload_enabled: bool,
    pub echo: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            input_path: None,
            json_output: None,
            merge_json: false,
            tags: Vec::new(),
            upload_enabled: true,
            echo: true,
        }
    }
}

impl CollectorConfig {
    /// Layers defaults < config file < environment < command line.
    pub fn resolve(
        overrides: &ConfigOverrides,
        env: &HashMap<String, String>,
        file: Option<&FileConfig>,
    ) -> Result<Self> {
        let section = file.map(|f| f.collector.clone()).unwrap_or_default();
        let defaults = Self::default();

        let env_value = |key: &str| {
            env.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_url = overrides
            .api_url
            .clone()
            .or_else(|| env_value(API_URL_ENV))
            .or(section.api_url)
            .unwrap_or(defaults.api_url);

        let token = usable_token(env.get(TOKEN_ENV).map(String::as_str))
            .or_else(|| usable_token(section.token.as_deref()))
            .map(str::to_string);

        let mut tags: BTreeMap<String, String> = section.tags.unwrap_or_default();
        for raw in &overrides.tags {
            let (key, value) = parse_tag(raw)?;
            tags.insert(key, value);
        }

        Ok(Self {
            api_url,
            token,
            batch_size: overrides
                .batch_size
                .or(section.batch_size)
                .unwrap_or(defaults.batch_size),
            request_timeout: overrides
                .timeout_secs
                .or(section.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_retries: overrides
                .max_retries
                .or(section.max_retries)
                .unwrap_or(defaults.max_retries),
            retry_delay: overrides
                .retry_delay_ms
                .or(section.retry_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            input_path: overrides.input.clone(),
            json_output: overrides.json.clone().or(section.json),
            merge_json: overrides.merge_json || section.merge_json.unwrap_or(false),
            tags: tags.into_iter().collect(),
            upload_enabled: !overrides.no_upload && section.upload.unwrap_or(true),
            echo: !overrides.quiet && section.echo.unwrap_or(true),
        })
    }
}

impl Validate for CollectorConfig {
    fn validate(&self) -> Result<()> {
        validate_url("api_url", &self.api_url)?;
        validate_range("batch_size", self.batch_size, 1, 5000)?;
        validate_range("timeout_secs", self.request_timeout.as_secs(), 1, 600)?;
        validate_range("max_retries", self.max_retries, 0, 10)?;

        if let Some(input) = &self.input_path {
            validate_path("input", input)?;
        }
        if let Some(json) = &self.json_output {
            validate_path("json", json)?;
        }
        if self.merge_json && self.json_output.is_none() {
            return Err(CollectorError::ConfigError {
                message: "--merge-json needs --json <path>".to_string(),
            });
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }
}

impl ConfigProvider for CollectorConfig {
    fn api_url(&self) -> &str {
        &self.api_url
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn input_path(&self) -> Option<&str> {
        self.input_path.as_deref()
    }

    fn json_output(&self) -> Option<&str> {
        self.json_output.as_deref()
    }

    fn merge_json(&self) -> bool {
        self.merge_json
    }

    fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    fn upload_enabled(&self) -> bool {
        self.upload_enabled
    }

    fn echo(&self) -> bool {
        self.echo
    }
}
