pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;
pub use config::{cli::LocalStorage, CollectorConfig, ConfigOverrides};

pub use crate::core::{
    api::{ApiClient, UploadResponse},
    collector::CollectorPipeline,
    engine::{CollectorEngine, RunReport},
    libtest::{parse_run_output, StreamingParser},
    run_env::RunEnvBuilder,
};
pub use utils::error::{CollectorError, Result};
