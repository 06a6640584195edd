pub mod api;
pub mod collector;
pub mod engine;
pub mod json_output;
pub mod libtest;
pub mod run_env;

pub use crate::domain::model::{
    CollectedRun, FailureExpanded, Payload, RunEnv, SuiteSummary, TestData, TestResult,
    UploadSummary,
};
pub use crate::domain::ports::{ConfigProvider, Pipeline, Storage};
pub use crate::utils::error::Result;
