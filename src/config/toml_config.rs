use crate::utils::error::Result;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Optional `collector.toml`:
///
/// ```toml
/// [collector]
/// api_url = "https://analytics-api.buildkite.com/v1"
/// token = "${BUILDKITE_ANALYTICS_TOKEN}"
/// batch_size = 100
/// json = "target/test-analytics.json"
///
/// [collector.tags]
/// team = "storage"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub collector: CollectorSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorSection {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub batch_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub json: Option<String>,
    pub merge_json: Option<bool>,
    pub upload: Option<bool>,
    pub echo: Option<bool>,
    pub tags: Option<BTreeMap<String, String>>,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P, env: &HashMap<String, String>) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content, env)
    }

    pub fn from_toml_str(content: &str, env: &HashMap<String, String>) -> Result<Self> {
        let processed = substitute_env_vars(content, env);
        Ok(toml::from_str(&processed)?)
    }
}

/// Replaces `${VAR}` with the variable's value. Unknown variables are left
/// as written.
fn substitute_env_vars(content: &str, env: &HashMap<String, String>) -> String {
    static VAR: std::sync::LazyLock<Regex> =
        std::sync::LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern"));

    VAR.replace_all(content, |caps: &Captures| {
        let var_name = &caps[1];
        env.get(var_name)
            .cloned()
            .unwrap_or_else(|| format!("${{{}}}", var_name))
    })
    .into_owned()
}
