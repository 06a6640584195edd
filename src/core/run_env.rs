//! Detection of the CI build a test run belongs to.

use crate::domain::model::RunEnv;
use std::collections::HashMap;
use uuid::Uuid;

pub const COLLECTOR_NAME: &str = "rust-buildkite-test-collector";
pub const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct RunEnvBuilder<'a> {
    env: &'a HashMap<String, String>,
}

impl<'a> RunEnvBuilder<'a> {
    pub fn new(env: &'a HashMap<String, String>) -> Self {
        Self { env }
    }

    pub fn build(&self) -> RunEnv {
        let detected = self
            .buildkite()
            .or_else(|| self.github_actions())
            .or_else(|| self.circle_ci())
            .unwrap_or_else(|| self.generic());

        self.apply_overrides(detected)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.env
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn base(&self, ci: &str) -> RunEnv {
        RunEnv {
            ci: Some(ci.to_string()),
            collector: COLLECTOR_NAME.to_string(),
            version: COLLECTOR_VERSION.to_string(),
            ..RunEnv::default()
        }
    }

    fn buildkite(&self) -> Option<RunEnv> {
        let build_id = self.get("BUILDKITE_BUILD_ID")?;

        Some(RunEnv {
            key: Some(build_id),
            url: self.get("BUILDKITE_BUILD_URL"),
            branch: self.get("BUILDKITE_BRANCH"),
            commit_sha: self.get("BUILDKITE_COMMIT"),
            number: self.get("BUILDKITE_BUILD_NUMBER"),
            job_id: self.get("BUILDKITE_JOB_ID"),
            message: self.get("BUILDKITE_MESSAGE"),
            ..self.base("buildkite")
        })
    }

    fn github_actions(&self) -> Option<RunEnv> {
        let run_number = self.get("GITHUB_RUN_NUMBER")?;
        let action = self.get("GITHUB_ACTION").unwrap_or_default();
        let attempt = self.get("GITHUB_RUN_ATTEMPT").unwrap_or_else(|| "1".to_string());

        let url = match (self.get("GITHUB_REPOSITORY"), self.get("GITHUB_RUN_ID")) {
            (Some(repo), Some(run_id)) => Some(format!(
                "https://github.com/{}/actions/runs/{}",
                repo, run_id
            )),
            _ => None,
        };

        Some(RunEnv {
            key: Some(format!("{}-{}-{}", action, run_number, attempt)),
            url,
            branch: self.get("GITHUB_REF_NAME"),
            commit_sha: self.get("GITHUB_SHA"),
            number: Some(run_number),
            ..self.base("github_actions")
        })
    }

    fn circle_ci(&self) -> Option<RunEnv> {
        let build_num = self.get("CIRCLE_BUILD_NUM")?;
        let workflow_id = self.get("CIRCLE_WORKFLOW_ID").unwrap_or_default();

        Some(RunEnv {
            key: Some(format!("{}-{}", workflow_id, build_num)),
            url: self.get("CIRCLE_BUILD_URL"),
            branch: self.get("CIRCLE_BRANCH"),
            commit_sha: self.get("CIRCLE_SHA1"),
            number: Some(build_num),
            ..self.base("circleci")
        })
    }

    fn generic(&self) -> RunEnv {
        let ci = if self.get("CI").is_some() {
            "generic"
        } else {
            "local"
        };

        RunEnv {
            key: Some(Uuid::new_v4().to_string()),
            ..self.base(ci)
        }
    }

    fn apply_overrides(&self, mut env: RunEnv) -> RunEnv {
        let overrides: [(&str, &mut Option<String>); 7] = [
            ("BUILDKITE_ANALYTICS_KEY", &mut env.key),
            ("BUILDKITE_ANALYTICS_URL", &mut env.url),
            ("BUILDKITE_ANALYTICS_BRANCH", &mut env.branch),
            ("BUILDKITE_ANALYTICS_SHA", &mut env.commit_sha),
            ("BUILDKITE_ANALYTICS_NUMBER", &mut env.number),
            ("BUILDKITE_ANALYTICS_JOB_ID", &mut env.job_id),
            ("BUILDKITE_ANALYTICS_MESSAGE", &mut env.message),
        ];

        for (key, slot) in overrides {
            if let Some(value) = self.get(key) {
                *slot = Some(value);
            }
        }

        env
    }
}
