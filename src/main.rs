use buildkite_test_collector::config::cli::LogFormat;
use buildkite_test_collector::config::toml_config::FileConfig;
use buildkite_test_collector::utils::{logger, validation::Validate};
use buildkite_test_collector::{
    CliArgs, CollectorConfig, CollectorEngine, CollectorError, CollectorPipeline, ConfigOverrides,
    LocalStorage,
};
use clap::Parser;
use std::collections::HashMap;

fn report_failure(e: &CollectorError) -> ! {
    tracing::error!(
        "❌ Collector failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 Suggestion: {}", e.recovery_suggestion());
    std::process::exit(e.exit_code());
}

fn load_config(args: &CliArgs, env: &HashMap<String, String>) -> Result<CollectorConfig, CollectorError> {
    let file = match &args.config {
        Some(path) => Some(FileConfig::from_file(path, env)?),
        None => None,
    };

    let config = CollectorConfig::resolve(&ConfigOverrides::from(args), env, file.as_ref())?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    match args.log_format {
        LogFormat::Compact => logger::init_cli_logger(args.verbose),
        LogFormat::Json => logger::init_json_logger(),
    }

    tracing::debug!("Starting buildkite-test-collector");
    if args.verbose {
        tracing::debug!("CLI args: {:?}", args);
    }

    let env: HashMap<String, String> = std::env::vars().collect();

    let config = match load_config(&args, &env) {
        Ok(config) => config,
        Err(e) => report_failure(&e),
    };

    let storage = LocalStorage::new(".".to_string());
    let pipeline = CollectorPipeline::new(storage, config, env);
    let engine = CollectorEngine::new(pipeline);

    match engine.run().await {
        Ok(report) => std::process::exit(report.exit_code()),
        Err(e) => report_failure(&e),
    }
}
