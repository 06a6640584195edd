use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Could not parse test event on line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Could not acquire lock {path}: {message}")]
    LockError { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Io,
    Data,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl CollectorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CollectorError::ApiError(_) => ErrorCategory::Network,
            CollectorError::IoError(_) | CollectorError::LockError { .. } => ErrorCategory::Io,
            CollectorError::SerializationError(_) | CollectorError::ParseError { .. } => {
                ErrorCategory::Data
            }
            CollectorError::TomlError(_)
            | CollectorError::ConfigError { .. }
            | CollectorError::InvalidConfigValueError { .. }
            | CollectorError::MissingConfigError { .. } => ErrorCategory::Configuration,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network => ErrorSeverity::Low,
            ErrorCategory::Data => ErrorSeverity::Medium,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::Io => ErrorSeverity::Critical,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            CollectorError::ApiError(_) => {
                "Could not reach the Test Engine API; results were not uploaded".to_string()
            }
            CollectorError::IoError(e) => format!("Could not read or write a file: {}", e),
            CollectorError::SerializationError(e) => format!("Invalid JSON: {}", e),
            CollectorError::TomlError(e) => format!("Invalid config file: {}", e),
            CollectorError::ConfigError { message } => message.clone(),
            CollectorError::InvalidConfigValueError { field, reason, .. } => {
                format!("Invalid {}: {}", field, reason)
            }
            CollectorError::MissingConfigError { field } => format!("{} is required", field),
            CollectorError::ParseError { line, message } => {
                format!("Malformed test output at line {}: {}", line, message)
            }
            CollectorError::LockError { path, .. } => {
                format!("Another process is holding {}", path)
            }
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => {
                "Check network access to the API and the BUILDKITE_ANALYTICS_API_URL setting"
            }
            ErrorCategory::Io => "Check file paths and permissions, and remove stale .lock files",
            ErrorCategory::Data => {
                "Run the tests with `-- -Z unstable-options --format json --report-time`"
            }
            ErrorCategory::Configuration => {
                "Check the command line flags, environment and config file"
            }
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
