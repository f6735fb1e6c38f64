use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtfError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("RPC error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("Timed out while {operation}")]
    TimeoutError { operation: String },

    #[error("Template error: {message}")]
    TemplateError { message: String },

    #[error("Destination file already exists: {path}")]
    TemplateExistsError { path: String },

    #[error("Process error: {message}")]
    ProcessError { message: String },

    #[error("Processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Configuration,
    Protocol,
    FileSystem,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl CtfError {
    pub fn protocol(message: impl Into<String>) -> Self {
        CtfError::ProtocolError {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        CtfError::ProcessingError {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        CtfError::TimeoutError {
            operation: operation.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CtfError::HttpError(_) | CtfError::TimeoutError { .. } | CtfError::RpcError { .. } => {
                ErrorCategory::Network
            }
            CtfError::UrlError(_)
            | CtfError::ConfigValidationError { .. }
            | CtfError::InvalidConfigValueError { .. }
            | CtfError::MissingConfigError { .. }
            | CtfError::AuthenticationError { .. } => ErrorCategory::Configuration,
            CtfError::ProtocolError { .. } | CtfError::SerializationError(_) => {
                ErrorCategory::Protocol
            }
            CtfError::IoError(_)
            | CtfError::TemplateError { .. }
            | CtfError::TemplateExistsError { .. } => ErrorCategory::FileSystem,
            CtfError::ProcessError { .. } | CtfError::ProcessingError { .. } => {
                ErrorCategory::External
            }
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CtfError::TemplateExistsError { .. } => ErrorSeverity::Low,
            CtfError::HttpError(_) | CtfError::TimeoutError { .. } | CtfError::RpcError { .. } => {
                ErrorSeverity::Medium
            }
            CtfError::IoError(_) | CtfError::ProcessError { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// 錯誤可以重試嗎（網路類錯誤）
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Network
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "Check that the target is reachable and try again",
            ErrorCategory::Configuration => "Fix the configuration value and rerun the command",
            ErrorCategory::Protocol => "The peer sent unexpected data; inspect it with --verbose",
            ErrorCategory::FileSystem => "Check paths and permissions of the destination",
            ErrorCategory::External => "Make sure the external tool is installed and on PATH",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            CtfError::HttpError(e) if e.is_connect() => {
                "Could not connect to the target".to_string()
            }
            CtfError::HttpError(e) if e.is_timeout() => "The target took too long to answer".to_string(),
            CtfError::TemplateExistsError { path } => {
                format!("Skipped {} because it already exists", path)
            }
            CtfError::MissingConfigError { field } => {
                format!("Missing configuration value: {}", field)
            }
            CtfError::AuthenticationError { .. } => {
                "The platform rejected the username or password".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CtfError>;
