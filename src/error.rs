use thiserror::Error;

use crate::executor::ExecutionError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Statement rejected: {0}")]
    ValidationRejected(String),

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Request timed out after {0} seconds")]
    RequestTimeout(u64),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Error::Warehouse(_) => -32000,
            Error::Config(_) => -32001,
            Error::TableNotFound(_) => -32002,
            Error::Execution(e) => e.kind.code(),
            Error::RequestTimeout(_) => -32005,
            Error::ValidationRejected(_) => -32010,
            Error::Translation(_) => -32011,
            Error::LanguageModel(_) => -32013,
            Error::Json(_) => -32700,
            Error::InvalidRequest(_) => -32600,
            Error::MethodNotFound(_) => -32601,
            Error::Internal(_) => -32603,
        }
    }

    /// Short machine-readable label used in failure reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Warehouse(_) => "warehouse_error",
            Error::LanguageModel(_) => "language_model_error",
            Error::Json(_) => "json_error",
            Error::TableNotFound(_) => "not_found",
            Error::ValidationRejected(_) => "validation_rejected",
            Error::Translation(_) => "translation_error",
            Error::Execution(e) => e.kind.as_str(),
            Error::InvalidRequest(_) => "invalid_request",
            Error::MethodNotFound(_) => "method_not_found",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
            Error::RequestTimeout(_) => "request_timeout",
        }
    }

    pub fn with_context(self, method: &str) -> Self {
        let context = format!("[method={}]", method);

        match self {
            Error::Warehouse(msg) => Error::Warehouse(format!("{} {}", context, msg)),
            Error::Internal(msg) => Error::Internal(format!("{} {}", context, msg)),
            Error::LanguageModel(msg) => Error::LanguageModel(format!("{} {}", context, msg)),
            Error::Config(msg) => Error::Config(format!("{} {}", context, msg)),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
