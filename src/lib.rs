pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod history;
pub mod llm;
pub mod mediator;
pub mod metrics;
pub mod rpc;
pub mod translator;
pub mod validation;

pub use catalog::SchemaCatalog;
pub use config::{Config, LogFormat};
pub use domain::{ColumnDef, QueryResult, Row, SampleRows, SchemaTable};
pub use error::{Error, Result};
pub use executor::{
    BigQueryWarehouse, ExecutionError, ExecutionErrorKind, ExecutionLimits, ExecutionResult,
    ExecutorMode, MemoryWarehouse, QueryExecutor, WarehouseBackend,
};
pub use history::{HistoryEntry, Outcome, QueryHistory, RequestInput};
pub use llm::{LanguageModel, ScriptedModel, UnavailableModel, VertexAiClient};
pub use mediator::{FailureReport, FailureStatus, QueryMediator, ToolRequest, ToolResponse};
pub use translator::{Translation, Translator};
pub use validation::{SqlStatement, SqlValidator, ValidatedStatement, ValidationResult};
