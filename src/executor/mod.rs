mod bigquery;
mod memory;

#[cfg(test)]
mod test_counting;

pub use self::bigquery::BigQueryWarehouse;
pub use self::memory::MemoryWarehouse;

#[cfg(test)]
pub use self::test_counting::CountingWarehouse;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::domain::{QueryResult, Row, SchemaTable};
use crate::error::{Error, Result};
use crate::metrics::{record_query_executed, record_query_timeout, record_query_truncated};
use crate::validation::ValidatedStatement;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutorMode {
    #[default]
    Mock,
    BigQuery,
}

/// The warehouse collaborator. Backends report their own failures as
/// [`Error::Warehouse`] carrying the engine's message unchanged.
#[async_trait]
pub trait WarehouseBackend: Send + Sync {
    fn mode(&self) -> ExecutorMode;

    async fn execute_query(&self, sql: &str, timeout: Duration) -> Result<QueryResult>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    /// `Ok(None)` when the table does not exist.
    async fn describe_table(&self, table_name: &str) -> Result<Option<SchemaTable>>;

    /// `Ok(None)` when the table does not exist.
    async fn sample_rows(&self, table_name: &str, limit: usize) -> Result<Option<Vec<Row>>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionErrorKind {
    Timeout,
    WarehouseError,
    RowLimitExceeded,
}

impl ExecutionErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            ExecutionErrorKind::WarehouseError => -32000,
            ExecutionErrorKind::Timeout => -32004,
            ExecutionErrorKind::RowLimitExceeded => -32012,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::WarehouseError => "warehouse_error",
            ExecutionErrorKind::RowLimitExceeded => "row_limit_exceeded",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "Query timed out",
            ExecutionErrorKind::WarehouseError => "Warehouse error",
            ExecutionErrorKind::RowLimitExceeded => "Row limit exceeded",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{}: {}", .kind.label(), .message)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            format!("query did not complete within {} ms", timeout.as_millis()),
        )
    }
}

impl From<Error> for ExecutionError {
    fn from(err: Error) -> Self {
        match err {
            Error::Execution(e) => e,
            Error::Warehouse(msg) => ExecutionError::new(ExecutionErrorKind::WarehouseError, msg),
            other => ExecutionError::new(ExecutionErrorKind::WarehouseError, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_rows: usize,
    pub timeout: Duration,
    /// Zero disables the byte bound.
    pub max_result_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for ExecutionLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_rows: limits.max_rows,
            timeout: Duration::from_millis(limits.timeout_ms),
            max_result_bytes: limits.max_result_bytes,
        }
    }
}

impl ExecutionLimits {
    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

pub struct QueryExecutor {
    backend: Arc<dyn WarehouseBackend>,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn WarehouseBackend>) -> Self {
        Self { backend }
    }

    pub fn mode(&self) -> ExecutorMode {
        self.backend.mode()
    }

    /// Runs an accepted statement. The backend call is abandoned once
    /// `limits.timeout` elapses; it is never retried.
    pub async fn execute(
        &self,
        statement: &ValidatedStatement,
        limits: &ExecutionLimits,
    ) -> std::result::Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        let call = self.backend.execute_query(statement.sql(), limits.timeout);

        let result = match tokio::time::timeout(limits.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = ExecutionError::from(e);
                if err.kind == ExecutionErrorKind::Timeout {
                    record_query_timeout();
                }
                debug!(kind = err.kind.as_str(), error = %err.message, "Warehouse execution failed");
                return Err(err);
            }
            Err(_) => {
                record_query_timeout();
                warn!(
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Query exceeded timeout, abandoning warehouse call"
                );
                return Err(ExecutionError::timeout(limits.timeout));
            }
        };

        let returned = result.rows.len();
        let total = result
            .total_rows
            .map(|t| t as usize)
            .unwrap_or(returned)
            .max(returned);

        let mut rows = result.into_rows();
        rows.truncate(limits.max_rows);
        let truncated = total > rows.len();

        if limits.max_result_bytes > 0 {
            let size = serde_json::to_vec(&rows)
                .map(|bytes| bytes.len())
                .map_err(|e| {
                    ExecutionError::new(ExecutionErrorKind::WarehouseError, e.to_string())
                })?;
            if size > limits.max_result_bytes {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::RowLimitExceeded,
                    format!(
                        "{} rows serialize to {} bytes, exceeding the limit of {} bytes",
                        rows.len(),
                        size,
                        limits.max_result_bytes
                    ),
                ));
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        record_query_executed(elapsed_ms);
        if truncated {
            record_query_truncated();
            debug!(total_rows = total, max_rows = limits.max_rows, "Result truncated");
        }

        Ok(ExecutionResult {
            row_count: rows.len(),
            rows,
            truncated,
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ColumnDef;
    use crate::validation::SqlValidator;
    use parking_lot::Mutex;
    use serde_json::json;

    fn validated(sql: &str) -> ValidatedStatement {
        SqlValidator::default().validate(sql).into_validated().unwrap()
    }

    fn orders_warehouse(n: i64) -> MemoryWarehouse {
        let rows = (1..=n).map(|i| vec![json!(i), json!(i as f64 * 10.0)]).collect();
        MemoryWarehouse::new().with_table(
            SchemaTable::new("orders", vec![ColumnDef::int64("id"), ColumnDef::float64("total")]),
            rows,
        )
    }

    struct SlowWarehouse {
        delay: Duration,
    }

    #[async_trait]
    impl WarehouseBackend for SlowWarehouse {
        fn mode(&self) -> ExecutorMode {
            ExecutorMode::Mock
        }

        async fn execute_query(&self, _sql: &str, _timeout: Duration) -> Result<QueryResult> {
            tokio::time::sleep(self.delay).await;
            Ok(QueryResult::default())
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn describe_table(&self, _table_name: &str) -> Result<Option<SchemaTable>> {
            Ok(None)
        }

        async fn sample_rows(&self, _table_name: &str, _limit: usize) -> Result<Option<Vec<Row>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_executor_mode_default() {
        let mode: ExecutorMode = Default::default();
        assert_eq!(mode, ExecutorMode::Mock);
    }

    #[test]
    fn test_execution_limits_from_config() {
        let limits = ExecutionLimits::from(&LimitsConfig {
            max_rows: 7,
            timeout_ms: 1500,
            ..Default::default()
        });
        assert_eq!(limits.max_rows, 7);
        assert_eq!(limits.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::new(ExecutionErrorKind::WarehouseError, "Not found: Table x");
        assert_eq!(err.to_string(), "Warehouse error: Not found: Table x");
    }

    #[test]
    fn test_execution_error_from_warehouse_preserves_message() {
        let err = ExecutionError::from(Error::Warehouse("Syntax error at [1:8]".into()));
        assert_eq!(err.kind, ExecutionErrorKind::WarehouseError);
        assert_eq!(err.message, "Syntax error at [1:8]");
    }

    #[tokio::test]
    async fn test_execute_select_with_limit() {
        let executor = QueryExecutor::new(Arc::new(orders_warehouse(50)));
        let result = executor
            .execute(&validated("SELECT * FROM orders LIMIT 10"), &ExecutionLimits::default())
            .await
            .unwrap();
        assert!(result.row_count <= 10);
        assert_eq!(result.row_count, result.rows.len());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_execute_truncates_over_max_rows() {
        let executor = QueryExecutor::new(Arc::new(orders_warehouse(25)));
        let limits = ExecutionLimits::default().with_max_rows(10);
        let result = executor
            .execute(&validated("SELECT id FROM orders"), &limits)
            .await
            .unwrap();
        assert_eq!(result.row_count, 10);
        assert!(result.truncated);
        assert_eq!(result.rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_execute_exact_max_rows_not_truncated() {
        let executor = QueryExecutor::new(Arc::new(orders_warehouse(10)));
        let limits = ExecutionLimits::default().with_max_rows(10);
        let result = executor
            .execute(&validated("SELECT id FROM orders"), &limits)
            .await
            .unwrap();
        assert_eq!(result.row_count, 10);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_execute_warehouse_error_verbatim() {
        let executor = QueryExecutor::new(Arc::new(orders_warehouse(1)));
        let err = executor
            .execute(&validated("SELECT * FROM missing_table"), &ExecutionLimits::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::WarehouseError);
        assert!(err.message.contains("missing_table"));
    }

    #[tokio::test]
    async fn test_execute_timeout_abandons_call() {
        let executor = QueryExecutor::new(Arc::new(SlowWarehouse {
            delay: Duration::from_secs(30),
        }));
        let limits = ExecutionLimits::default().with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let err = executor
            .execute(&validated("SELECT 1"), &limits)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_execute_result_byte_limit() {
        let executor = QueryExecutor::new(Arc::new(orders_warehouse(100)));
        let limits = ExecutionLimits {
            max_rows: 100,
            timeout: Duration::from_secs(5),
            max_result_bytes: 64,
        };
        let err = executor
            .execute(&validated("SELECT * FROM orders"), &limits)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::RowLimitExceeded);
    }

    #[tokio::test]
    async fn test_execute_sends_normalized_text() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let warehouse = CountingWarehouse::new(orders_warehouse(3), move |sql: &str| {
            sink.lock().push(sql.to_string())
        });
        let executor = QueryExecutor::new(Arc::new(warehouse));
        executor
            .execute(
                &validated("SELECT id -- trailing note\nFROM orders;"),
                &ExecutionLimits::default(),
            )
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["SELECT id FROM orders".to_string()]);
    }
}
