use async_trait::async_trait;
use std::time::Duration;

use super::{ExecutorMode, MemoryWarehouse, WarehouseBackend};
use crate::domain::{QueryResult, Row, SchemaTable};
use crate::error::Result;

/// Wraps a [`MemoryWarehouse`] and reports every SQL text submitted for execution.
pub struct CountingWarehouse<F>
where
    F: Fn(&str) + Send + Sync,
{
    callback: F,
    inner: MemoryWarehouse,
}

impl<F> CountingWarehouse<F>
where
    F: Fn(&str) + Send + Sync,
{
    pub fn new(inner: MemoryWarehouse, callback: F) -> Self {
        Self { callback, inner }
    }
}

#[async_trait]
impl<F> WarehouseBackend for CountingWarehouse<F>
where
    F: Fn(&str) + Send + Sync,
{
    fn mode(&self) -> ExecutorMode {
        ExecutorMode::Mock
    }

    async fn execute_query(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        (self.callback)(sql);
        self.inner.execute_query(sql, timeout).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn describe_table(&self, table_name: &str) -> Result<Option<SchemaTable>> {
        self.inner.describe_table(table_name).await
    }

    async fn sample_rows(&self, table_name: &str, limit: usize) -> Result<Option<Vec<Row>>> {
        self.inner.sample_rows(table_name, limit).await
    }
}
