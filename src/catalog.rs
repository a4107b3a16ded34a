use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::domain::{SampleRows, SchemaTable};
use crate::error::{Error, Result};
use crate::executor::WarehouseBackend;
use crate::metrics::{record_schema_refresh, set_cached_tables};
use crate::validation::validate_table_name;

#[derive(Clone, Default)]
struct CatalogSnapshot {
    generation: u64,
    table_names: Option<Arc<Vec<String>>>,
    schemas: HashMap<String, Arc<SchemaTable>>,
}

/// Cached table metadata. Readers clone an `Arc` to the current snapshot;
/// writers build a new snapshot and swap it in, so nobody ever observes a
/// partially updated table.
pub struct SchemaCatalog {
    warehouse: Arc<dyn WarehouseBackend>,
    state: RwLock<Arc<CatalogSnapshot>>,
    default_sample_rows: usize,
    max_sample_rows: usize,
}

impl SchemaCatalog {
    pub fn new(warehouse: Arc<dyn WarehouseBackend>, limits: &LimitsConfig) -> Self {
        Self {
            warehouse,
            state: RwLock::new(Arc::new(CatalogSnapshot::default())),
            default_sample_rows: limits.default_sample_rows,
            max_sample_rows: limits.max_sample_rows,
        }
    }

    fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.state.read().clone()
    }

    /// Applies `f` to a copy of the current snapshot, unless a refresh has
    /// happened since `generation` was read.
    fn update_if_current(&self, generation: u64, f: impl FnOnce(&mut CatalogSnapshot)) {
        let mut guard = self.state.write();
        if guard.generation != generation {
            return;
        }
        let mut next = (**guard).clone();
        f(&mut next);
        set_cached_tables(next.schemas.len());
        *guard = Arc::new(next);
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let snapshot = self.snapshot();
        if let Some(names) = &snapshot.table_names {
            return Ok(names.as_ref().clone());
        }

        let names = Arc::new(self.warehouse.list_tables().await?);
        debug!(tables = names.len(), "Table list cached");
        self.update_if_current(snapshot.generation, |s| {
            s.table_names = Some(names.clone());
        });
        Ok(names.as_ref().clone())
    }

    pub async fn get_schema(&self, table_name: &str) -> Result<Arc<SchemaTable>> {
        if validate_table_name(table_name).is_err() {
            return Err(Error::TableNotFound(table_name.to_string()));
        }

        let key = table_name.to_ascii_lowercase();
        let snapshot = self.snapshot();
        if let Some(schema) = snapshot.schemas.get(&key) {
            return Ok(schema.clone());
        }

        let schema = self
            .warehouse
            .describe_table(table_name)
            .await?
            .map(Arc::new)
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;

        debug!(table = %table_name, columns = schema.columns.len(), "Schema cached");
        self.update_if_current(snapshot.generation, |s| {
            s.schemas.insert(key, schema.clone());
        });
        Ok(schema)
    }

    /// The cached schema for `table_name`, without touching the warehouse.
    pub fn cached_schema(&self, table_name: &str) -> Option<Arc<SchemaTable>> {
        self.snapshot()
            .schemas
            .get(&table_name.to_ascii_lowercase())
            .cloned()
    }

    /// Sample rows are advisory and never cached. `limit` defaults to the
    /// configured sample size and is capped at the configured maximum.
    pub async fn get_sample(&self, table_name: &str, limit: Option<usize>) -> Result<SampleRows> {
        if validate_table_name(table_name).is_err() {
            return Err(Error::TableNotFound(table_name.to_string()));
        }

        let limit = limit
            .unwrap_or(self.default_sample_rows)
            .min(self.max_sample_rows);

        let rows = self
            .warehouse
            .sample_rows(table_name, limit)
            .await?
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;

        Ok(SampleRows {
            table: table_name.to_string(),
            rows,
        })
    }

    /// Re-fetches the table list and drops every cached schema.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        let names = self.warehouse.list_tables().await?;

        {
            let mut guard = self.state.write();
            let generation = guard.generation + 1;
            *guard = Arc::new(CatalogSnapshot {
                generation,
                table_names: Some(Arc::new(names.clone())),
                schemas: HashMap::new(),
            });
        }

        record_schema_refresh();
        set_cached_tables(0);
        info!(tables = names.len(), "Schema catalog refreshed");
        Ok(names)
    }

    pub async fn refresh_table(&self, table_name: &str) -> Result<Arc<SchemaTable>> {
        if validate_table_name(table_name).is_err() {
            return Err(Error::TableNotFound(table_name.to_string()));
        }

        let key = table_name.to_ascii_lowercase();
        let fetched = self.warehouse.describe_table(table_name).await?.map(Arc::new);

        let mut guard = self.state.write();
        let mut next = (**guard).clone();
        let result = match fetched {
            Some(schema) => {
                next.schemas.insert(key, schema.clone());
                Ok(schema)
            }
            None => {
                next.schemas.remove(&key);
                Err(Error::TableNotFound(table_name.to_string()))
            }
        };
        set_cached_tables(next.schemas.len());
        *guard = Arc::new(next);
        record_schema_refresh();
        result
    }

    pub fn cached_table_count(&self) -> usize {
        self.state.read().schemas.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ColumnDef, QueryResult, Row};
    use crate::executor::{ExecutorMode, MemoryWarehouse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct DescribeCounter {
        inner: Arc<MemoryWarehouse>,
        describes: AtomicUsize,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl WarehouseBackend for DescribeCounter {
        fn mode(&self) -> ExecutorMode {
            ExecutorMode::Mock
        }

        async fn execute_query(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
            self.inner.execute_query(sql, timeout).await
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list_tables().await
        }

        async fn describe_table(&self, table_name: &str) -> Result<Option<SchemaTable>> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            self.inner.describe_table(table_name).await
        }

        async fn sample_rows(&self, table_name: &str, limit: usize) -> Result<Option<Vec<Row>>> {
            self.inner.sample_rows(table_name, limit).await
        }
    }

    fn setup() -> (Arc<MemoryWarehouse>, Arc<DescribeCounter>, SchemaCatalog) {
        let warehouse = Arc::new(MemoryWarehouse::sample());
        let counter = Arc::new(DescribeCounter {
            inner: warehouse.clone(),
            describes: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
        });
        let catalog = SchemaCatalog::new(counter.clone(), &LimitsConfig::default());
        (warehouse, counter, catalog)
    }

    #[tokio::test]
    async fn test_list_tables() {
        let (_, _, catalog) = setup();
        assert_eq!(catalog.list_tables().await.unwrap(), vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_list_tables_cached_until_refresh() {
        let (warehouse, counter, catalog) = setup();
        catalog.list_tables().await.unwrap();
        warehouse.insert_table(SchemaTable::new("invoices", vec![ColumnDef::int64("id")]), vec![]);
        warehouse.drop_table("orders");

        assert_eq!(catalog.list_tables().await.unwrap(), vec!["customers", "orders"]);
        assert_eq!(counter.lists.load(Ordering::SeqCst), 1);

        assert_eq!(catalog.refresh().await.unwrap(), vec!["customers", "invoices"]);
        assert_eq!(catalog.list_tables().await.unwrap(), vec!["customers", "invoices"]);
    }

    #[tokio::test]
    async fn test_get_schema_not_found() {
        let (_, _, catalog) = setup();
        let err = catalog.get_schema("nonexistent").await.unwrap_err();
        assert!(matches!(err, Error::TableNotFound(ref t) if t == "nonexistent"));
    }

    #[tokio::test]
    async fn test_get_schema_malformed_name_skips_warehouse() {
        let (_, counter, catalog) = setup();
        let err = catalog.get_schema("orders; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
        assert_eq!(counter.describes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_schema_cached_on_first_access() {
        let (_, counter, catalog) = setup();
        let first = catalog.get_schema("orders").await.unwrap();
        let second = catalog.get_schema("ORDERS").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counter.describes.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.cached_table_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_drops_cached_schemas() {
        let (warehouse, counter, catalog) = setup();
        catalog.get_schema("customers").await.unwrap();

        warehouse.insert_table(
            SchemaTable::new("customers", vec![ColumnDef::int64("customer_id")]),
            vec![],
        );
        assert_eq!(catalog.get_schema("customers").await.unwrap().columns.len(), 4);

        catalog.refresh().await.unwrap();
        assert_eq!(catalog.cached_table_count(), 0);
        assert_eq!(catalog.get_schema("customers").await.unwrap().columns.len(), 1);
        assert_eq!(counter.describes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_table_replaces_whole_schema() {
        let (warehouse, _, catalog) = setup();
        catalog.get_schema("orders").await.unwrap();
        warehouse.insert_table(
            SchemaTable::new("orders", vec![ColumnDef::int64("order_id"), ColumnDef::string("status")]),
            vec![],
        );
        let refreshed = catalog.refresh_table("orders").await.unwrap();
        assert_eq!(refreshed.columns.len(), 2);
        assert!(refreshed.column("status").is_some());

        warehouse.drop_table("orders");
        assert!(matches!(
            catalog.refresh_table("orders").await,
            Err(Error::TableNotFound(_))
        ));
        assert_eq!(catalog.cached_table_count(), 0);
    }

    #[tokio::test]
    async fn test_get_sample_default_and_cap() {
        let (_, _, catalog) = setup();
        let sample = catalog.get_sample("orders", None).await.unwrap();
        assert_eq!(sample.table, "orders");
        assert_eq!(sample.rows.len(), LimitsConfig::default().default_sample_rows);

        let capped = catalog.get_sample("orders", Some(10_000)).await.unwrap();
        assert_eq!(capped.rows.len(), 40);
    }

    #[tokio::test]
    async fn test_get_sample_not_found() {
        let (_, _, catalog) = setup();
        assert!(matches!(
            catalog.get_sample("ghost", Some(3)).await,
            Err(Error::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reads_during_refresh() {
        let (_, _, catalog) = setup();
        let catalog = Arc::new(catalog);

        let mut handles = Vec::new();
        for i in 0..16 {
            let catalog = catalog.clone();
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    catalog.refresh().await.map(|_| ())
                } else {
                    catalog.get_schema("customers").await.map(|s| {
                        assert_eq!(s.columns.len(), 4);
                    })
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
