use async_trait::async_trait;
use google_cloud_bigquery::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::dataset::DatasetReference;
use google_cloud_bigquery::http::job::cancel::CancelJobRequest;
use google_cloud_bigquery::http::job::query::{QueryRequest, QueryResponse};
use google_cloud_bigquery::http::table::TableFieldType;
use google_cloud_bigquery::http::tabledata::list::Value as BqValue;
use serde_json::{Number, Value as JsonValue};
use std::time::Duration;

use super::{ExecutionError, ExecutorMode, WarehouseBackend};
use crate::config::WarehouseConfig;
use crate::domain::{ColumnDef, ColumnInfo, QueryResult, Row, SchemaTable};
use crate::error::{Error, Result};
use crate::validation::{quote_identifier, validate_table_name};

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BigQueryWarehouse {
    client: Client,
    project_id: String,
    dataset_id: String,
    location: Option<String>,
}

impl BigQueryWarehouse {
    pub async fn new(config: &WarehouseConfig) -> Result<Self> {
        let (client_config, credentials_project) = match &config.credentials_path {
            Some(path) => {
                let path = path.to_string_lossy();
                let credentials = CredentialsFile::new_from_file(path.to_string())
                    .await
                    .map_err(|e| {
                        Error::Config(format!("Failed to read credentials {}: {}", path, e))
                    })?;
                ClientConfig::new_with_credentials(credentials).await
            }
            None => ClientConfig::new_with_auth().await,
        }
        .map_err(|e| Error::Warehouse(format!("Failed to authenticate: {}", e)))?;

        let project_id = config
            .project_id
            .clone()
            .or(credentials_project)
            .ok_or_else(|| {
                Error::Config("No project_id configured and none found in credentials".into())
            })?;

        let dataset_id = config
            .dataset_id
            .clone()
            .ok_or_else(|| Error::Config("dataset_id must be set for the BigQuery backend".into()))?;

        let client = Client::new(client_config)
            .await
            .map_err(|e| Error::Warehouse(format!("Failed to create BigQuery client: {}", e)))?;

        tracing::info!(project_id = %project_id, dataset_id = %dataset_id, "Connected to BigQuery");

        Ok(Self {
            client,
            project_id,
            dataset_id,
            location: config.location.clone(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn dataset_path(&self) -> String {
        format!(
            "`{}.{}`",
            quote_identifier(&self.project_id),
            quote_identifier(&self.dataset_id)
        )
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        tracing::info!(job_id = %job_id, "Attempting to cancel BigQuery job");

        let request = CancelJobRequest {
            location: self.location.clone(),
        };

        match self
            .client
            .job()
            .cancel(&self.project_id, job_id, &request)
            .await
        {
            Ok(_) => {
                tracing::info!(job_id = %job_id, "BigQuery job cancelled successfully");
                Ok(())
            }
            Err(e) => {
                let error_str = e.to_string();
                if error_str.contains("404") || error_str.contains("notFound") {
                    tracing::debug!(job_id = %job_id, "Job already completed, nothing to cancel");
                    Ok(())
                } else {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel BigQuery job");
                    Err(Error::Warehouse(format!(
                        "Failed to cancel job {}: {}",
                        job_id, e
                    )))
                }
            }
        }
    }

    async fn run_query(&self, sql: &str, timeout: Duration) -> Result<QueryResponse> {
        let request = QueryRequest {
            query: sql.to_string(),
            use_legacy_sql: false,
            timeout_ms: Some(timeout.as_millis() as i64),
            default_dataset: Some(DatasetReference {
                project_id: self.project_id.clone(),
                dataset_id: self.dataset_id.clone(),
            }),
            ..Default::default()
        };

        let response = self
            .client
            .job()
            .query(&self.project_id, &request)
            .await
            .map_err(|e| Error::Warehouse(e.to_string()))?;

        if !response.job_complete {
            let job_id = response.job_reference.job_id.clone();
            tracing::warn!(
                job_id = %job_id,
                timeout_ms = timeout.as_millis() as u64,
                "BigQuery job did not complete in time, cancelling"
            );
            if let Err(e) = self.cancel_job(&job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Cancellation failed");
            }
            return Err(ExecutionError::timeout(timeout).into());
        }

        Ok(response)
    }

    async fn execute_query_impl(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        let response = self.run_query(sql, timeout).await?;

        let fields = response
            .schema
            .as_ref()
            .map(|s| s.fields.clone())
            .unwrap_or_default();

        let columns: Vec<ColumnInfo> = fields
            .iter()
            .map(|field| ColumnInfo {
                name: field.name.clone(),
                data_type: bq_type_to_string(&field.data_type),
            })
            .collect();

        let rows: Vec<Vec<JsonValue>> = response
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|tuple| {
                tuple
                    .f
                    .into_iter()
                    .zip(fields.iter())
                    .map(|(cell, field)| bq_value_to_json(cell.v, &field.data_type))
                    .collect()
            })
            .collect();

        Ok(QueryResult {
            columns,
            rows,
            total_rows: response.total_rows.map(|t| t.max(0) as u64),
        })
    }

    async fn describe_table_impl(&self, table_name: &str) -> Result<Option<SchemaTable>> {
        let sql = format!(
            "SELECT c.column_name, c.data_type, c.is_nullable, p.description \
             FROM {ds}.INFORMATION_SCHEMA.COLUMNS c \
             LEFT JOIN {ds}.INFORMATION_SCHEMA.COLUMN_FIELD_PATHS p \
             ON p.table_name = c.table_name AND p.column_name = c.column_name \
             AND p.field_path = c.column_name \
             WHERE c.table_name = '{table}' \
             ORDER BY c.ordinal_position",
            ds = self.dataset_path(),
            table = table_name,
        );

        let result = self.execute_query_impl(&sql, METADATA_TIMEOUT).await?;
        if result.rows.is_empty() {
            return Ok(None);
        }

        let columns = result
            .rows
            .into_iter()
            .map(|row| {
                let text = |i: usize| row.get(i).and_then(|v| v.as_str()).map(str::to_string);
                let mut col = ColumnDef::new(
                    text(0).unwrap_or_default(),
                    text(1).unwrap_or_default(),
                );
                col.nullable = text(2).map(|n| n == "YES").unwrap_or(true);
                col.description = text(3).filter(|d| !d.is_empty());
                col
            })
            .collect();

        let mut schema = SchemaTable::new(table_name, columns);
        if let Some(num_rows) = self.row_count(table_name).await {
            schema = schema.with_num_rows(num_rows);
        }
        Ok(Some(schema))
    }

    async fn row_count(&self, table_name: &str) -> Option<u64> {
        let sql = format!(
            "SELECT row_count FROM `{}.{}.__TABLES__` WHERE table_id = '{}'",
            quote_identifier(&self.project_id),
            quote_identifier(&self.dataset_id),
            table_name
        );
        match self.execute_query_impl(&sql, METADATA_TIMEOUT).await {
            Ok(result) => result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(|v| v.as_u64()),
            Err(e) => {
                tracing::debug!(table = %table_name, error = %e, "Row count unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl WarehouseBackend for BigQueryWarehouse {
    fn mode(&self) -> ExecutorMode {
        ExecutorMode::BigQuery
    }

    async fn execute_query(&self, sql: &str, timeout: Duration) -> Result<QueryResult> {
        self.execute_query_impl(sql, timeout).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT table_name FROM {}.INFORMATION_SCHEMA.TABLES ORDER BY table_name",
            self.dataset_path()
        );
        let result = self.execute_query_impl(&sql, METADATA_TIMEOUT).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    async fn describe_table(&self, table_name: &str) -> Result<Option<SchemaTable>> {
        validate_table_name(table_name)?;
        self.describe_table_impl(table_name).await
    }

    async fn sample_rows(&self, table_name: &str, limit: usize) -> Result<Option<Vec<Row>>> {
        validate_table_name(table_name)?;
        let sql = format!(
            "SELECT * FROM `{}.{}.{}` LIMIT {}",
            quote_identifier(&self.project_id),
            quote_identifier(&self.dataset_id),
            table_name,
            limit
        );

        match self.execute_query_impl(&sql, METADATA_TIMEOUT).await {
            Ok(result) => Ok(Some(result.into_rows())),
            Err(Error::Warehouse(msg)) if msg.contains("Not found") || msg.contains("404") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn bq_type_to_string(field_type: &TableFieldType) -> String {
    match field_type {
        TableFieldType::String => "STRING".to_string(),
        TableFieldType::Bytes => "BYTES".to_string(),
        TableFieldType::Integer | TableFieldType::Int64 => "INT64".to_string(),
        TableFieldType::Float | TableFieldType::Float64 => "FLOAT64".to_string(),
        TableFieldType::Boolean | TableFieldType::Bool => "BOOLEAN".to_string(),
        TableFieldType::Timestamp => "TIMESTAMP".to_string(),
        TableFieldType::Record | TableFieldType::Struct => "STRUCT".to_string(),
        TableFieldType::Date => "DATE".to_string(),
        TableFieldType::Time => "TIME".to_string(),
        TableFieldType::Datetime => "DATETIME".to_string(),
        TableFieldType::Numeric | TableFieldType::Decimal => "NUMERIC".to_string(),
        TableFieldType::Bignumeric | TableFieldType::Bigdecimal => "BIGNUMERIC".to_string(),
        TableFieldType::Interval => "INTERVAL".to_string(),
        TableFieldType::Json => "JSON".to_string(),
    }
}

/// BigQuery returns scalars as strings; integers, floats and booleans are
/// converted back to JSON numbers and booleans.
fn bq_value_to_json(value: BqValue, field_type: &TableFieldType) -> JsonValue {
    match value {
        BqValue::Null => JsonValue::Null,
        BqValue::String(s) => coerce_scalar(s, field_type),
        BqValue::Array(cells) => JsonValue::Array(
            cells
                .into_iter()
                .map(|c| bq_value_to_json(c.v, field_type))
                .collect(),
        ),
        BqValue::Struct(tuple) => JsonValue::Array(
            tuple
                .f
                .into_iter()
                .map(|c| bq_value_to_json(c.v, &TableFieldType::String))
                .collect(),
        ),
    }
}

fn coerce_scalar(s: String, field_type: &TableFieldType) -> JsonValue {
    match field_type {
        TableFieldType::Integer | TableFieldType::Int64 => s
            .parse::<i64>()
            .map(JsonValue::from)
            .unwrap_or(JsonValue::String(s)),
        TableFieldType::Float | TableFieldType::Float64 => s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::String(s)),
        TableFieldType::Boolean | TableFieldType::Bool => match s.as_str() {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            _ => JsonValue::String(s),
        },
        _ => JsonValue::String(s),
    }
}
