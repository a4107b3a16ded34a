use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::RpcConfig;
use crate::error::Error;
use crate::executor::ExecutorMode;
use crate::mediator::{FailureReport, QueryMediator, ToolRequest};

use super::types::{
    AskNaturalLanguageParams, HealthResult, HistoryParams, PingResult, RunSqlParams,
    TableSampleParams, TableSchemaParams,
};

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, Error> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| Error::InvalidRequest(format!("Invalid params: {}", e)))
}

pub struct RpcMethods {
    mediator: Arc<QueryMediator>,
    rpc_config: RpcConfig,
    start_time: Instant,
}

impl RpcMethods {
    pub fn new(mediator: Arc<QueryMediator>) -> Self {
        Self::with_config(mediator, RpcConfig::default())
    }

    pub fn with_config(mediator: Arc<QueryMediator>, rpc_config: RpcConfig) -> Self {
        Self {
            mediator,
            rpc_config,
            start_time: Instant::now(),
        }
    }

    pub fn rpc_config(&self) -> &RpcConfig {
        &self.rpc_config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_config.request_timeout_secs)
    }

    pub fn mediator(&self) -> &QueryMediator {
        &self.mediator
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, FailureReport> {
        let request: ToolRequest = match method {
            "sql.ping" => return Ok(self.ping()),
            "sql.health" => return Ok(self.health()),
            "sql.askNaturalLanguage" => parse_params::<AskNaturalLanguageParams>(params)?.into(),
            "sql.runSql" => parse_params::<RunSqlParams>(params)?.into(),
            "sql.listTables" => ToolRequest::ListTables,
            "sql.getTableSchema" => parse_params::<TableSchemaParams>(params)?.into(),
            "sql.getTableSample" => parse_params::<TableSampleParams>(params)?.into(),
            "sql.refreshSchema" => ToolRequest::RefreshSchema,
            "sql.history" => parse_params::<HistoryParams>(params)?.into(),
            _ => return Err(Error::MethodNotFound(method.to_string()).into()),
        };

        let response = self.mediator.handle(request).await?;
        serde_json::to_value(response).map_err(|e| FailureReport::from(Error::Json(e)))
    }

    fn ping(&self) -> Value {
        json!(PingResult {
            message: "pong".to_string()
        })
    }

    fn health(&self) -> Value {
        let backend = match self.mediator.mode() {
            ExecutorMode::Mock => "mock",
            ExecutorMode::BigQuery => "bigquery",
        };
        json!(HealthResult {
            status: "healthy".to_string(),
            backend: backend.to_string(),
            cached_tables: self.mediator.catalog().cached_table_count(),
            history_entries: self.mediator.history().len(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        })
    }
}
