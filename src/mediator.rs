use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::SchemaCatalog;
use crate::config::Config;
use crate::domain::{SampleRows, SchemaTable};
use crate::error::Error;
use crate::executor::{ExecutionLimits, ExecutionResult, ExecutorMode, QueryExecutor, WarehouseBackend};
use crate::history::{HistoryEntry, Outcome, QueryHistory, RequestInput};
use crate::llm::LanguageModel;
use crate::metrics::record_tool_call;
use crate::translator::Translator;
use crate::validation::{
    PolicyRule, Rejection, SqlValidator, ValidationResult, ValidationVerdict,
};

/// The closed set of tools a caller may invoke.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ToolRequest {
    AskNaturalLanguage { question: String },
    RunSql { sql: String },
    ListTables,
    GetTableSchema { table_name: String },
    GetTableSample { table_name: String, limit: Option<usize> },
    RefreshSchema,
    GetHistory { limit: Option<usize> },
}

impl ToolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::AskNaturalLanguage { .. } => "askNaturalLanguage",
            ToolRequest::RunSql { .. } => "runSql",
            ToolRequest::ListTables => "listTables",
            ToolRequest::GetTableSchema { .. } => "getTableSchema",
            ToolRequest::GetTableSample { .. } => "getTableSample",
            ToolRequest::RefreshSchema => "refreshSchema",
            ToolRequest::GetHistory { .. } => "history",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NaturalLanguageAnswer {
    pub question: String,
    pub sql: String,
    pub explanation: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlAnswer {
    pub sql: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableList {
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Answer(NaturalLanguageAnswer),
    Sql(SqlAnswer),
    Tables(TableList),
    Schema(SchemaTable),
    Sample(SampleRows),
    History(HistoryPage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FailureStatus {
    Rejected,
    Error,
}

/// Uniform user-visible failure. Rejections and execution errors both end
/// up here so callers can always tell which of the two happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub status: FailureStatus,
    pub code: i32,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<PolicyRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl FailureReport {
    pub fn rejected(rejection: &Rejection, sql: &str) -> Self {
        let err = Error::ValidationRejected(rejection.reason.clone());
        Self {
            status: FailureStatus::Rejected,
            code: err.code(),
            kind: err.kind(),
            message: rejection.reason.clone(),
            rule: Some(rejection.rule),
            sql: Some(sql.to_string()),
        }
    }

    pub fn from_error(err: &Error, sql: Option<&str>) -> Self {
        let status = match err {
            Error::ValidationRejected(_) => FailureStatus::Rejected,
            _ => FailureStatus::Error,
        };
        Self {
            status,
            code: err.code(),
            kind: err.kind(),
            message: err.to_string(),
            rule: None,
            sql: sql.map(str::to_string),
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.status == FailureStatus::Rejected
    }
}

impl From<Error> for FailureReport {
    fn from(err: Error) -> Self {
        Self::from_error(&err, None)
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            FailureStatus::Rejected => write!(f, "[REJECTED] {}", self.message),
            FailureStatus::Error => write!(f, "[ERROR] {}", self.message),
        }
    }
}

impl std::error::Error for FailureReport {}

type ToolResult<T> = std::result::Result<T, FailureReport>;

const ABANDONED_REASON: &str =
    "request abandoned before completion (deadline exceeded or caller went away)";

/// A query request's history slot. Completing it writes the entry; dropping
/// it uncompleted (the request future was cancelled mid-flight) writes a
/// failure entry with whatever SQL had been resolved so far.
struct PendingEntry<'a> {
    history: &'a QueryHistory,
    request_id: Uuid,
    input: Option<RequestInput>,
    sql: Option<String>,
    verdict: Option<ValidationVerdict>,
}

impl<'a> PendingEntry<'a> {
    fn new(history: &'a QueryHistory, request_id: Uuid, input: RequestInput) -> Self {
        Self {
            history,
            request_id,
            input: Some(input),
            sql: None,
            verdict: None,
        }
    }

    fn resolve(&mut self, sql: &str, verdict: ValidationVerdict) {
        self.sql = Some(sql.to_string());
        self.verdict = Some(verdict);
    }

    fn complete(mut self, outcome: Outcome, row_count: Option<usize>) {
        if let Some(mut entry) = self.take_entry(outcome) {
            if let Some(rows) = row_count {
                entry = entry.with_row_count(rows);
            }
            self.history.append(entry);
            debug!(request_id = %self.request_id, state = "LOGGED");
        }
    }

    fn take_entry(&mut self, outcome: Outcome) -> Option<HistoryEntry> {
        let input = self.input.take()?;
        let mut entry = HistoryEntry::new(input, outcome);
        if let Some(sql) = self.sql.take() {
            entry = entry.with_sql(sql);
        }
        if let Some(verdict) = self.verdict.take() {
            entry = entry.with_validation(verdict);
        }
        Some(entry)
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.take_entry(Outcome::failure(ABANDONED_REASON)) {
            warn!(request_id = %self.request_id, "Request abandoned before completion");
            self.history.append(entry);
            debug!(request_id = %self.request_id, state = "LOGGED");
        }
    }
}

/// Sequences Translator, Validator and Executor for every query request and
/// writes exactly one history entry per query request, whatever the outcome.
/// Nothing reaches the executor without passing the validator first.
pub struct QueryMediator {
    catalog: Arc<SchemaCatalog>,
    validator: Arc<SqlValidator>,
    translator: Translator,
    executor: QueryExecutor,
    history: Arc<QueryHistory>,
    limits: ExecutionLimits,
    audit_enabled: bool,
}

impl QueryMediator {
    pub fn new(
        config: &Config,
        warehouse: Arc<dyn WarehouseBackend>,
        model: Arc<dyn LanguageModel>,
        history: Arc<QueryHistory>,
    ) -> Self {
        let catalog = Arc::new(SchemaCatalog::new(warehouse.clone(), &config.limits));
        let validator = Arc::new(SqlValidator::new(&config.policy));
        let translator = Translator::new(model, catalog.clone(), validator.clone(), &config.llm);

        Self {
            catalog,
            validator,
            translator,
            executor: QueryExecutor::new(warehouse),
            history,
            limits: ExecutionLimits::from(&config.limits),
            audit_enabled: config.logging.audit_enabled,
        }
    }

    pub fn mode(&self) -> ExecutorMode {
        self.executor.mode()
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn history(&self) -> &QueryHistory {
        &self.history
    }

    pub async fn handle(&self, request: ToolRequest) -> ToolResult<ToolResponse> {
        let tool = request.name();
        let start = Instant::now();

        let result = match request {
            ToolRequest::AskNaturalLanguage { question } => self
                .ask_natural_language(&question)
                .await
                .map(ToolResponse::Answer),
            ToolRequest::RunSql { sql } => self.run_sql(&sql).await.map(ToolResponse::Sql),
            ToolRequest::ListTables => self
                .list_tables()
                .await
                .map(|tables| ToolResponse::Tables(TableList { tables })),
            ToolRequest::GetTableSchema { table_name } => {
                self.get_table_schema(&table_name).await.map(ToolResponse::Schema)
            }
            ToolRequest::GetTableSample { table_name, limit } => self
                .get_table_sample(&table_name, limit)
                .await
                .map(ToolResponse::Sample),
            ToolRequest::RefreshSchema => self
                .refresh_schema()
                .await
                .map(|tables| ToolResponse::Tables(TableList { tables })),
            ToolRequest::GetHistory { limit } => Ok(ToolResponse::History(HistoryPage {
                entries: self.history.entries(limit),
            })),
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(report) if report.is_rejection() => "rejected",
            Err(_) => "error",
        };
        record_tool_call(tool, outcome, start);

        if self.audit_enabled {
            info!(
                tool,
                outcome,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "AUDIT: tool call"
            );
        }

        result
    }

    pub async fn ask_natural_language(&self, question: &str) -> ToolResult<NaturalLanguageAnswer> {
        let request_id = Uuid::new_v4();
        let pending = PendingEntry::new(
            &self.history,
            request_id,
            RequestInput::Question(question.to_string()),
        );
        debug!(%request_id, state = "RECEIVED", tool = "askNaturalLanguage");

        debug!(%request_id, state = "TRANSLATING");
        let translation = match self.translator.translate(question).await {
            Ok(translation) => translation,
            Err(e) => {
                warn!(%request_id, error = %e, "Translation failed");
                let report = FailureReport::from_error(&e, None);
                pending.complete(Outcome::failure(report.message.clone()), None);
                return Err(report);
            }
        };

        let sql = translation.statement.text().to_string();
        let result = self.validate_and_execute(request_id, pending, &sql).await?;

        Ok(NaturalLanguageAnswer {
            question: question.to_string(),
            sql,
            explanation: translation.explanation,
            result,
        })
    }

    pub async fn run_sql(&self, sql: &str) -> ToolResult<SqlAnswer> {
        let request_id = Uuid::new_v4();
        debug!(%request_id, state = "RECEIVED", tool = "runSql");

        let pending = PendingEntry::new(&self.history, request_id, RequestInput::Sql(sql.to_string()));
        let result = self.validate_and_execute(request_id, pending, sql).await?;
        Ok(SqlAnswer {
            sql: sql.to_string(),
            result,
        })
    }

    pub async fn list_tables(&self) -> ToolResult<Vec<String>> {
        Ok(self
            .catalog
            .list_tables()
            .await
            .map_err(|e| e.with_context("listTables"))?)
    }

    pub async fn get_table_schema(&self, table_name: &str) -> ToolResult<SchemaTable> {
        let schema = self
            .catalog
            .get_schema(table_name)
            .await
            .map_err(|e| e.with_context("getTableSchema"))?;
        Ok(schema.as_ref().clone())
    }

    pub async fn get_table_sample(
        &self,
        table_name: &str,
        limit: Option<usize>,
    ) -> ToolResult<SampleRows> {
        Ok(self
            .catalog
            .get_sample(table_name, limit)
            .await
            .map_err(|e| e.with_context("getTableSample"))?)
    }

    pub async fn refresh_schema(&self) -> ToolResult<Vec<String>> {
        Ok(self
            .catalog
            .refresh()
            .await
            .map_err(|e| e.with_context("refreshSchema"))?)
    }

    async fn validate_and_execute(
        &self,
        request_id: Uuid,
        mut pending: PendingEntry<'_>,
        sql: &str,
    ) -> ToolResult<ExecutionResult> {
        debug!(%request_id, state = "VALIDATING");
        let validation = self.validator.validate(sql);
        pending.resolve(sql, validation.verdict());

        let statement = match validation {
            ValidationResult::Accepted(statement) => statement,
            ValidationResult::Rejected(rejection) => {
                warn!(%request_id, rule = rejection.rule.as_str(), reason = %rejection.reason, "Statement rejected");
                debug!(%request_id, state = "REJECTED");
                pending.complete(Outcome::failure(rejection.reason.clone()), None);
                return Err(FailureReport::rejected(&rejection, sql));
            }
        };

        debug!(%request_id, state = "EXECUTING", tables = ?statement.tables());
        match self.executor.execute(&statement, &self.limits).await {
            Ok(result) => {
                info!(
                    %request_id,
                    rows = result.row_count,
                    truncated = result.truncated,
                    elapsed_ms = result.elapsed_ms,
                    "Query completed"
                );
                pending.complete(Outcome::Success, Some(result.row_count));
                Ok(result)
            }
            Err(e) => {
                warn!(%request_id, kind = e.kind.as_str(), error = %e.message, "Query failed");
                let err = Error::from(e);
                let report = FailureReport::from_error(&err, Some(sql));
                pending.complete(Outcome::failure(report.message.clone()), None);
                Err(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CountingWarehouse, MemoryWarehouse};
    use crate::llm::ScriptedModel;
    use crate::validation::ValidationVerdict;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Harness {
        mediator: QueryMediator,
        executed: Arc<Mutex<Vec<String>>>,
        model: Arc<ScriptedModel>,
    }

    fn harness_with(config: Config, responses: &[&str]) -> Harness {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let sink = executed.clone();
        let warehouse = Arc::new(CountingWarehouse::new(
            MemoryWarehouse::sample(),
            move |sql: &str| sink.lock().push(sql.to_string()),
        ));
        let model = Arc::new(ScriptedModel::new(responses.iter().copied()));
        let mediator = QueryMediator::new(
            &config,
            warehouse,
            model.clone(),
            Arc::new(QueryHistory::in_memory()),
        );
        Harness {
            mediator,
            executed,
            model,
        }
    }

    fn harness(responses: &[&str]) -> Harness {
        harness_with(Config::default(), responses)
    }

    #[tokio::test]
    async fn test_run_sql_select_returns_rows() {
        let h = harness(&[]);
        let answer = h
            .mediator
            .run_sql("SELECT * FROM orders LIMIT 10")
            .await
            .unwrap();
        assert_eq!(answer.result.row_count, 10);
        assert!(answer.result.rows.len() <= 10);
        assert!(!answer.result.truncated);

        let entries = h.mediator.history().entries(None);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].outcome.is_success());
        assert_eq!(entries[0].row_count, Some(10));
        assert_eq!(entries[0].validation, Some(ValidationVerdict::Accepted));
    }

    #[tokio::test]
    async fn test_drop_never_reaches_warehouse() {
        let h = harness(&[]);
        let report = h.mediator.run_sql("DROP TABLE orders").await.unwrap_err();

        assert_eq!(report.status, FailureStatus::Rejected);
        assert_eq!(report.rule, Some(PolicyRule::ForbiddenKeyword));
        assert!(report.to_string().starts_with("[REJECTED]"));
        assert!(report.message.contains("DROP"));
        assert!(h.executed.lock().is_empty());

        let entries = h.mediator.history().entries(None);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].outcome.is_success());
        assert!(entries[0].row_count.is_none());
    }

    #[tokio::test]
    async fn test_stacked_statement_rejected_whole() {
        let h = harness(&[]);
        let report = h
            .mediator
            .run_sql("SELECT 1; DROP TABLE orders")
            .await
            .unwrap_err();
        assert!(report.is_rejection());
        assert_eq!(report.rule, Some(PolicyRule::StackedStatements));
        assert!(h.executed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_warehouse_error_is_error_not_rejection() {
        let h = harness(&[]);
        let report = h
            .mediator
            .run_sql("SELECT missing_column FROM orders")
            .await
            .unwrap_err();
        assert_eq!(report.status, FailureStatus::Error);
        assert_eq!(report.kind, "warehouse_error");
        assert!(report.to_string().starts_with("[ERROR]"));
        assert_eq!(h.executed.lock().len(), 1);
        assert_eq!(h.mediator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_ask_natural_language_top_customers() {
        let h = harness(&[
            "```sql\nSELECT name, revenue FROM customers ORDER BY revenue DESC LIMIT 5\n```\nCustomers ranked by revenue.",
        ]);
        let answer = h
            .mediator
            .ask_natural_language("top 5 customers by revenue")
            .await
            .unwrap();

        assert_eq!(answer.result.row_count, 5);
        assert_eq!(answer.result.rows[0]["name"], "Umbrella");
        assert!(answer.sql.contains("LIMIT 5"));
        assert!(answer.explanation.contains("ranked by revenue"));

        let entries = h.mediator.history().entries(None);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].input,
            RequestInput::Question("top 5 customers by revenue".into())
        );
        assert_eq!(entries[0].row_count, Some(5));
    }

    #[tokio::test]
    async fn test_ask_prose_logs_failure_without_execution() {
        let h = harness(&["I cannot answer that from the available tables."]);
        let report = h
            .mediator
            .ask_natural_language("what is the weather")
            .await
            .unwrap_err();

        assert_eq!(report.kind, "translation_error");
        assert!(h.executed.lock().is_empty());

        let entries = h.mediator.history().entries(None);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].resolved_sql.is_none());
        assert!(entries[0].row_count.is_none());
        assert!(!entries[0].outcome.is_success());
    }

    #[tokio::test]
    async fn test_ask_destructive_translation_never_executes() {
        let h = harness(&["```sql\nDELETE FROM orders\n```"]);
        let report = h
            .mediator
            .ask_natural_language("remove all orders")
            .await
            .unwrap_err();
        assert_eq!(report.status, FailureStatus::Error);
        assert!(h.executed.lock().is_empty());
        assert_eq!(h.model.call_count(), 2);
        assert_eq!(h.mediator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_question_still_logs_one_entry() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let sink = executed.clone();
        let warehouse = Arc::new(CountingWarehouse::new(
            MemoryWarehouse::sample(),
            move |sql: &str| sink.lock().push(sql.to_string()),
        ));
        let model = Arc::new(
            ScriptedModel::new(["```sql\nSELECT 1\n```"]).with_delay(Duration::from_secs(5)),
        );
        let mediator = QueryMediator::new(
            &Config::default(),
            warehouse,
            model,
            Arc::new(QueryHistory::in_memory()),
        );

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            mediator.ask_natural_language("how many orders"),
        )
        .await;
        assert!(outcome.is_err());

        let entries = mediator.history().entries(None);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].input,
            RequestInput::Question("how many orders".into())
        );
        assert_eq!(entries[0].outcome, Outcome::failure(ABANDONED_REASON));
        assert!(entries[0].resolved_sql.is_none());
        assert!(executed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_completed_request_is_not_logged_twice() {
        let h = harness(&[]);
        h.mediator.run_sql("SELECT name FROM customers LIMIT 1").await.unwrap();
        h.mediator.run_sql("DROP TABLE customers").await.unwrap_err();
        let entries = h.mediator.history().entries(None);
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[1].validation,
            Some(ValidationVerdict::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncation_is_flagged_not_error() {
        let mut config = Config::default();
        config.limits.max_rows = 3;
        let h = harness_with(config, &[]);
        let answer = h.mediator.run_sql("SELECT * FROM orders").await.unwrap();
        assert_eq!(answer.result.row_count, 3);
        assert!(answer.result.truncated);
    }

    #[tokio::test]
    async fn test_metadata_tools_skip_validator_and_history() {
        let h = harness(&[]);
        let tables = h.mediator.list_tables().await.unwrap();
        assert_eq!(tables, vec!["customers", "orders"]);

        let schema = h.mediator.get_table_schema("customers").await.unwrap();
        assert!(schema.column("revenue").is_some());

        let report = h.mediator.get_table_schema("nope").await.unwrap_err();
        assert_eq!(report.kind, "not_found");

        let sample = h.mediator.get_table_sample("orders", Some(2)).await.unwrap();
        assert_eq!(sample.rows.len(), 2);

        assert!(h.executed.lock().is_empty());
        assert!(h.mediator.history().is_empty());
    }

    #[tokio::test]
    async fn test_handle_dispatches_closed_enum() {
        let h = harness(&[]);
        let response = h
            .mediator
            .handle(ToolRequest::RunSql {
                sql: "SELECT COUNT(*) AS n FROM customers".into(),
            })
            .await
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["result"]["rows"][0]["n"], 7);

        let response = h
            .mediator
            .handle(ToolRequest::GetHistory { limit: Some(5) })
            .await
            .unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["entries"].as_array().unwrap().len(), 1);

        let response = h.mediator.handle(ToolRequest::RefreshSchema).await.unwrap();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["tables"][1], "orders");
    }

    #[test]
    fn test_tool_request_deserialize() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"tool":"getTableSample","tableName":"orders"}"#).unwrap();
        assert_eq!(
            request,
            ToolRequest::GetTableSample {
                table_name: "orders".into(),
                limit: None
            }
        );
        assert_eq!(request.name(), "getTableSample");
    }

    #[test]
    fn test_failure_report_serialization() {
        let report = FailureReport::from_error(&Error::TableNotFound("x".into()), Some("SELECT 1"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ERROR");
        assert_eq!(json["code"], -32002);
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["sql"], "SELECT 1");
        assert!(json.get("rule").is_none());
    }
}
