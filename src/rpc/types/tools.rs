use serde::Deserialize;

use crate::mediator::ToolRequest;

#[derive(Debug, Deserialize)]
pub struct AskNaturalLanguageParams {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub struct RunSqlParams {
    pub sql: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchemaParams {
    pub table_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSampleParams {
    pub table_name: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl From<AskNaturalLanguageParams> for ToolRequest {
    fn from(p: AskNaturalLanguageParams) -> Self {
        ToolRequest::AskNaturalLanguage {
            question: p.question,
        }
    }
}

impl From<RunSqlParams> for ToolRequest {
    fn from(p: RunSqlParams) -> Self {
        ToolRequest::RunSql { sql: p.sql }
    }
}

impl From<TableSchemaParams> for ToolRequest {
    fn from(p: TableSchemaParams) -> Self {
        ToolRequest::GetTableSchema {
            table_name: p.table_name,
        }
    }
}

impl From<TableSampleParams> for ToolRequest {
    fn from(p: TableSampleParams) -> Self {
        ToolRequest::GetTableSample {
            table_name: p.table_name,
            limit: p.limit,
        }
    }
}

impl From<HistoryParams> for ToolRequest {
    fn from(p: HistoryParams) -> Self {
        ToolRequest::GetHistory { limit: p.limit }
    }
}
