use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Query, SelectItem, SetExpr, Statement,
    TableFactor,
};
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, TokenWithLocation, Tokenizer};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::error::{Error, Result};
use crate::metrics::record_validation;

/// Keywords that may not appear as bare tokens anywhere in a statement.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "GRANT",
    "REVOKE", "CALL", "EXEC",
];

static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*$")
        .expect("TABLE_NAME_REGEX pattern is valid")
});

pub fn validate_table_name(name: &str) -> Result<()> {
    if name.len() > 128 || !TABLE_NAME_REGEX.is_match(name) {
        return Err(Error::InvalidRequest(format!(
            "Invalid table name: {}",
            name
        )));
    }
    Ok(())
}

pub fn quote_identifier(name: &str) -> String {
    name.replace('`', "``")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    Empty,
    MaxLength,
    Tokenize,
    StackedStatements,
    ForbiddenKeyword,
    LeadingKeyword,
    Parse,
    NotSelect,
    DeniedTable,
}

impl PolicyRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRule::Empty => "empty",
            PolicyRule::MaxLength => "max_length",
            PolicyRule::Tokenize => "tokenize",
            PolicyRule::StackedStatements => "stacked_statements",
            PolicyRule::ForbiddenKeyword => "forbidden_keyword",
            PolicyRule::LeadingKeyword => "leading_keyword",
            PolicyRule::Parse => "parse",
            PolicyRule::NotSelect => "not_select",
            PolicyRule::DeniedTable => "denied_table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: PolicyRule,
    pub reason: String,
}

impl Rejection {
    fn new(rule: PolicyRule, reason: impl Into<String>) -> Self {
        Self {
            rule,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatementKind {
    Select,
    Other,
}

/// Candidate SQL text with its leading-keyword classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlStatement {
    text: String,
    kind: StatementKind,
}

impl SqlStatement {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let leading = text
            .split(|c: char| c.is_whitespace() || c == '(')
            .find(|w| !w.is_empty())
            .unwrap_or("")
            .to_ascii_uppercase();
        let kind = match leading.as_str() {
            "SELECT" | "WITH" => StatementKind::Select,
            _ => StatementKind::Other,
        };
        Self { text, kind }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }
}

/// A statement that passed [`SqlValidator::validate`].
///
/// The fields are private and there is no public constructor, so the only way to
/// obtain one is through an accepted validation:
///
/// ```compile_fail
/// use sqlgenius::validation::ValidatedStatement;
///
/// let stmt = ValidatedStatement { sql: "DROP TABLE orders".to_string(), tables: vec![] };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStatement {
    sql: String,
    tables: Vec<String>,
}

impl ValidatedStatement {
    /// Comment-free, whitespace-normalized text; this is what the warehouse runs.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Table references found anywhere in the statement, CTE names included.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Accepted(ValidatedStatement),
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum ValidationVerdict {
    Accepted,
    Rejected { rule: PolicyRule, reason: String },
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted(_))
    }

    pub fn verdict(&self) -> ValidationVerdict {
        match self {
            ValidationResult::Accepted(_) => ValidationVerdict::Accepted,
            ValidationResult::Rejected(r) => ValidationVerdict::Rejected {
                rule: r.rule,
                reason: r.reason.clone(),
            },
        }
    }

    pub fn into_validated(self) -> Result<ValidatedStatement> {
        match self {
            ValidationResult::Accepted(stmt) => Ok(stmt),
            ValidationResult::Rejected(r) => Err(Error::ValidationRejected(r.reason)),
        }
    }
}

/// Read-only SQL policy. Pure: never touches the warehouse.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    max_statement_length: usize,
    denied_tables: Vec<String>,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

impl SqlValidator {
    pub fn new(policy: &PolicyConfig) -> Self {
        Self {
            max_statement_length: policy.max_statement_length,
            denied_tables: policy
                .denied_tables
                .iter()
                .map(|t| t.trim_matches('`').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn validate(&self, sql: &str) -> ValidationResult {
        match self.check(sql) {
            Ok(stmt) => {
                record_validation(None);
                ValidationResult::Accepted(stmt)
            }
            Err(rejection) => {
                debug!(rule = rejection.rule.as_str(), reason = %rejection.reason, "SQL rejected");
                record_validation(Some(rejection.rule));
                ValidationResult::Rejected(rejection)
            }
        }
    }

    fn check(&self, sql: &str) -> std::result::Result<ValidatedStatement, Rejection> {
        if sql.trim().is_empty() {
            return Err(Rejection::new(PolicyRule::Empty, "empty statement"));
        }

        if sql.len() > self.max_statement_length {
            return Err(Rejection::new(
                PolicyRule::MaxLength,
                format!(
                    "statement is {} bytes, exceeding the maximum of {}",
                    sql.len(),
                    self.max_statement_length
                ),
            ));
        }

        let dialect = BigQueryDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize_with_location()
            .map_err(|e| {
                Rejection::new(PolicyRule::Tokenize, format!("could not tokenize statement: {}", e))
            })?;

        let mut significant = significant_tokens(sql, &tokens).ok_or_else(|| {
            Rejection::new(PolicyRule::Tokenize, "could not locate statement tokens")
        })?;

        if matches!(significant.last(), Some(t) if t.token == Token::SemiColon) {
            significant.pop();
        }

        if significant.is_empty() {
            return Err(Rejection::new(PolicyRule::Empty, "empty statement"));
        }

        if significant.iter().any(|t| t.token == Token::SemiColon) {
            return Err(Rejection::new(
                PolicyRule::StackedStatements,
                "stacked statements are not allowed: only a single statement may be submitted",
            ));
        }

        if let Some(keyword) = significant.iter().find_map(|t| forbidden_keyword(&t.token)) {
            return Err(Rejection::new(
                PolicyRule::ForbiddenKeyword,
                format!("forbidden keyword {} is not allowed in read-only queries", keyword),
            ));
        }

        match significant.first().map(|t| (&t.token, t.text)) {
            Some((Token::Word(w), _))
                if w.quote_style.is_none()
                    && (w.value.eq_ignore_ascii_case("SELECT")
                        || w.value.eq_ignore_ascii_case("WITH")) => {}
            Some((Token::LParen, _)) => {
                return Err(Rejection::new(
                    PolicyRule::LeadingKeyword,
                    "parenthesized top-level queries are not accepted: the statement must begin with SELECT or WITH",
                ));
            }
            Some((_, text)) => {
                return Err(Rejection::new(
                    PolicyRule::LeadingKeyword,
                    format!("statement must begin with SELECT or WITH, found {}", text),
                ));
            }
            None => return Err(Rejection::new(PolicyRule::Empty, "empty statement")),
        }

        let mut normalized = String::with_capacity(sql.len());
        for t in &significant {
            if t.spaced && !normalized.is_empty() {
                normalized.push(' ');
            }
            normalized.push_str(t.text);
        }

        let statements = Parser::parse_sql(&dialect, &normalized).map_err(|e| {
            Rejection::new(PolicyRule::Parse, format!("could not parse statement: {}", e))
        })?;

        if statements.len() != 1 {
            return Err(Rejection::new(
                PolicyRule::StackedStatements,
                format!("expected exactly one statement, found {}", statements.len()),
            ));
        }

        let mut tables = Vec::new();
        match &statements[0] {
            Statement::Query(query) => collect_query(query, &mut tables)?,
            _ => {
                return Err(Rejection::new(
                    PolicyRule::NotSelect,
                    "only SELECT statements are allowed",
                ))
            }
        }

        if let Some(table) = tables.iter().find(|t| self.is_denied(t)) {
            return Err(Rejection::new(
                PolicyRule::DeniedTable,
                format!("table {} is not permitted by policy", table),
            ));
        }

        Ok(ValidatedStatement {
            sql: normalized,
            tables,
        })
    }

    fn is_denied(&self, table: &str) -> bool {
        if self.denied_tables.is_empty() {
            return false;
        }
        let full = table.replace('`', "").to_ascii_lowercase();
        let last = full.rsplit('.').next().unwrap_or(&full);
        self.denied_tables
            .iter()
            .any(|d| *d == full || d == last)
    }
}

fn forbidden_keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => {
            let upper = w.value.to_ascii_uppercase();
            FORBIDDEN_KEYWORDS
                .contains(&upper.as_str())
                .then_some(upper)
        }
        _ => None,
    }
}

struct SourceToken<'a> {
    token: Token,
    text: &'a str,
    /// Whitespace or a comment separated this token from the previous one.
    spaced: bool,
}

/// Pairs each non-whitespace, non-comment token with its exact source text.
/// Returns `None` if token locations cannot be mapped back onto `sql`.
fn significant_tokens<'a>(
    sql: &'a str,
    tokens: &[TokenWithLocation],
) -> Option<Vec<SourceToken<'a>>> {
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let mut offsets = Vec::with_capacity(tokens.len() + 1);
    for t in tokens {
        offsets.push(byte_offset(sql, &line_starts, t.location.line, t.location.column)?);
    }
    offsets.push(sql.len());

    let mut out = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if matches!(t.token, Token::Whitespace(_) | Token::EOF) {
            continue;
        }
        let (start, end) = (offsets[i], offsets[i + 1]);
        if start > end {
            return None;
        }
        let text = sql.get(start..end)?.trim_end();
        let spaced = i > 0 && matches!(tokens[i - 1].token, Token::Whitespace(_));
        out.push(SourceToken {
            token: t.token.clone(),
            text,
            spaced,
        });
    }
    Some(out)
}

fn byte_offset(sql: &str, line_starts: &[usize], line: u64, column: u64) -> Option<usize> {
    let start = *line_starts.get(usize::try_from(line.checked_sub(1)?).ok()?)?;
    let col = usize::try_from(column.checked_sub(1)?).ok()?;
    let rest = &sql[start..];
    match rest.char_indices().nth(col) {
        Some((i, _)) => Some(start + i),
        None if col == rest.chars().count() => Some(sql.len()),
        None => None,
    }
}

fn collect_query(query: &Query, tables: &mut Vec<String>) -> std::result::Result<(), Rejection> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, tables)?;
        }
    }

    collect_set_expr(&query.body, tables)
}

fn collect_set_expr(body: &SetExpr, tables: &mut Vec<String>) -> std::result::Result<(), Rejection> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(Rejection::new(
                    PolicyRule::NotSelect,
                    "SELECT ... INTO writes a table and is not allowed",
                ));
            }
            for table in &select.from {
                collect_table_factor(&table.relation, tables)?;
                for join in &table.joins {
                    collect_table_factor(&join.relation, tables)?;
                }
            }
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        collect_expr(expr, tables)?;
                    }
                    _ => {}
                }
            }
            if let Some(where_clause) = &select.selection {
                collect_expr(where_clause, tables)?;
            }
            if let Some(having) = &select.having {
                collect_expr(having, tables)?;
            }
            Ok(())
        }
        SetExpr::Query(subquery) => collect_query(subquery, tables),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, tables)?;
            collect_set_expr(right, tables)
        }
        _ => Err(Rejection::new(
            PolicyRule::NotSelect,
            "statement body must resolve to a SELECT",
        )),
    }
}

fn collect_table_factor(tf: &TableFactor, tables: &mut Vec<String>) -> std::result::Result<(), Rejection> {
    match tf {
        TableFactor::Table { name, .. } => {
            tables.push(name.to_string());
            Ok(())
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, tables),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_table_factor(&table_with_joins.relation, tables)?;
            for join in &table_with_joins.joins {
                collect_table_factor(&join.relation, tables)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn collect_expr(expr: &Expr, tables: &mut Vec<String>) -> std::result::Result<(), Rejection> {
    match expr {
        Expr::Subquery(query) => collect_query(query, tables),
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, tables)?;
            collect_query(subquery, tables)
        }
        Expr::Exists { subquery, .. } => collect_query(subquery, tables),
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, tables)?;
            collect_expr(right, tables)
        }
        Expr::UnaryOp { expr, .. } => collect_expr(expr, tables),
        Expr::Nested(inner) => collect_expr(inner, tables),
        Expr::InList { expr, list, .. } => {
            collect_expr(expr, tables)?;
            for e in list {
                collect_expr(e, tables)?;
            }
            Ok(())
        }
        Expr::Between { expr, low, high, .. } => {
            collect_expr(expr, tables)?;
            collect_expr(low, tables)?;
            collect_expr(high, tables)
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(op) = operand {
                collect_expr(op, tables)?;
            }
            for e in conditions.iter().chain(results.iter()) {
                collect_expr(e, tables)?;
            }
            if let Some(el) = else_result {
                collect_expr(el, tables)?;
            }
            Ok(())
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(arg_list) = &func.args {
                for arg in &arg_list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = arg {
                        collect_expr(e, tables)?;
                    }
                }
            }
            if let FunctionArguments::Subquery(query) = &func.args {
                collect_query(query, tables)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
