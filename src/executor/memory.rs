use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Number, Value as JsonValue};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Query,
    Select, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::{ExecutorMode, WarehouseBackend};
use crate::domain::{ColumnDef, ColumnInfo, QueryResult, Row, SchemaTable};
use crate::error::{Error, Result};
use crate::validation::validate_table_name;

struct MemoryTable {
    schema: SchemaTable,
    rows: Vec<Vec<JsonValue>>,
}

impl MemoryTable {
    fn row_map(&self, values: &[JsonValue]) -> Row {
        self.schema
            .columns
            .iter()
            .zip(values.iter().chain(std::iter::repeat(&JsonValue::Null)))
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect()
    }
}

#[derive(Deserialize)]
struct FixtureFile {
    tables: Vec<FixtureTable>,
}

#[derive(Deserialize)]
struct FixtureTable {
    name: String,
    columns: Vec<ColumnDef>,
    #[serde(default)]
    rows: Vec<JsonValue>,
}

/// In-process warehouse holding fixture tables. Understands single-table
/// `SELECT` with projections, simple `WHERE` predicates, whole-table
/// aggregates, `ORDER BY`, `LIMIT` and `OFFSET`.
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: RwLock<BTreeMap<String, MemoryTable>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, schema: SchemaTable, rows: Vec<Vec<JsonValue>>) -> Self {
        self.insert_table(schema, rows);
        self
    }

    pub fn insert_table(&self, schema: SchemaTable, rows: Vec<Vec<JsonValue>>) {
        self.tables
            .write()
            .insert(schema.name.to_ascii_lowercase(), MemoryTable { schema, rows });
    }

    pub fn drop_table(&self, name: &str) -> bool {
        self.tables
            .write()
            .remove(&name.to_ascii_lowercase())
            .is_some()
    }

    pub fn from_fixtures_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read fixtures file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_fixtures_json(&content)
    }

    pub fn from_fixtures_json(json: &str) -> Result<Self> {
        let fixtures: FixtureFile = serde_json::from_str(json)?;
        let warehouse = Self::new();

        for table in fixtures.tables {
            validate_table_name(&table.name)?;
            let rows = table
                .rows
                .into_iter()
                .map(|row| match row {
                    JsonValue::Array(values) => Ok(values),
                    JsonValue::Object(map) => Ok(table
                        .columns
                        .iter()
                        .map(|c| map.get(&c.name).cloned().unwrap_or(JsonValue::Null))
                        .collect()),
                    _ => Err(Error::Config(format!(
                        "Fixture rows for table {} must be arrays or objects",
                        table.name
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            warehouse.insert_table(SchemaTable::new(table.name, table.columns), rows);
        }

        Ok(warehouse)
    }

    /// Small customers/orders dataset served by the `mock` backend when no
    /// fixtures file is given.
    pub fn sample() -> Self {
        let customers = SchemaTable::new(
            "customers",
            vec![
                ColumnDef::int64("customer_id").required(),
                ColumnDef::string("name").with_description("Customer display name"),
                ColumnDef::string("country"),
                ColumnDef::float64("revenue").with_description("Lifetime revenue in USD"),
            ],
        );
        let customer_rows = [
            (1, "Acme Corp", "US", 125_000.0),
            (2, "Globex", "DE", 98_500.5),
            (3, "Initech", "US", 43_200.0),
            (4, "Umbrella", "GB", 210_750.25),
            (5, "Hooli", "US", 187_000.0),
            (6, "Vehement Capital", "FR", 12_400.0),
            (7, "Soylent", "BR", 76_300.0),
        ]
        .into_iter()
        .map(|(id, name, country, revenue)| {
            vec![
                JsonValue::from(id),
                JsonValue::from(name),
                JsonValue::from(country),
                JsonValue::from(revenue),
            ]
        })
        .collect();

        let orders = SchemaTable::new(
            "orders",
            vec![
                ColumnDef::int64("order_id").required(),
                ColumnDef::int64("customer_id").required(),
                ColumnDef::date("order_date"),
                ColumnDef::float64("amount"),
            ],
        );
        let order_rows = (1..=40)
            .map(|i: i64| {
                vec![
                    JsonValue::from(i),
                    JsonValue::from(i % 7 + 1),
                    JsonValue::from(format!("2024-{:02}-{:02}", i % 12 + 1, i % 28 + 1)),
                    JsonValue::from((i * 37 % 500) as f64 + 0.99),
                ]
            })
            .collect();

        Self::new()
            .with_table(customers, customer_rows)
            .with_table(orders, order_rows)
    }

    fn run(&self, sql: &str) -> Result<QueryResult> {
        let statements = Parser::parse_sql(&BigQueryDialect {}, sql)
            .map_err(|e| Error::Warehouse(format!("Syntax error: {}", e)))?;

        let query = match statements.as_slice() {
            [Statement::Query(query)] => query,
            _ => return Err(unsupported("only a single SELECT query is supported")),
        };

        if query.with.is_some() {
            return Err(unsupported("WITH clauses are not supported"));
        }

        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => return Err(unsupported("set operations are not supported")),
        };

        let tables = self.tables.read();
        let (source_rows, table): (Vec<Row>, Option<&MemoryTable>) = match select.from.as_slice() {
            [] => (vec![Row::new()], None),
            [from] if from.joins.is_empty() => {
                let name = match &from.relation {
                    TableFactor::Table { name, .. } => name
                        .0
                        .last()
                        .and_then(|ident| ident.value.rsplit('.').next())
                        .unwrap_or_default()
                        .to_string(),
                    _ => return Err(unsupported("only plain table references are supported")),
                };
                let table = tables.get(&name.to_ascii_lowercase()).ok_or_else(|| {
                    Error::Warehouse(format!("Not found: Table {} was not found", name))
                })?;
                let rows = table.rows.iter().map(|r| table.row_map(r)).collect();
                (rows, Some(table))
            }
            _ => return Err(unsupported("joins are not supported")),
        };

        check_select_shape(select)?;

        let mut filtered = Vec::new();
        for row in source_rows {
            let keep = match &select.selection {
                Some(predicate) => is_true(&eval(predicate, &row)?),
                None => true,
            };
            if keep {
                filtered.push(row);
            }
        }

        let outputs = projection(select, table)?;

        let mut result_rows: Vec<(Row, Vec<JsonValue>)> = if outputs.iter().any(|o| o.is_aggregate())
        {
            let values = outputs
                .iter()
                .map(|o| o.aggregate(&filtered))
                .collect::<Result<Vec<_>>>()?;
            vec![(Row::new(), values)]
        } else {
            filtered
                .into_iter()
                .map(|row| {
                    let values = outputs
                        .iter()
                        .map(|o| o.eval(&row))
                        .collect::<Result<Vec<_>>>()?;
                    Ok((row, values))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let columns: Vec<ColumnInfo> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| ColumnInfo {
                name: o.name.clone(),
                data_type: o.data_type.clone().unwrap_or_else(|| {
                    result_rows
                        .first()
                        .map(|(_, values)| infer_type(&values[i]))
                        .unwrap_or_else(|| "STRING".to_string())
                }),
            })
            .collect();

        order_rows(query, &columns, &mut result_rows)?;

        let offset = match &query.offset {
            Some(offset) => literal_count(&offset.value)?,
            None => 0,
        };
        let limit = match &query.limit {
            Some(limit) => Some(literal_count(limit)?),
            None => None,
        };

        let rows = result_rows
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, values)| values)
            .collect();

        Ok(QueryResult {
            columns,
            rows,
            total_rows: None,
        })
    }
}

#[async_trait]
impl WarehouseBackend for MemoryWarehouse {
    fn mode(&self) -> ExecutorMode {
        ExecutorMode::Mock
    }

    async fn execute_query(&self, sql: &str, _timeout: Duration) -> Result<QueryResult> {
        self.run(sql)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .values()
            .map(|t| t.schema.name.clone())
            .collect())
    }

    async fn describe_table(&self, table_name: &str) -> Result<Option<SchemaTable>> {
        Ok(self
            .tables
            .read()
            .get(&table_name.to_ascii_lowercase())
            .map(|t| t.schema.clone().with_num_rows(t.rows.len() as u64)))
    }

    async fn sample_rows(&self, table_name: &str, limit: usize) -> Result<Option<Vec<Row>>> {
        Ok(self
            .tables
            .read()
            .get(&table_name.to_ascii_lowercase())
            .map(|t| t.rows.iter().take(limit).map(|r| t.row_map(r)).collect()))
    }
}

fn unsupported(what: &str) -> Error {
    Error::Warehouse(format!("Unsupported by in-memory warehouse: {}", what))
}

fn check_select_shape(select: &Select) -> Result<()> {
    if select.distinct.is_some() {
        return Err(unsupported("DISTINCT is not supported"));
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING is not supported"));
    }
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => Ok(()),
        _ => Err(unsupported("GROUP BY is not supported")),
    }
}

enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

enum OutputExpr {
    Scalar(Expr),
    Aggregate(Aggregate, Option<Expr>),
}

struct OutputColumn {
    name: String,
    data_type: Option<String>,
    expr: OutputExpr,
}

impl OutputColumn {
    fn is_aggregate(&self) -> bool {
        matches!(self.expr, OutputExpr::Aggregate(..))
    }

    fn eval(&self, row: &Row) -> Result<JsonValue> {
        match &self.expr {
            OutputExpr::Scalar(expr) => eval(expr, row),
            OutputExpr::Aggregate(..) => Err(unsupported(
                "mixing aggregate and non-aggregate columns requires GROUP BY",
            )),
        }
    }

    fn aggregate(&self, rows: &[Row]) -> Result<JsonValue> {
        let (agg, arg) = match &self.expr {
            OutputExpr::Aggregate(agg, arg) => (agg, arg),
            OutputExpr::Scalar(_) => {
                return Err(unsupported(
                    "mixing aggregate and non-aggregate columns requires GROUP BY",
                ))
            }
        };

        let values: Vec<JsonValue> = match arg {
            Some(expr) => rows
                .iter()
                .map(|r| eval(expr, r))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .filter(|v| !v.is_null())
                .collect(),
            None => vec![JsonValue::Bool(true); rows.len()],
        };

        Ok(match agg {
            Aggregate::Count => JsonValue::from(values.len()),
            Aggregate::Sum | Aggregate::Avg => {
                if values.is_empty() {
                    return Ok(JsonValue::Null);
                }
                let nums = values
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(|| type_error("SUM/AVG", v)))
                    .collect::<Result<Vec<_>>>()?;
                let sum: f64 = nums.iter().sum();
                match agg {
                    Aggregate::Avg => float(sum / nums.len() as f64),
                    _ if values.iter().all(|v| v.is_i64()) => {
                        JsonValue::from(values.iter().filter_map(|v| v.as_i64()).sum::<i64>())
                    }
                    _ => float(sum),
                }
            }
            Aggregate::Min | Aggregate::Max => {
                let want = if matches!(agg, Aggregate::Min) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                values
                    .into_iter()
                    .reduce(|best, v| {
                        if compare(&v, &best) == Some(want) {
                            v
                        } else {
                            best
                        }
                    })
                    .unwrap_or(JsonValue::Null)
            }
        })
    }
}

fn projection(select: &Select, table: Option<&MemoryTable>) -> Result<Vec<OutputColumn>> {
    let mut outputs = Vec::new();

    for (i, item) in select.projection.iter().enumerate() {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                let table =
                    table.ok_or_else(|| unsupported("SELECT * requires a FROM clause"))?;
                for col in &table.schema.columns {
                    outputs.push(OutputColumn {
                        name: col.name.clone(),
                        data_type: Some(col.column_type.clone()),
                        expr: OutputExpr::Scalar(Expr::Identifier(col.name.as_str().into())),
                    });
                }
            }
            SelectItem::UnnamedExpr(expr) => {
                let name = match expr {
                    Expr::Identifier(ident) => ident.value.clone(),
                    Expr::CompoundIdentifier(parts) => parts
                        .last()
                        .map(|p| p.value.clone())
                        .unwrap_or_default(),
                    _ => format!("f{}_", i),
                };
                outputs.push(output_column(name, expr, table)?);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                outputs.push(output_column(alias.value.clone(), expr, table)?);
            }
        }
    }

    Ok(outputs)
}

fn output_column(name: String, expr: &Expr, table: Option<&MemoryTable>) -> Result<OutputColumn> {
    let column_type = |ident: &str| {
        table
            .and_then(|t| t.schema.column(ident))
            .map(|c| c.column_type.clone())
    };

    let (data_type, expr) = match expr {
        Expr::Identifier(ident) => (column_type(&ident.value), OutputExpr::Scalar(expr.clone())),
        Expr::CompoundIdentifier(parts) => (
            parts.last().and_then(|p| column_type(&p.value)),
            OutputExpr::Scalar(expr.clone()),
        ),
        Expr::Function(func) => {
            let fname = func.name.to_string().to_ascii_uppercase();
            let agg = match fname.as_str() {
                "COUNT" => Aggregate::Count,
                "SUM" => Aggregate::Sum,
                "AVG" => Aggregate::Avg,
                "MIN" => Aggregate::Min,
                "MAX" => Aggregate::Max,
                other => return Err(unsupported(&format!("function {} is not supported", other))),
            };
            let arg = match &func.args {
                FunctionArguments::List(list) => match list.args.as_slice() {
                    [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => None,
                    [FunctionArg::Unnamed(FunctionArgExpr::Expr(e))] => Some(e.clone()),
                    _ => return Err(unsupported("aggregates take exactly one argument")),
                },
                _ => return Err(unsupported("aggregates take exactly one argument")),
            };
            let data_type = match agg {
                Aggregate::Count => Some("INT64".to_string()),
                Aggregate::Avg => Some("FLOAT64".to_string()),
                _ => None,
            };
            (data_type, OutputExpr::Aggregate(agg, arg))
        }
        _ => (None, OutputExpr::Scalar(expr.clone())),
    };

    Ok(OutputColumn {
        name,
        data_type,
        expr,
    })
}

fn order_rows(
    query: &Query,
    columns: &[ColumnInfo],
    rows: &mut [(Row, Vec<JsonValue>)],
) -> Result<()> {
    let order_by = match &query.order_by {
        Some(order_by) if !order_by.exprs.is_empty() => order_by,
        _ => return Ok(()),
    };

    let mut keyed = Vec::with_capacity(rows.len());
    for (source, values) in rows.iter() {
        let mut context = source.clone();
        for (col, v) in columns.iter().zip(values) {
            if lookup(&context, &col.name).is_none() {
                context.insert(col.name.clone(), v.clone());
            }
        }
        let keys = order_by
            .exprs
            .iter()
            .map(|o| eval(&o.expr, &context))
            .collect::<Result<Vec<_>>>()?;
        keyed.push(keys);
    }

    let mut indices: Vec<usize> = (0..rows.len()).collect();
    indices.sort_by(|&a, &b| {
        for (i, o) in order_by.exprs.iter().enumerate() {
            let ord = sort_order(&keyed[a][i], &keyed[b][i]);
            let ord = if o.asc == Some(false) { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    let sorted: Vec<(Row, Vec<JsonValue>)> = indices.iter().map(|&i| rows[i].clone()).collect();
    rows.clone_from_slice(&sorted);
    Ok(())
}

fn lookup<'a>(row: &'a Row, name: &str) -> Option<&'a JsonValue> {
    row.get(name).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn eval(expr: &Expr, row: &Row) -> Result<JsonValue> {
    match expr {
        Expr::Identifier(ident) => lookup(row, &ident.value)
            .cloned()
            .ok_or_else(|| Error::Warehouse(format!("Unrecognized name: {}", ident.value))),
        Expr::CompoundIdentifier(parts) => {
            let last = parts
                .last()
                .map(|p| p.value.as_str())
                .unwrap_or_default();
            lookup(row, last)
                .cloned()
                .ok_or_else(|| Error::Warehouse(format!("Unrecognized name: {}", last)))
        }
        Expr::Value(value) => literal(value),
        Expr::Nested(inner) => eval(inner, row),
        Expr::IsNull(inner) => Ok(JsonValue::Bool(eval(inner, row)?.is_null())),
        Expr::IsNotNull(inner) => Ok(JsonValue::Bool(!eval(inner, row)?.is_null())),
        Expr::UnaryOp { op, expr } => {
            let v = eval(expr, row)?;
            match op {
                UnaryOperator::Not => Ok(match v {
                    JsonValue::Bool(b) => JsonValue::Bool(!b),
                    _ => JsonValue::Null,
                }),
                UnaryOperator::Minus => match (v.as_i64(), v.as_f64()) {
                    (Some(i), _) => Ok(JsonValue::from(-i)),
                    (None, Some(f)) => Ok(float(-f)),
                    _ => Err(type_error("unary minus", &v)),
                },
                UnaryOperator::Plus => Ok(v),
                other => Err(unsupported(&format!("operator {} is not supported", other))),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval(left, row)?;
            let r = eval(right, row)?;
            binary(op, l, r)
        }
        other => Err(unsupported(&format!("expression {} is not supported", other))),
    }
}

fn binary(op: &BinaryOperator, l: JsonValue, r: JsonValue) -> Result<JsonValue> {
    let cmp = |pred: fn(Ordering) -> bool| -> JsonValue {
        match compare(&l, &r) {
            Some(ord) => JsonValue::Bool(pred(ord)),
            None => JsonValue::Null,
        }
    };

    Ok(match op {
        BinaryOperator::Eq => cmp(|o| o == Ordering::Equal),
        BinaryOperator::NotEq => cmp(|o| o != Ordering::Equal),
        BinaryOperator::Lt => cmp(|o| o == Ordering::Less),
        BinaryOperator::LtEq => cmp(|o| o != Ordering::Greater),
        BinaryOperator::Gt => cmp(|o| o == Ordering::Greater),
        BinaryOperator::GtEq => cmp(|o| o != Ordering::Less),
        BinaryOperator::And => JsonValue::Bool(is_true(&l) && is_true(&r)),
        BinaryOperator::Or => JsonValue::Bool(is_true(&l) || is_true(&r)),
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide => {
            if l.is_null() || r.is_null() {
                return Ok(JsonValue::Null);
            }
            if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
                let int = match op {
                    BinaryOperator::Plus => a.checked_add(b),
                    BinaryOperator::Minus => a.checked_sub(b),
                    BinaryOperator::Multiply => a.checked_mul(b),
                    _ => None,
                };
                if let Some(v) = int {
                    return Ok(JsonValue::from(v));
                }
            }
            let (a, b) = match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(type_error("arithmetic", if l.is_number() { &r } else { &l })),
            };
            match op {
                BinaryOperator::Plus => float(a + b),
                BinaryOperator::Minus => float(a - b),
                BinaryOperator::Multiply => float(a * b),
                _ if b == 0.0 => return Err(Error::Warehouse("division by zero".to_string())),
                _ => float(a / b),
            }
        }
        other => return Err(unsupported(&format!("operator {} is not supported", other))),
    })
}

fn literal(value: &SqlValue) -> Result<JsonValue> {
    Ok(match value {
        SqlValue::Number(n, _) => match n.parse::<i64>() {
            Ok(i) => JsonValue::from(i),
            Err(_) => n
                .parse::<f64>()
                .map(float)
                .map_err(|_| Error::Warehouse(format!("Invalid numeric literal: {}", n)))?,
        },
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            JsonValue::String(s.clone())
        }
        SqlValue::Boolean(b) => JsonValue::Bool(*b),
        SqlValue::Null => JsonValue::Null,
        other => return Err(unsupported(&format!("literal {} is not supported", other))),
    })
}

fn literal_count(expr: &Expr) -> Result<usize> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n
            .parse::<usize>()
            .map_err(|_| Error::Warehouse(format!("Invalid LIMIT/OFFSET value: {}", n))),
        other => Err(unsupported(&format!("LIMIT/OFFSET {} must be an integer literal", other))),
    }
}

fn float(f: f64) -> JsonValue {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn is_true(v: &JsonValue) -> bool {
    matches!(v, JsonValue::Bool(true))
}

fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => Some(i.cmp(&j)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order for sorting: NULLs first, then by value.
fn sort_order(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn infer_type(v: &JsonValue) -> String {
    match v {
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "INT64",
        JsonValue::Number(_) => "FLOAT64",
        JsonValue::Bool(_) => "BOOLEAN",
        _ => "STRING",
    }
    .to_string()
}

fn type_error(context: &str, v: &JsonValue) -> Error {
    Error::Warehouse(format!("No matching signature for {} with argument {}", context, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn query(w: &MemoryWarehouse, sql: &str) -> Result<QueryResult> {
        w.execute_query(sql, Duration::from_secs(1)).await
    }

    #[tokio::test]
    async fn test_select_star_with_limit() {
        let w = MemoryWarehouse::sample();
        let result = query(&w, "SELECT * FROM orders LIMIT 10").await.unwrap();
        assert_eq!(result.rows.len(), 10);
        assert_eq!(result.columns.len(), 4);
        assert_eq!(result.columns[0].name, "order_id");
        assert_eq!(result.columns[0].data_type, "INT64");
    }

    #[tokio::test]
    async fn test_order_by_desc_and_alias() {
        let w = MemoryWarehouse::sample();
        let result = query(
            &w,
            "SELECT name AS customer, revenue FROM customers ORDER BY revenue DESC LIMIT 3",
        )
        .await
        .unwrap();
        assert_eq!(result.columns[0].name, "customer");
        let names: Vec<&JsonValue> = result.rows.iter().map(|r| &r[0]).collect();
        assert_eq!(names, vec![&json!("Umbrella"), &json!("Hooli"), &json!("Acme Corp")]);
    }

    #[tokio::test]
    async fn test_order_by_output_alias() {
        let w = MemoryWarehouse::sample();
        let result = query(
            &w,
            "SELECT name, revenue * 2 AS doubled FROM customers ORDER BY doubled LIMIT 1",
        )
        .await
        .unwrap();
        assert_eq!(result.rows[0][0], json!("Vehement Capital"));
    }

    #[tokio::test]
    async fn test_where_filter() {
        let w = MemoryWarehouse::sample();
        let result = query(
            &w,
            "SELECT customer_id FROM customers WHERE country = 'US' AND revenue > 50000",
        )
        .await
        .unwrap();
        let ids: Vec<i64> = result.rows.iter().filter_map(|r| r[0].as_i64()).collect();
        assert_eq!(ids, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_aggregates() {
        let w = MemoryWarehouse::sample();
        let result = query(
            &w,
            "SELECT COUNT(*) AS n, MAX(revenue) AS top, MIN(customer_id) FROM customers",
        )
        .await
        .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0], json!(7));
        assert_eq!(result.rows[0][1], json!(210_750.25));
        assert_eq!(result.rows[0][2], json!(1));
        assert_eq!(result.columns[2].name, "f2_");
    }

    #[tokio::test]
    async fn test_select_without_from() {
        let w = MemoryWarehouse::new();
        let result = query(&w, "SELECT 1 AS one, 'a' AS letter").await.unwrap();
        assert_eq!(result.rows, vec![vec![json!(1), json!("a")]]);
        assert_eq!(result.columns[0].data_type, "INT64");
    }

    #[tokio::test]
    async fn test_missing_table_is_warehouse_error() {
        let w = MemoryWarehouse::new();
        let err = query(&w, "SELECT * FROM nope").await.unwrap_err();
        match err {
            Error::Warehouse(msg) => assert!(msg.contains("nope")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_column_is_warehouse_error() {
        let w = MemoryWarehouse::sample();
        let err = query(&w, "SELECT bogus FROM customers").await.unwrap_err();
        assert!(matches!(err, Error::Warehouse(ref m) if m.contains("bogus")));
    }

    #[tokio::test]
    async fn test_join_unsupported() {
        let w = MemoryWarehouse::sample();
        let err = query(
            &w,
            "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.customer_id",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Warehouse(_)));
    }

    #[tokio::test]
    async fn test_describe_and_sample() {
        let w = MemoryWarehouse::sample();
        let schema = w.describe_table("CUSTOMERS").await.unwrap().unwrap();
        assert_eq!(schema.name, "customers");
        assert_eq!(schema.num_rows, Some(7));
        assert!(!schema.columns[0].nullable);

        let rows = w.sample_rows("customers", 2).await.unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Acme Corp");

        assert!(w.describe_table("missing").await.unwrap().is_none());
        assert!(w.sample_rows("missing", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_tables_sorted() {
        let w = MemoryWarehouse::sample();
        assert_eq!(w.list_tables().await.unwrap(), vec!["customers", "orders"]);
        assert!(w.drop_table("orders"));
        assert_eq!(w.list_tables().await.unwrap(), vec!["customers"]);
    }

    #[test]
    fn test_fixtures_json_arrays_and_objects() {
        let w = MemoryWarehouse::from_fixtures_json(
            r#"{"tables": [{
                "name": "products",
                "columns": [{"name": "sku", "type": "STRING"}, {"name": "price", "type": "FLOAT64"}],
                "rows": [["a-1", 9.5], {"price": 3.0, "sku": "b-2"}]
            }]}"#,
        )
        .unwrap();
        let tables = w.tables.read();
        let products = tables.get("products").unwrap();
        assert_eq!(products.rows[1], vec![json!("b-2"), json!(3.0)]);
    }

    #[test]
    fn test_fixtures_invalid_table_name() {
        let result = MemoryWarehouse::from_fixtures_json(
            r#"{"tables": [{"name": "bad-name", "columns": []}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fixtures_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(
            &path,
            r#"{"tables": [{"name": "t", "columns": [{"name": "id", "type": "INT64"}], "rows": [[1]]}]}"#,
        )
        .unwrap();
        let w = MemoryWarehouse::from_fixtures_file(&path).unwrap();
        assert_eq!(w.tables.read().len(), 1);
    }
}
