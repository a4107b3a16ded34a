mod extract;

pub use self::extract::extract_sql;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::catalog::SchemaCatalog;
use crate::config::LlmConfig;
use crate::domain::SchemaTable;
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::metrics::record_translation_attempt;
use crate::validation::{SqlStatement, SqlValidator, ValidationResult};

/// One initial model call plus at most one corrective retry.
pub const MAX_ATTEMPTS: u32 = 2;

const DESCRIBE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct Translation {
    pub statement: SqlStatement,
    /// The model's full response, prose included.
    pub explanation: String,
    pub attempts: u32,
}

pub struct Translator {
    model: Arc<dyn LanguageModel>,
    catalog: Arc<SchemaCatalog>,
    validator: Arc<SqlValidator>,
    timeout: Duration,
    context_timeout: Duration,
    max_context_tables: usize,
}

impl Translator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        catalog: Arc<SchemaCatalog>,
        validator: Arc<SqlValidator>,
        config: &LlmConfig,
    ) -> Self {
        Self {
            model,
            catalog,
            validator,
            timeout: config.timeout(),
            context_timeout: config.context_timeout(),
            max_context_tables: config.max_context_tables.max(1),
        }
    }

    /// Produces a candidate statement. Never executes anything; the caller
    /// still has to validate the result before running it.
    pub async fn translate(&self, question: &str) -> Result<Translation> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::Translation("question is empty".into()));
        }

        let context = self.grounding_context(question).await?;
        let mut feedback: Option<String> = None;
        let mut last_failure = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            record_translation_attempt();
            let prompt = build_prompt(&context, question, feedback.as_deref());

            let response = match tokio::time::timeout(self.timeout, self.model.complete(&prompt)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    return Err(Error::Translation(format!("language model call failed: {}", e)))
                }
                Err(_) => {
                    warn!(
                        model = self.model.name(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Language model call timed out"
                    );
                    return Err(Error::Translation(format!(
                        "language model did not respond within {} ms",
                        self.timeout.as_millis()
                    )));
                }
            };

            let Some(sql) = extract_sql(&response) else {
                debug!(attempt, "Model response contained no SQL");
                last_failure = "the model response contained no SQL statement".to_string();
                feedback = Some(
                    "Your previous answer did not contain a SQL statement. Reply with exactly one SELECT statement in a ```sql code block."
                        .to_string(),
                );
                continue;
            };

            match self.validator.validate(&sql) {
                ValidationResult::Accepted(_) => {
                    debug!(attempt, "Translation produced an acceptable statement");
                    return Ok(Translation {
                        statement: SqlStatement::new(sql),
                        explanation: response,
                        attempts: attempt,
                    });
                }
                ValidationResult::Rejected(rejection) => {
                    debug!(attempt, reason = %rejection.reason, "Generated SQL rejected");
                    last_failure = format!("generated SQL was rejected: {}", rejection.reason);
                    feedback = Some(format!(
                        "Your previous SQL was rejected by the safety policy: {}. Previous SQL:\n{}\nReturn a corrected read-only SELECT statement.",
                        rejection.reason, sql
                    ));
                }
            }
        }

        Err(Error::Translation(format!(
            "no usable SQL after {} attempts: {}",
            MAX_ATTEMPTS, last_failure
        )))
    }

    /// Schema lines for the tables most relevant to `question`, gathered
    /// under the context deadline.
    async fn grounding_context(&self, question: &str) -> Result<GroundingContext> {
        match tokio::time::timeout(self.context_timeout, self.gather_context(question)).await {
            Ok(context) => context,
            Err(_) => {
                warn!(
                    timeout_ms = self.context_timeout.as_millis() as u64,
                    "Schema context timed out"
                );
                Err(Error::Translation(format!(
                    "schema context could not be gathered within {} ms",
                    self.context_timeout.as_millis()
                )))
            }
        }
    }

    /// Shortlists at most `max_context_tables` names before describing
    /// anything, so a cold catalog costs one describe per shortlisted table.
    async fn gather_context(&self, question: &str) -> Result<GroundingContext> {
        let names = self.catalog.list_tables().await?;
        let terms = question_terms(question);
        let shortlist = shortlist_tables(&names, &terms, self.max_context_tables, |name| {
            self.catalog.cached_schema(name)
        });

        let fetched: Vec<_> = stream::iter(shortlist)
            .map(|name| async move {
                let schema = self.catalog.get_schema(&name).await;
                (name, schema)
            })
            .buffered(DESCRIBE_CONCURRENCY)
            .collect()
            .await;

        let mut schemas = Vec::with_capacity(fetched.len());
        for (name, schema) in fetched {
            match schema {
                Ok(schema) => schemas.push(schema),
                Err(Error::TableNotFound(_)) => {
                    debug!(table = %name, "Table vanished while building context");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(GroundingContext {
            table_names: names,
            schemas,
        })
    }
}

struct GroundingContext {
    table_names: Vec<String>,
    schemas: Vec<Arc<SchemaTable>>,
}

fn question_terms(question: &str) -> HashSet<String> {
    question
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 3)
        .flat_map(|w| {
            let lower = w.to_lowercase();
            let singular = lower.strip_suffix('s').map(str::to_string);
            std::iter::once(lower).chain(singular)
        })
        .collect()
}

fn name_words(name: &str) -> Vec<String> {
    name.to_lowercase()
        .split('_')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn name_relevance(table_name: &str, terms: &HashSet<String>) -> usize {
    name_words(table_name)
        .iter()
        .filter(|w| {
            terms.contains(*w) || w.strip_suffix('s').is_some_and(|s| terms.contains(s))
        })
        .count()
        * 3
}

fn relevance(schema: &SchemaTable, terms: &HashSet<String>) -> usize {
    let column_hits = schema
        .columns
        .iter()
        .filter(|c| name_words(&c.name).iter().any(|w| terms.contains(w)))
        .count();

    name_relevance(&schema.name, terms) + column_hits
}

/// Picks the tables worth describing for a question, in catalog order.
/// Uncached tables are ranked by name alone; tables whose schema is already
/// cached also score on their column names.
fn shortlist_tables(
    names: &[String],
    terms: &HashSet<String>,
    budget: usize,
    cached: impl Fn(&str) -> Option<Arc<SchemaTable>>,
) -> Vec<String> {
    if names.len() <= budget {
        return names.to_vec();
    }

    let mut scored: Vec<(usize, usize, &String)> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let score = match cached(name) {
                Some(schema) => relevance(&schema, terms),
                None => name_relevance(name, terms),
            };
            (score, i, name)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.truncate(budget);
    scored.sort_by_key(|(_, i, _)| *i);
    scored.into_iter().map(|(_, _, name)| name.clone()).collect()
}

fn build_prompt(context: &GroundingContext, question: &str, feedback: Option<&str>) -> String {
    let mut prompt = String::from(
        "You translate questions into BigQuery Standard SQL over a read-only dataset.\n",
    );
    prompt.push_str(&format!(
        "Available tables: {}.\n",
        context.table_names.join(", ")
    ));
    if !context.schemas.is_empty() {
        prompt.push_str("Table schemas:\n");
        for schema in &context.schemas {
            prompt.push_str("- ");
            prompt.push_str(&schema.to_prompt_line());
            prompt.push('\n');
        }
    }
    prompt.push_str(&format!("User query: {}\n", question));
    prompt.push_str(
        "Write exactly one SELECT statement (optionally introduced by WITH) that answers the query using only the tables and columns above. \
         Never modify data. Return the statement in a ```sql code block, followed by a one-paragraph explanation.\n",
    );
    if let Some(feedback) = feedback {
        prompt.push_str(feedback);
        prompt.push('\n');
    }
    prompt
}
