use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::validation::PolicyRule;

pub fn record_rpc_request(method: &str) {
    counter!("rpc_requests_total", "method" => method.to_string()).increment(1);
}

pub fn record_rpc_success(method: &str) {
    counter!("rpc_requests_success_total", "method" => method.to_string()).increment(1);
}

pub fn record_rpc_error(method: &str, code: i32) {
    counter!("rpc_requests_error_total", "method" => method.to_string(), "code" => code.to_string()).increment(1);
}

pub fn record_rpc_duration(method: &str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!("rpc_request_duration_seconds", "method" => method.to_string()).record(duration);
}

pub fn record_tool_call(tool: &'static str, outcome: &'static str, start: Instant) {
    counter!("tool_calls_total", "tool" => tool, "outcome" => outcome).increment(1);
    histogram!("tool_call_duration_seconds", "tool" => tool).record(start.elapsed().as_secs_f64());
}

/// `None` means the statement was accepted.
pub fn record_validation(rejected_by: Option<PolicyRule>) {
    match rejected_by {
        None => counter!("validations_accepted_total").increment(1),
        Some(rule) => {
            counter!("validations_rejected_total", "rule" => rule.as_str()).increment(1)
        }
    }
}

pub fn record_translation_attempt() {
    counter!("translation_attempts_total").increment(1);
}

pub fn record_query_executed(elapsed_ms: u64) {
    counter!("queries_executed_total").increment(1);
    histogram!("query_duration_seconds").record(elapsed_ms as f64 / 1000.0);
}

pub fn record_query_truncated() {
    counter!("queries_truncated_total").increment(1);
}

pub fn record_query_timeout() {
    counter!("queries_timed_out_total").increment(1);
}

pub fn record_schema_refresh() {
    counter!("schema_refreshes_total").increment(1);
}

pub fn set_cached_tables(count: usize) {
    gauge!("catalog_cached_tables").set(count as f64);
}

pub fn set_history_size(count: usize) {
    gauge!("history_entries").set(count as f64);
}
