use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{error, info, warn};

use super::methods::RpcMethods;
use super::types::{RpcRequest, RpcResponse};
use crate::error::Error;
use crate::mediator::FailureReport;
use crate::metrics::{record_rpc_duration, record_rpc_error, record_rpc_request, record_rpc_success};

pub async fn handle_websocket(socket: WebSocket, methods: Arc<RpcMethods>) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by client");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        };

        let response = process_message(&msg, &methods).await;

        let response_text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                continue;
            }
        };

        if sender.send(Message::Text(response_text)).await.is_err() {
            error!("Failed to send response");
            break;
        }
    }
}

pub async fn process_message(msg: &str, methods: &RpcMethods) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(msg) {
        Ok(req) => req,
        Err(_) => return RpcResponse::parse_error(),
    };

    if request.jsonrpc != "2.0" {
        return RpcResponse::invalid_request();
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    let method_name = request.method.clone();
    let start = Instant::now();
    record_rpc_request(&method_name);

    let timeout = methods.request_timeout();
    let outcome = match tokio::time::timeout(timeout, methods.dispatch(&method_name, request.params)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(method = %method_name, timeout_secs = timeout.as_secs(), "Request timed out");
            Err(FailureReport::from(Error::RequestTimeout(timeout.as_secs())))
        }
    };
    record_rpc_duration(&method_name, start);

    match outcome {
        Ok(result) => {
            record_rpc_success(&method_name);
            RpcResponse::success(id, result)
        }
        Err(report) => {
            record_rpc_error(&method_name, report.code);
            if report.kind == "method_not_found" {
                RpcResponse::method_not_found(id, &method_name)
            } else {
                RpcResponse::failure(id, &report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RpcConfig};
    use crate::executor::MemoryWarehouse;
    use crate::history::QueryHistory;
    use crate::llm::ScriptedModel;
    use crate::mediator::QueryMediator;
    use serde_json::json;
    use std::time::Duration;

    fn create_test_methods_with(model: ScriptedModel, rpc_config: RpcConfig) -> Arc<RpcMethods> {
        let mediator = QueryMediator::new(
            &Config::default(),
            Arc::new(MemoryWarehouse::sample()),
            Arc::new(model),
            Arc::new(QueryHistory::in_memory()),
        );
        Arc::new(RpcMethods::with_config(Arc::new(mediator), rpc_config))
    }

    fn create_test_methods() -> Arc<RpcMethods> {
        create_test_methods_with(ScriptedModel::new(["```sql\nSELECT 1\n```"]), RpcConfig::default())
    }

    #[tokio::test]
    async fn test_process_message_parse_error() {
        let methods = create_test_methods();
        let response = process_message("not valid json", &methods).await;
        assert!(response.error.is_some());
        let err = response.error.unwrap();
        assert_eq!(err.code, -32700);
        assert_eq!(err.message, "Parse error");
    }

    #[tokio::test]
    async fn test_process_message_invalid_jsonrpc_version() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"1.0","method":"sql.ping","id":1}"#;
        let response = process_message(msg, &methods).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, -32600);
        assert_eq!(err.message, "Invalid Request");
    }

    #[tokio::test]
    async fn test_process_message_ping_success() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"sql.ping","params":{},"id":1}"#;
        let response = process_message(msg, &methods).await;
        assert!(response.error.is_none());
        assert_eq!(response.id, json!(1));
        assert_eq!(response.result.unwrap()["message"], "pong");
    }

    #[tokio::test]
    async fn test_process_message_unknown_method() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"unknown.method","params":{},"id":42}"#;
        let response = process_message(msg, &methods).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, -32601);
        assert!(err.message.contains("Method not found"));
        assert!(err.message.contains("unknown.method"));
        assert_eq!(response.id, json!(42));
    }

    #[tokio::test]
    async fn test_process_message_no_id() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"sql.ping"}"#;
        let response = process_message(msg, &methods).await;
        assert!(response.result.is_some());
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn test_process_message_rejection_has_report_data() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"sql.runSql","params":{"sql":"DELETE FROM orders"},"id":"r1"}"#;
        let response = process_message(msg, &methods).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, -32010);
        assert!(err.message.starts_with("[REJECTED]"));
        let data = err.data.unwrap();
        assert_eq!(data["status"], "REJECTED");
        assert_eq!(data["rule"], "forbidden_keyword");
        assert_eq!(response.id, json!("r1"));
    }

    #[tokio::test]
    async fn test_process_message_table_not_found() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"sql.getTableSchema","params":{"tableName":"ghosts"},"id":1}"#;
        let response = process_message(msg, &methods).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, -32002);
        assert!(err.message.starts_with("[ERROR]"));
    }

    #[tokio::test]
    async fn test_process_message_request_timeout() {
        let model = ScriptedModel::new(["```sql\nSELECT 1\n```"]).with_delay(Duration::from_secs(5));
        let methods = create_test_methods_with(
            model,
            RpcConfig {
                request_timeout_secs: 0,
            },
        );
        let msg = r#"{"jsonrpc":"2.0","method":"sql.askNaturalLanguage","params":{"question":"anything"},"id":1}"#;
        let response = process_message(msg, &methods).await;
        let err = response.error.unwrap();
        assert_eq!(err.code, -32005);

        let entries = methods.mediator().history().entries(None);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].outcome.is_success());
    }

    #[tokio::test]
    async fn test_process_message_string_id() {
        let methods = create_test_methods();
        let msg = r#"{"jsonrpc":"2.0","method":"sql.ping","params":{},"id":"my-request-id"}"#;
        let response = process_message(msg, &methods).await;
        assert_eq!(response.id, json!("my-request-id"));
    }
}
