use std::sync::atomic::{AtomicU64, Ordering};

use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

fn is_unix_socket(server: &str) -> Option<&str> {
    if let Some(path) = server.strip_prefix("unix://") {
        return Some(path);
    }
    if server.starts_with('/') || server.starts_with('.') {
        return Some(server);
    }
    None
}

#[derive(Parser)]
#[command(name = "sqlgenius-client")]
#[command(about = "Command-line client for sqlgenius-server")]
struct Args {
    #[arg(long, default_value = "ws://localhost:3000")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Ping,
    Health,
    /// Ask a question in natural language
    Ask {
        question: String,
    },
    /// Run a read-only SQL statement
    Sql {
        sql: String,
    },
    Tables,
    Schema {
        table_name: String,
    },
    Sample {
        table_name: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    Refresh,
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    Call {
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

async fn send_request(server: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    if let Some(path) = is_unix_socket(server) {
        return send_request_unix(path, method, params).await;
    }
    send_request_ws(server, method, params).await
}

async fn send_request_unix(path: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = UnixStream::connect(path).await?;
    let (reader, mut writer) = stream.into_split();

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": next_id()
    });

    writer.write_all(request.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut lines = BufReader::new(reader).lines();
    if let Some(line) = lines.next_line().await? {
        let response: Value = serde_json::from_str(&line)?;
        return Ok(response);
    }

    anyhow::bail!("No response received")
}

async fn send_request_ws(server: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let (ws_stream, _) = connect_async(server).await?;
    let (mut write, mut read) = ws_stream.split();

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": next_id()
    });

    write.send(Message::Text(request.to_string())).await?;

    if let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let response: Value = serde_json::from_str(&text)?;
                return Ok(response);
            }
            _ => anyhow::bail!("Unexpected message type"),
        }
    }

    anyhow::bail!("No response received")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (method, params): (String, Value) = match args.command {
        Command::Ping => ("sql.ping".into(), json!({})),
        Command::Health => ("sql.health".into(), json!({})),
        Command::Ask { question } => (
            "sql.askNaturalLanguage".into(),
            json!({"question": question}),
        ),
        Command::Sql { sql } => ("sql.runSql".into(), json!({"sql": sql})),
        Command::Tables => ("sql.listTables".into(), json!({})),
        Command::Schema { table_name } => (
            "sql.getTableSchema".into(),
            json!({"tableName": table_name}),
        ),
        Command::Sample { table_name, limit } => {
            let mut params = json!({"tableName": table_name});
            if let Some(limit) = limit {
                params["limit"] = json!(limit);
            }
            ("sql.getTableSample".into(), params)
        }
        Command::Refresh => ("sql.refreshSchema".into(), json!({})),
        Command::History { limit } => {
            let mut params = json!({});
            if let Some(limit) = limit {
                params["limit"] = json!(limit);
            }
            ("sql.history".into(), params)
        }
        Command::Call { method, params } => {
            let params: Value = serde_json::from_str(&params)?;
            (method, params)
        }
    };
    let response = send_request(&args.server, &method, params).await?;

    if let Some(error) = response.get("error") {
        eprintln!("Error: {}", serde_json::to_string_pretty(error)?);
        std::process::exit(1);
    }

    if let Some(result) = response.get("result") {
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    Ok(())
}
