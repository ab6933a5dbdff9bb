//! portrpc-call
//!
//! Calls one server function and prints the result as JSON.
//!
//! Usage: `portrpc-call <command> [ARG...] [NAME=VALUE...]`
//!
//! Each argument is parsed as JSON, falling back to a plain string.
//! Connection settings come from the `PORTRPC_*` environment variables.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use portrpc_client::logging::init_logging;
use portrpc_client::{Client, ClientConfig};
use portrpc_core::{from_json, to_plain_json, Value};
use serde_json::Value as JsonValue;
use tracing::{error, info};

fn parse_arg(raw: &str) -> Value {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(json) => from_json(&json),
        Err(_) => Value::str(raw),
    }
}

fn parse_args(raw: &[String]) -> (Vec<Value>, IndexMap<String, Value>) {
    let mut args = Vec::new();
    let mut kwargs = IndexMap::new();
    for arg in raw {
        match arg.split_once('=') {
            Some((name, value)) if is_identifier(name) => {
                kwargs.insert(name.to_string(), parse_arg(value));
            }
            _ => args.push(parse_arg(arg)),
        }
    }
    (args, kwargs)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("PORTRPC_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    init_logging(&log_dir, "portrpc-call")?;

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = argv.split_first() else {
        bail!("usage: portrpc-call <command> [ARG...] [NAME=VALUE...]");
    };
    let (args, kwargs) = parse_args(rest);

    let config = ClientConfig::from_env().context("Failed to read configuration")?;
    info!("Calling {} on {}", command, config.stream_url);
    let client = Client::new(config).context("Failed to build client")?;

    let result = client.call(command, args, kwargs).await;
    client.close().await;

    match result {
        Ok(value) => {
            match to_plain_json(&value) {
                Some(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                None => println!("{:?}", value),
            }
            Ok(())
        }
        Err(e) => {
            error!("Call failed: {}", e);
            Err(e).context(format!("{} failed", command))
        }
    }
}
