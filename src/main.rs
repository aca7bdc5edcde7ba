//! SQL Bridge - command line entry point.
//!
//! Opens one handle, runs a single statement through it and prints the
//! result as JSON on stdout. Logs go to stderr.

use clap::Parser;
use sql_bridge::config::{Command, Config};
use sql_bridge::models::args_from_json;
use sql_bridge::{Bridge, DatabaseHandle, DbResult, Value};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Positional arguments are JSON scalars; anything that does not parse as
/// JSON is taken as a plain string.
fn parse_args(raw: &[String]) -> DbResult<Vec<Value>> {
    args_from_json(raw.iter().map(|arg| {
        serde_json::from_str(arg).unwrap_or_else(|_| serde_json::Value::String(arg.clone()))
    }))
}

async fn run(
    db: &DatabaseHandle,
    command: &Command,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Exec { statement, args } => {
            let args = parse_args(args)?;
            let summary = match timeout {
                Some(t) => db.exec_with_timeout(t, statement, &args).await?,
                None => db.exec(statement, &args).await?,
            };
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Query { statement, args } => {
            let args = parse_args(args)?;
            let rows = match timeout {
                Some(t) => db.query_with_timeout(t, statement, &args).await?,
                None => db.query(statement, &args).await?,
            };
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
            info!(rows = rows.len(), "Query returned");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!(
        driver = %config.driver,
        "Starting SQL Bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let bridge = Bridge::with_default_drivers()?;

    if let Some(path) = &config.tls_config {
        let raw = std::fs::read_to_string(path)?;
        bridge.load_tls_json(serde_json::from_str(&raw)?)?;
    }

    let options = config.connection_options()?;
    let timeout = config.statement_timeout()?;

    let db = bridge
        .open(config.driver.as_str(), &config.dsn, Some(options))
        .await?;

    let result = run(&db, &config.command, timeout).await;
    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Statement failed");
        return Err(e);
    }
    Ok(())
}
