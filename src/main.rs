use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use fleetdesk_lib::{commands, resolve_data_dir, sync, AppContext};

#[derive(Parser)]
#[command(name = "fleetdesk", version, about = "Vehicle rental back office")]
struct Cli {
    /// Data directory (default: $FLEETDESK_DATA_DIR or ./fleetdesk-data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log in with this PIN before running the command
    #[arg(long, global = true)]
    pin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one named command with a JSON payload
    Invoke {
        /// Command name, see `fleetdesk commands`
        name: String,
        /// JSON payload, a bare string, or `-` to read stdin
        payload: Option<String>,
    },
    /// Sync with the cloud until interrupted
    Sync {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// List the available commands
    Commands,
}

/// JSON if it parses, otherwise the raw text as a JSON string.
fn parse_payload(raw: Option<String>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let raw = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read payload from stdin")?;
        buf
    } else {
        raw
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())),
    ))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_sync(ctx: &AppContext, once: bool) -> Result<()> {
    if once {
        let report = sync::force_sync(&ctx.db, &ctx.sync, &ctx.events)
            .await
            .map_err(|e| anyhow!(e))?;
        return print_json(&serde_json::to_value(report)?);
    }

    let mut events = ctx.events.subscribe();
    let handle = ctx.start_background_sync().map_err(|e| anyhow!(e))?;
    info!("Sync loop running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => info!(event = %event.name, payload = %event.payload, "event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    ctx.sync.stop();
    handle.await.context("sync loop task")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Commands = cli.command {
        for name in commands::COMMANDS {
            println!("{name}");
        }
        return Ok(());
    }

    let data_dir = resolve_data_dir(cli.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let _log_guard = fleetdesk_lib::init_logging(&data_dir);
    let ctx = AppContext::open(&data_dir).map_err(|e| anyhow!(e))?;

    if let Some(pin) = cli.pin {
        commands::dispatch(&ctx, "auth_login", Some(Value::String(pin)))
            .await
            .map_err(|e| anyhow!("login failed: {e}"))?;
    }

    match cli.command {
        Command::Invoke { name, payload } => {
            let payload = parse_payload(payload)?;
            let result = commands::dispatch(&ctx, &name, payload)
                .await
                .map_err(|e| anyhow!(e))?;
            print_json(&result)
        }
        Command::Sync { once } => run_sync(&ctx, once).await,
        Command::Commands => Ok(()),
    }
}
