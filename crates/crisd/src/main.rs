//! crisd - line-oriented Cris command host
//!
//! Reads wire commands (`["Name", {...}]`, one per line) and prints one JSON
//! line per command with the envelope and the status code a transport would
//! answer with.
//!
//! ## Commands
//!
//! - `run`: process commands from a file or stdin
//! - `shapes`: list the hosted command shapes

mod demo;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cris_core::{AuthenticationInfo, CrisConfig, CrisService, RequestContext};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "crisd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Line-oriented Cris command host", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Service configuration (JSON); defaults apply when omitted
    #[arg(short, long, global = true, env = "CRIS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process wire commands, one per line
    Run {
        /// Input file (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Request culture
        #[arg(long)]
        culture: Option<String>,

        /// Type filter name sent with each request
        #[arg(long)]
        type_filter: Option<String>,

        /// Device identifier of the anonymous caller
        #[arg(long, default_value = "crisd")]
        device: String,
    },

    /// List hosted command shapes
    Shapes,
}

#[derive(Serialize)]
struct Reply {
    status: u16,
    #[serde(rename = "typeFilterName")]
    type_filter_name: String,
    envelope: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cris_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;
    let registry = demo::registry(&config)?;
    let service = CrisService::builder(registry)
        .config(config)
        .start()
        .context("failed to start cris service")?;

    let outcome = match cli.command {
        Commands::Run {
            input,
            culture,
            type_filter,
            device,
        } => {
            let mut request = RequestContext::new(AuthenticationInfo::anonymous(device));
            if let Some(culture) = culture {
                request = request.with_culture(culture);
            }
            if let Some(name) = type_filter {
                request = request.with_type_filter(name);
            }
            cmd_run(&service, &request, input.as_deref()).await
        }
        Commands::Shapes => cmd_shapes(&service).await,
    };

    service.shutdown().await;
    outcome
}

fn load_config(path: Option<&Path>) -> Result<CrisConfig> {
    let config = match path {
        Some(path) => CrisConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => CrisConfig::default(),
    };
    Ok(config.with_env_overrides())
}

async fn cmd_run(service: &CrisService, request: &RequestContext, input: Option<&Path>) -> Result<()> {
    let processed = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            process_lines(service, request, BufReader::new(file)).await?
        }
        None => process_lines(service, request, BufReader::new(tokio::io::stdin())).await?,
    };
    info!(commands = processed, "input processed");
    Ok(())
}

async fn process_lines<R>(service: &CrisService, request: &RequestContext, reader: R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stdout = tokio::io::stdout();
    let mut processed = 0;
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let response = service.handle_request(line.as_bytes(), request).await;
        let reply = Reply {
            status: demo::status_code(&response.result),
            type_filter_name: response.type_filter_name,
            envelope: serde_json::to_value(&response.result)?,
        };
        debug!(status = reply.status, "command processed");
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("failed to write reply")?;
        processed += 1;
    }
    stdout.flush().await?;
    Ok(processed)
}

async fn cmd_shapes(service: &CrisService) -> Result<()> {
    let mut shapes: Vec<Value> = service
        .registry()
        .shapes()
        .map(|shape| {
            json!({
                "name": shape.name(),
                "capabilities": shape.capabilities(),
                "ambientFields": shape.ambient_fields(),
                "resultType": shape.result_type().to_string(),
                "hasHandler": shape.handler().is_some(),
            })
        })
        .collect();
    shapes.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    println!("{}", serde_json::to_string_pretty(&shapes)?);
    Ok(())
}
