//! Edge Isolate CLI
//!
//! Run a deployment once against a single request:
//!   edge-isolate run <deployment-id> --code ./dist/handler.js --env API_KEY=abc
//!
//! Store a deployment's code, then run it from the store:
//!   edge-isolate deploy <deployment-id> ./dist/handler.js
//!   edge-isolate run <deployment-id> --method POST --body '{"a":1}'
//!
//! Console output goes to stderr as `[level] <deployment> <args>`. The
//! response body goes to stdout, chunk by chunk when the handler streams.

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use edge_isolate::{
    Deployment, DeploymentStore, EdgeConfig, HostSinks, InvocationRequest, LogLevel, LogSink, SandboxManager,
    Snapshot, StreamSink,
};
use serde_json::Value;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "edge-isolate", version, about = "Per-deployment V8 isolate sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Path to an edge-isolate TOML config
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a deployment's handler once
    Run {
        /// Deployment id
        deployment_id: String,
        /// Read code from this file instead of the deployment store
        #[arg(long)]
        code: Option<PathBuf>,
        /// Environment variable exposed as process.env (KEY=VALUE, repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Request method
        #[arg(long, default_value = "GET")]
        method: String,
        /// Request URL
        #[arg(long, default_value = "http://localhost/")]
        url: String,
        /// Request header (NAME:VALUE, repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// Request body
        #[arg(long)]
        body: Option<String>,
        /// Buffer the response instead of streaming it to stdout
        #[arg(long)]
        no_stream: bool,
    },
    /// Write a deployment's code into the store
    Deploy {
        /// Deployment id
        deployment_id: String,
        /// Compiled deployment module
        code: PathBuf,
    },
    /// Remove stored deployments not in the given list
    Prune {
        /// Deployment ids to keep
        keep: Vec<String>,
    },
    /// Validate the config and the embedded startup snapshot
    Check,
}

/// Prints console output from the sandbox to stderr.
struct StderrLogSink;

impl LogSink for StderrLogSink {
    fn on_deployment_log(&self, deployment_id: &str, level: LogLevel, args: Vec<Value>) {
        let line = args.iter().map(format_arg).collect::<Vec<_>>().join(" ");
        eprintln!("[{level}] {deployment_id} {line}");
    }
}

fn format_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Writes streamed chunks to stdout as they arrive.
struct StdoutStreamSink;

impl StreamSink for StdoutStreamSink {
    fn on_receive_stream(&self, _deployment: &Deployment, done: bool, chunk: Option<Vec<u8>>) {
        let mut stdout = std::io::stdout().lock();
        if let Some(chunk) = chunk {
            let _ = stdout.write_all(&chunk);
        }
        if done {
            let _ = writeln!(stdout);
        }
        let _ = stdout.flush();
    }
}

fn load_config(path: Option<&Path>) -> Result<EdgeConfig> {
    match path {
        Some(path) => Ok(EdgeConfig::from_file(path)?),
        None => Ok(EdgeConfig::default()),
    }
}

fn parse_pair<'a>(raw: &'a str, sep: char, what: &str) -> Result<(&'a str, &'a str)> {
    raw.split_once(sep)
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("invalid {what} `{raw}`, expected NAME{sep}VALUE"))
}

struct RunArgs {
    deployment_id: String,
    code: Option<PathBuf>,
    env: Vec<String>,
    request: InvocationRequest,
    stream: bool,
}

async fn run(config: EdgeConfig, args: RunArgs) -> Result<()> {
    let mut deployment = Deployment::new(&args.deployment_id)?;
    for raw in &args.env {
        let (key, value) = parse_pair(raw, '=', "env var")?;
        deployment = deployment.with_env(key, value);
    }

    let code = match &args.code {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?,
        None => DeploymentStore::new(config.deployments_dir())?.get_code(&args.deployment_id)?,
    };

    let manager = SandboxManager::new(config.sandbox_config())?;
    let mut sinks = HostSinks::none().with_log(Arc::new(StderrLogSink));
    if args.stream {
        sinks = sinks.with_stream(Arc::new(StdoutStreamSink));
    }

    let response = manager.invoke(Arc::new(deployment), code, args.request, &sinks).await?;

    eprintln!("[status] {} {}", response.status, response.status_text);
    if !response.streamed {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&response.body)?;
        stdout.flush()?;
    }
    Ok(())
}

fn deploy(config: EdgeConfig, deployment_id: &str, code: &Path) -> Result<()> {
    let source = std::fs::read_to_string(code).with_context(|| format!("failed to read {}", code.display()))?;
    let store = DeploymentStore::new(config.deployments_dir())?;
    store.write_code(&Deployment::new(deployment_id)?, &source)?;
    eprintln!("deployed {deployment_id} to {}", store.root().display());
    Ok(())
}

fn prune(config: EdgeConfig, keep: Vec<String>) -> Result<()> {
    let store = DeploymentStore::new(config.deployments_dir())?;
    let keep: HashSet<String> = keep.into_iter().collect();
    for id in store.delete_stale(&keep)? {
        eprintln!("removed {id}");
    }
    Ok(())
}

fn check(config: EdgeConfig) -> Result<()> {
    let sandbox = config.sandbox_config();
    sandbox.validate()?;
    let snapshot = Snapshot::embedded()?;
    eprintln!(
        "ok: snapshot {} bytes, timeout {}ms, heap {}MB, max {} concurrent, {} allowed fetch origins",
        snapshot.len(),
        sandbox.timeout_ms,
        sandbox.max_heap_size / (1024 * 1024),
        sandbox.max_concurrent,
        sandbox.fetch.allowed_origins.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            deployment_id,
            code,
            env,
            method,
            url,
            headers,
            body,
            no_stream,
        } => {
            let mut request = InvocationRequest::new(method, url);
            for raw in &headers {
                let (name, value) = parse_pair(raw, ':', "header")?;
                request = request.with_header(name, value);
            }
            if let Some(body) = body {
                request = request.with_body(body);
            }
            let args = RunArgs {
                deployment_id,
                code,
                env,
                request,
                stream: !no_stream,
            };
            run(config, args).await
        }
        Commands::Deploy { deployment_id, code } => deploy(config, &deployment_id, &code),
        Commands::Prune { keep } => prune(config, keep),
        Commands::Check => check(config),
    }
}
