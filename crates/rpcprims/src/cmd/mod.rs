use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use rpcprims_session::Client;
use tracing::debug;

use crate::exit::{io_error, CliError, CliResult};
use crate::output::OutputFormat;

pub mod bench;
pub mod call;
pub mod notify;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an echo server over TCP.
    Serve(ServeArgs),
    /// Make one call and print the reply.
    Call(CallArgs),
    /// Send one notify.
    Notify(NotifyArgs),
    /// Measure call throughput through a client pool.
    Bench(BenchArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, format)),
        Command::Call(args) => block_on(call::run(args, format)),
        Command::Notify(args) => block_on(notify::run(args)),
        Command::Bench(args) => block_on(bench::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F: Future<Output = CliResult<i32>>>(future: F) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;
    runtime.block_on(future)
}

/// Disconnect after a one-shot command. A stop failure is only logged.
async fn disconnect(client: &Client) {
    if let Err(err) = client.stop().await {
        debug!(error = %err, "client stop failed");
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:9000")]
    pub addr: String,
    /// Refuse connections beyond this many live sessions.
    #[arg(long)]
    pub max_sessions: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PayloadArgs {
    /// JSON payload, sent through the JSON codec.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read a raw payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Server address.
    pub addr: String,
    /// Method to call.
    pub method: String,
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// Reply deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Server address.
    pub addr: String,
    /// Method to notify.
    pub method: String,
    #[command(flatten)]
    pub payload: PayloadArgs,
    /// Write deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Server address.
    pub addr: String,
    /// Method to call.
    #[arg(long, default_value = "/echo/string")]
    pub method: String,
    /// Payload size in bytes.
    #[arg(long, default_value = "64")]
    pub payload_size: usize,
    /// Total number of calls.
    #[arg(long, default_value = "10000")]
    pub count: u64,
    /// Concurrent callers.
    #[arg(long, default_value = "16")]
    pub concurrency: usize,
    /// Connections in the client pool.
    #[arg(long, default_value = "4")]
    pub pool: usize,
    /// Per-call deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// A request body as given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl PayloadArgs {
    pub fn resolve(&self) -> CliResult<Payload> {
        if let Some(json) = &self.json {
            let value = serde_json::from_str(json)
                .map_err(|err| CliError::usage(format!("--json is not valid JSON: {err}")))?;
            return Ok(Payload::Json(value));
        }
        if let Some(data) = &self.data {
            return Ok(Payload::Text(data.clone()));
        }
        if let Some(path) = &self.file {
            return fs::read(path)
                .map(Payload::Bytes)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
        }
        Ok(Payload::Text(String::new()))
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::usage("duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::usage(format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::usage("duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
