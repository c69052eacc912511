use std::io::{IsTerminal, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// The outcome of one `call`, as printed by the CLI.
#[derive(Debug)]
pub struct Reply<'a> {
    pub method: &'a str,
    pub peer: &'a str,
    pub session_id: u64,
    pub elapsed: Duration,
    pub payload: &'a [u8],
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    method: &'a str,
    peer: &'a str,
    session_id: u64,
    elapsed_ms: f64,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_reply(reply: &Reply<'_>, format: OutputFormat) {
    let elapsed_ms = reply.elapsed.as_secs_f64() * 1000.0;
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                method: reply.method,
                peer: reply.peer,
                session_id: reply.session_id,
                elapsed_ms,
                payload_size: reply.payload.len(),
                payload: payload_preview(reply.payload),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "SIZE", "PEER", "ELAPSED", "PAYLOAD"])
                .add_row(vec![
                    reply.method.to_string(),
                    reply.payload.len().to_string(),
                    reply.peer.to_string(),
                    format!("{elapsed_ms:.3}ms"),
                    payload_preview(reply.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={} size={} peer={} elapsed={elapsed_ms:.3}ms payload={}",
                reply.method,
                reply.payload.len(),
                reply.peer,
                payload_preview(reply.payload)
            );
        }
        OutputFormat::Raw => print_raw(reply.payload),
    }
}

/// Aggregate numbers from a `bench` run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub method: String,
    pub pool_size: usize,
    pub concurrency: usize,
    pub payload_size: usize,
    pub calls: u64,
    pub errors: u64,
    pub elapsed_ms: f64,
    pub calls_per_sec: f64,
}

impl BenchReport {
    pub fn new(
        method: impl Into<String>,
        pool_size: usize,
        concurrency: usize,
        payload_size: usize,
        calls: u64,
        errors: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let calls_per_sec = if secs > 0.0 { calls as f64 / secs } else { 0.0 };
        Self {
            method: method.into(),
            pool_size,
            concurrency,
            payload_size,
            calls,
            errors,
            elapsed_ms: secs * 1000.0,
            calls_per_sec,
        }
    }
}

pub fn print_bench(report: &BenchReport, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    "METHOD", "POOL", "CONCURRENCY", "PAYLOAD", "CALLS", "ERRORS", "ELAPSED",
                    "CALLS/SEC",
                ])
                .add_row(vec![
                    report.method.clone(),
                    report.pool_size.to_string(),
                    report.concurrency.to_string(),
                    report.payload_size.to_string(),
                    report.calls.to_string(),
                    report.errors.to_string(),
                    format!("{:.1}ms", report.elapsed_ms),
                    format!("{:.0}", report.calls_per_sec),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={} pool={} concurrency={} payload={} calls={} errors={} elapsed={:.1}ms calls/sec={:.0}",
                report.method,
                report.pool_size,
                report.concurrency,
                report.payload_size,
                report.calls,
                report.errors,
                report.elapsed_ms,
                report.calls_per_sec
            );
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
