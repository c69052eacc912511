use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcprims_session::{ClientPool, RpcError};
use rpcprims_transport::TcpDialer;
use tracing::{debug, info};

use crate::cmd::{parse_duration, BenchArgs};
use crate::exit::{rpc_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_bench, BenchReport, OutputFormat};

pub async fn run(args: BenchArgs, format: OutputFormat) -> CliResult<i32> {
    if args.concurrency == 0 {
        return Err(CliError::usage("--concurrency must be at least 1"));
    }
    let timeout = parse_duration(&args.timeout)?;

    let dialer = TcpDialer::new(&args.addr).with_connect_timeout(timeout);
    let pool = ClientPool::new(dialer, args.pool)
        .await
        .map_err(|err| rpc_error("pool start failed", err))?;
    let pool = Arc::new(pool);

    let body = "x".repeat(args.payload_size);
    let outcome = drive(&pool, &args.method, body, args.count, args.concurrency, timeout).await;
    if let Err(err) = pool.stop().await {
        debug!(error = %err, "pool stop failed");
    }
    let (calls, errors, elapsed) = outcome?;

    let report = BenchReport::new(
        &args.method,
        pool.size(),
        args.concurrency,
        args.payload_size,
        calls,
        errors,
        elapsed,
    );
    info!(
        calls = report.calls,
        errors = report.errors,
        calls_per_sec = report.calls_per_sec,
        "bench finished"
    );
    print_bench(&report, format);
    Ok(SUCCESS)
}

/// Issue `count` calls from `concurrency` workers, each picking the next pool
/// member per call. Returns completed calls, failed calls and wall time.
async fn drive(
    pool: &Arc<ClientPool>,
    method: &str,
    body: String,
    count: u64,
    concurrency: usize,
    timeout: Duration,
) -> CliResult<(u64, u64, Duration)> {
    let claimed = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    let body = Arc::new(body);
    let started = Instant::now();

    let workers: Vec<_> = (0..concurrency)
        .map(|_| {
            let pool = Arc::clone(pool);
            let claimed = Arc::clone(&claimed);
            let errors = Arc::clone(&errors);
            let body = Arc::clone(&body);
            let method = method.to_string();
            tokio::spawn(async move {
                while claimed.fetch_add(1, Ordering::Relaxed) < count {
                    let reply: Result<Vec<u8>, RpcError> =
                        pool.next().call(&method, &*body, timeout).await;
                    if let Err(err) = reply {
                        debug!(%method, error = %err, "bench call failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker
            .await
            .map_err(|err| CliError::new(INTERNAL, format!("bench worker failed: {err}")))?;
    }

    let elapsed = started.elapsed();
    let errors = errors.load(Ordering::Relaxed);
    Ok((count, errors, elapsed))
}
