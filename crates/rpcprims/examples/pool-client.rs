//! Round-robin calls through a client pool against an in-process server.
//!
//! Run with:
//!   cargo run --example pool-client

use std::sync::Arc;
use std::time::{Duration, Instant};

use rpcprims::transport::TcpAcceptor;
use rpcprims::{ClientPool, Context, Server, TcpDialer};
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
    let addr = acceptor.local_addr();

    let server = Server::new();
    server
        .handler()
        .handle("/echo/string", |ctx: Context| async move {
            let body: String = ctx.bind().unwrap_or_default();
            let _ = ctx.write(&body).await;
        })
        .handle("/log", |ctx: Context| async move {
            let line: String = ctx.bind().unwrap_or_default();
            eprintln!("server log: {line}");
        });
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(acceptor).await })
    };

    let pool = Arc::new(ClientPool::new(TcpDialer::new(addr.to_string()), 4).await?);
    eprintln!("pool of {} connected to {addr}", pool.size());

    let started = Instant::now();
    let mut tasks = Vec::new();
    for i in 0..64 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let reply: String = pool
                .next()
                .call("/echo/string", &format!("message {i}"), Duration::from_secs(1))
                .await?;
            Ok::<_, rpcprims::RpcError>(reply)
        }));
    }
    for task in tasks {
        task.await??;
    }
    eprintln!("64 calls in {:?}", started.elapsed());

    let (tx, rx) = oneshot::channel();
    pool.next()
        .call_async(
            "/echo/string",
            &"async hello",
            move |reply| {
                let text = reply.and_then(|ctx| ctx.bind::<String>());
                let _ = tx.send(text);
            },
            Duration::from_secs(1),
        )
        .await?;
    eprintln!("async reply: {}", rx.await??);

    pool.get(0)
        .notify("/log", &"pool-client done", Duration::from_secs(1))
        .await?;

    pool.stop().await?;
    server.stop().await;
    serving.await??;
    Ok(())
}
