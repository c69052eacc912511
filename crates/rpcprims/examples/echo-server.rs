//! Echo server on a Unix domain socket.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! Every connecting client gets a `/welcome` notify, and `/echo` replies
//! with whatever it was sent. Stop with Ctrl-C.

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::time::Duration;

    use rpcprims::transport::UnixAcceptor;
    use rpcprims::{Context, Server};

    let sock_dir = std::env::temp_dir().join(format!("rpcprims-echo-{}", std::process::id()));
    std::fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let acceptor = UnixAcceptor::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let server = Server::new();
    server
        .handler()
        .handle("/echo", |ctx: Context| async move {
            let body: Vec<u8> = ctx.bind().unwrap_or_default();
            if let Err(err) = ctx.write(&body).await {
                eprintln!("reply failed: {err}");
            }
        })
        .on_connected(|session| {
            eprintln!("Session {} connected from {}", session.id(), session.peer());
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session
                    .notify("/welcome", &"hello from the server", Duration::from_secs(1))
                    .await;
            });
        })
        .on_disconnected(|session| {
            eprintln!("Session {} disconnected", session.id());
        });

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(acceptor).await })
    };

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    serving.await??;
    Ok(())
}

#[cfg(not(unix))]
fn main() {
    eprintln!("echo-server needs Unix domain sockets");
}
