use rpcprims_session::{reply_not_found, Context, JsonCodec, MessageKind, Router, Server, ServerConfig};
use rpcprims_transport::TcpAcceptor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{rpc_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

/// Body of `/echo/struct`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EchoMessage {
    pub payload: String,
}

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let acceptor = TcpAcceptor::bind(&args.addr)
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let local = acceptor.local_addr();
    match format {
        OutputFormat::Json => println!(r#"{{"listening":"{local}"}}"#),
        _ => println!("listening on {local}"),
    }

    let server = Server::with_config(
        echo_router(),
        JsonCodec,
        ServerConfig {
            max_sessions: args.max_sessions,
            ..ServerConfig::default()
        },
    );

    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(acceptor).await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for ctrl-c; stopping");
            } else {
                info!("received ctrl-c; stopping");
            }
        }
        finished = &mut serving => {
            server.stop().await;
            return match finished {
                Ok(Ok(())) => Ok(SUCCESS),
                Ok(Err(err)) => Err(rpc_error("serve failed", err)),
                Err(err) => Err(CliError::new(INTERNAL, format!("serve task failed: {err}"))),
            };
        }
    }

    server.stop().await;
    if let Err(err) = serving.await {
        warn!(error = %err, "serve task failed during shutdown");
    }
    Ok(SUCCESS)
}

/// Routes served by `rpcprims serve`.
pub fn echo_router() -> Router {
    let router = Router::new();
    router
        .handle("/echo/string", |ctx: Context| async move {
            match ctx.bind::<String>() {
                Ok(body) => reply(&ctx, &body).await,
                Err(err) => reject(&ctx, &err.to_string()).await,
            }
        })
        .handle("/echo/bytes", |ctx: Context| async move {
            match ctx.bind::<Vec<u8>>() {
                Ok(body) => reply(&ctx, &body).await,
                Err(err) => reject(&ctx, &err.to_string()).await,
            }
        })
        .handle("/echo/struct", |ctx: Context| async move {
            match ctx.bind::<EchoMessage>() {
                Ok(body) => reply(&ctx, &body).await,
                Err(err) => reject(&ctx, &err.to_string()).await,
            }
        })
        .handle("/echo", |ctx: Context| async move {
            match ctx.bind::<serde_json::Value>() {
                Ok(body) => reply(&ctx, &body).await,
                Err(err) => reject(&ctx, &err.to_string()).await,
            }
        })
        .handle_not_found(|ctx: Context| async move {
            if ctx.kind() == MessageKind::Notify {
                info!(
                    session_id = ctx.session().id(),
                    peer = %ctx.session().peer(),
                    method = %ctx.method(),
                    size = ctx.payload().len(),
                    "notify received"
                );
                return;
            }
            reply_not_found(ctx).await;
        });
    router
}

async fn reply<T: Serialize + std::any::Any + Sync>(ctx: &Context, body: &T) {
    if ctx.kind() != MessageKind::Call {
        debug!(method = %ctx.method(), "echo route received a notify");
        return;
    }
    if let Err(err) = ctx.write(body).await {
        warn!(session_id = ctx.session().id(), seq = ctx.seq(), error = %err, "echo reply failed");
    }
}

async fn reject(ctx: &Context, message: &str) {
    if ctx.kind() != MessageKind::Call {
        return;
    }
    if let Err(err) = ctx.write_error(message).await {
        warn!(session_id = ctx.session().id(), seq = ctx.seq(), error = %err, "echo error reply failed");
    }
}
