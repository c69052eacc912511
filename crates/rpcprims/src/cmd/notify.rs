use rpcprims_session::Client;
use rpcprims_transport::TcpDialer;
use tracing::debug;

use crate::cmd::{disconnect, parse_duration, NotifyArgs, Payload};
use crate::exit::{rpc_error, CliResult, SUCCESS};

pub async fn run(args: NotifyArgs) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = args.payload.resolve()?;

    let client = Client::new(TcpDialer::new(&args.addr).with_connect_timeout(timeout));
    client
        .run()
        .await
        .map_err(|err| rpc_error("connect failed", err))?;

    let sent = match &payload {
        Payload::Text(text) => client.notify(&args.method, text, timeout).await,
        Payload::Json(value) => client.notify(&args.method, value, timeout).await,
        Payload::Bytes(bytes) => client.notify(&args.method, bytes, timeout).await,
    };
    disconnect(&client).await;
    sent.map_err(|err| rpc_error("notify failed", err))?;

    debug!(method = %args.method, target_addr = %args.addr, "notify sent");
    Ok(SUCCESS)
}
