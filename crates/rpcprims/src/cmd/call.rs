use std::time::{Duration, Instant};

use rpcprims_session::{Client, Result};
use rpcprims_transport::TcpDialer;

use crate::cmd::{disconnect, parse_duration, CallArgs, Payload};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat, Reply};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = args.payload.resolve()?;

    let client = Client::new(TcpDialer::new(&args.addr).with_connect_timeout(timeout));
    client
        .run()
        .await
        .map_err(|err| rpc_error("connect failed", err))?;

    let started = Instant::now();
    let outcome = send(&client, &args.method, &payload, timeout).await;
    let elapsed = started.elapsed();

    let session = client.session();
    disconnect(&client).await;
    let reply = outcome.map_err(|err| rpc_error("call failed", err))?;

    let (peer, session_id) = session
        .as_ref()
        .map(|session| (session.peer().to_string(), session.id()))
        .unwrap_or_default();
    print_reply(
        &Reply {
            method: &args.method,
            peer: &peer,
            session_id,
            elapsed,
            payload: &reply,
        },
        format,
    );
    Ok(SUCCESS)
}

/// Send `payload` as the request body and return the raw reply bytes.
pub async fn send(
    client: &Client,
    method: &str,
    payload: &Payload,
    timeout: Duration,
) -> Result<Vec<u8>> {
    match payload {
        Payload::Text(text) => client.call(method, text, timeout).await,
        Payload::Json(value) => client.call(method, value, timeout).await,
        Payload::Bytes(bytes) => client.call(method, bytes, timeout).await,
    }
}
