use bytes::Bytes;
use occams_fabric::{Context, Fabric, FabricConfig, NodeRequest, RemoteError};
use std::time::Duration;

#[cfg(test)]
mod test_control;
#[cfg(test)]
mod test_invoke;
#[cfg(test)]
mod test_route;
#[cfg(test)]
mod test_topology;

pub const ECHO: u64 = 1;
/// Replies, then sends one callback part per announced part with the part number
pub const FAN_OUT: u64 = 2;
/// Sleeps `SLOW_DELAY` before replying
pub const SLOW: u64 = 3;
pub const FAILING: u64 = 4;
pub const PANICKING: u64 = 5;

pub const SLOW_DELAY: Duration = Duration::from_millis(500);

pub fn echo(req: NodeRequest) {
    req.responder.reply(Ok(req.payload.clone()));
}

pub fn fan_out(req: NodeRequest) {
    req.responder.reply(Ok(req.payload.clone()));
    for part in 1..=req.additional_parts {
        req.responder.callback(part, Ok(Bytes::from(format!("part-{}", part))));
    }
}

pub fn slow(req: NodeRequest) {
    std::thread::sleep(SLOW_DELAY);
    req.responder.reply(Ok(req.payload.clone()));
}

pub fn failing(req: NodeRequest) {
    req.responder.reply(Err(RemoteError::new(RemoteError::GENERIC, "refused")));
}

pub fn panicking(_req: NodeRequest) {
    panic!("service blew up");
}

/// `name` keeps inproc endpoints of different instances apart.
pub fn config(inproc: bool, name: &str, ack: bool) -> FabricConfig {
    let mut config = FabricConfig::default();
    if inproc {
        config.control_endpoint = format!("inproc://{}-control", name);
        config.bind_prefix = format!("inproc://{}", name);
    }
    config.reactor.ack_routing_commands = ack;
    config.control_timeout = Duration::from_secs(3);
    config
}

/// An instance hosting every test node.
pub async fn server(ctx: Option<Context>, config: FabricConfig) -> Fabric {
    let mut builder = Fabric::builder(config)
        .host(ECHO, echo)
        .host(FAN_OUT, fan_out)
        .host(SLOW, slow)
        .host(FAILING, failing)
        .host(PANICKING, panicking);
    if let Some(ctx) = ctx {
        builder = builder.context(ctx);
    }
    builder.build().await.expect("build server")
}

/// A server and a client connected to it.
pub async fn pair(inproc: bool, ack: bool, tag: &str) -> (Fabric, Fabric) {
    let ctx = if inproc { Some(Context::new()) } else { None };
    let server = server(ctx.clone(), config(inproc, &format!("{}-server", tag), ack)).await;
    let mut builder = Fabric::builder(config(inproc, &format!("{}-client", tag), ack));
    if let Some(ctx) = ctx {
        builder = builder.context(ctx);
    }
    let client = builder.build().await.expect("build client");
    let id = client.connect_to_instance(server.control_address()).await.expect("connect");
    assert_eq!(id, server.instance());
    (server, client)
}

/// Wait for `cond`, checking every 10ms for up to 2s.
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
