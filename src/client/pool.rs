use occams_fabric_core::error::{FabricError, InvokeError, TransportError};
use occams_fabric_core::id::inproc_endpoint;
use occams_fabric_core::proto::{RoutingCommand, decode_address};
use occams_fabric_core::{Message, PeerToken, PoolConfig};
use occams_fabric_stream::{Context, Event, ReactorHandle, ReactorState, Socket, SocketKind};
use crossfire::AsyncRx;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// A client connection an invocation is bound to while in flight.
pub trait Connection: Send + 'static {
    fn token(&self) -> PeerToken;

    fn send(&mut self, msg: Message) -> Result<(), InvokeError>;

    fn recv(&mut self) -> impl Future<Output = Result<Message, InvokeError>> + Send;
}

/// Where invocations get their connections from.
///
/// Every acquired connection is handed back exactly once: with `recycle` when the call
/// completed cleanly, with `close` when its protocol state is unknown.
pub trait ConnectionPool: Send + Sync + 'static {
    type Conn: Connection;

    fn acquire(&self, address: &str) -> impl Future<Output = Result<Self::Conn, FabricError>> + Send;

    fn recycle(&self, conn: Self::Conn);

    fn close(&self, conn: Self::Conn);
}

/// An inproc channel of the reactor, seen from the caller's side.
pub struct ChannelConnection {
    address: String,
    token: PeerToken,
    socket: Socket,
    rx: AsyncRx<Event>,
}

impl ChannelConnection {
    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.socket.is_connected()
    }
}

impl Connection for ChannelConnection {
    #[inline]
    fn token(&self) -> PeerToken {
        self.token
    }

    fn send(&mut self, msg: Message) -> Result<(), InvokeError> {
        self.socket.send(msg).map_err(|e| InvokeError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Message, InvokeError> {
        match self.rx.recv().await {
            Ok(ev) => Ok(ev.msg),
            Err(_) => Err(InvokeError::Connection(format!("channel {} to {} closed", self.token, self.address))),
        }
    }
}

/// The default pool: one inproc channel per connection, opened with routing commands.
///
/// Idle connections are kept per backend address, up to `PoolConfig::max_idle`.
pub struct ChannelPool<S> {
    reactor: ReactorHandle<S>,
    ctx: Context,
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<ChannelConnection>>>,
}

impl<S: ReactorState> ChannelPool<S> {
    pub fn new(reactor: ReactorHandle<S>, ctx: Context, config: PoolConfig) -> Self {
        Self { reactor, ctx, config, idle: Mutex::new(HashMap::new()) }
    }

    #[inline]
    fn idle(&self) -> MutexGuard<'_, HashMap<String, Vec<ChannelConnection>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_count(&self, address: &str) -> usize {
        self.idle().get(address).map(|v| v.len()).unwrap_or(0)
    }

    /// Close every idle connection to `address`.
    pub fn purge(&self, address: &str) {
        let conns = self.idle().remove(address).unwrap_or_default();
        for conn in conns {
            self.release(conn);
        }
    }

    fn release(&self, conn: ChannelConnection) {
        let ChannelConnection { address, token, mut socket, .. } = conn;
        let _ = socket.close();
        // the reactor side may be gone with its backend already, that is fine
        let _ = self.reactor.execute(move |r| {
            if let Err(e) = r.close_inproc(&address, &token) {
                logger_warn!(r.logger(), "close channel {} of {}: {}", token, address, e);
            }
        });
    }

    async fn open(&self, address: &str) -> Result<ChannelConnection, FabricError> {
        let token = PeerToken::random();
        let endpoint = match self.reactor.submit(&RoutingCommand::open_inproc(address, token)).await? {
            Some(ack) => match ack.into_result()?.first() {
                Some(frame) => decode_address(frame)?,
                None => inproc_endpoint(address, &token),
            },
            // not acknowledged, the channel shows up once the reactor got to it
            None => inproc_endpoint(address, &token),
        };
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            match self.ctx.connect_standalone(&endpoint, SocketKind::Pair, token) {
                Ok((socket, rx)) => {
                    return Ok(ChannelConnection { address: address.to_string(), token, socket, rx });
                }
                Err(TransportError::ConnectionRefused(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(self.config.connect_retry).await;
                }
                Err(e) => {
                    let address = address.to_string();
                    let _ = self.reactor.execute(move |r| {
                        let _ = r.close_inproc(&address, &token);
                    });
                    return Err(e.into());
                }
            }
        }
    }
}

impl<S: ReactorState> ConnectionPool for ChannelPool<S> {
    type Conn = ChannelConnection;

    async fn acquire(&self, address: &str) -> Result<ChannelConnection, FabricError> {
        loop {
            let conn = match self.idle().get_mut(address) {
                Some(conns) => conns.pop(),
                None => None,
            };
            match conn {
                Some(conn) if conn.is_alive() => return Ok(conn),
                Some(conn) => self.release(conn),
                None => break,
            }
        }
        self.open(address).await
    }

    fn recycle(&self, conn: ChannelConnection) {
        if !conn.is_alive() {
            return self.release(conn);
        }
        let mut idle = self.idle();
        let conns = idle.entry(conn.address.clone()).or_default();
        if conns.len() < self.config.max_idle {
            conns.push(conn);
        } else {
            drop(idle);
            self.release(conn);
        }
    }

    fn close(&self, conn: ChannelConnection) {
        self.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use occams_fabric_core::ReactorConfig;
    use occams_fabric_stream::ReactorBuilder;
    use rstest::*;
    use std::time::Duration;

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn test_acquire_recycle(#[case] ack: bool) {
        let ctx = Context::new();
        let (tx, rx) = crossfire::mpsc::unbounded_blocking::<Event>();
        let mut remote = ctx.bind("inproc://pool-remote", SocketKind::Router, &tx).expect("bind");
        let config = ReactorConfig { ack_routing_commands: ack, ..Default::default() };
        let reactor = ReactorBuilder::<()>::new(ctx.clone(), config).spawn(|| ()).expect("spawn");
        let pool = ChannelPool::new(reactor.clone(), ctx.clone(), PoolConfig { max_idle: 1, ..Default::default() });

        let mut conn = pool.acquire("inproc://pool-remote").await.expect("acquire");
        conn.send(vec![Bytes::new(), Bytes::from_static(b"hi")]).expect("send");
        let ev = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)).expect("recv"))
            .await
            .expect("join");
        assert_eq!(ev.msg[1], Bytes::copy_from_slice(conn.token().as_bytes()));
        remote.send(ev.msg).expect("echo");
        let back = tokio::time::timeout(Duration::from_secs(2), conn.recv()).await.expect("in time").expect("recv");
        assert_eq!(back, vec![Bytes::new(), Bytes::from_static(b"hi")]);

        let token = conn.token();
        pool.recycle(conn);
        assert_eq!(pool.idle_count("inproc://pool-remote"), 1);
        let again = pool.acquire("inproc://pool-remote").await.expect("acquire");
        assert_eq!(again.token(), token);
        let other = pool.acquire("inproc://pool-remote").await.expect("acquire");
        assert_ne!(other.token(), token);
        pool.recycle(again);
        // over max_idle
        pool.recycle(other);
        assert_eq!(pool.idle_count("inproc://pool-remote"), 1);

        // connections die with their backend
        reactor.submit(&RoutingCommand::close_backend("inproc://pool-remote")).await.expect("close");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = pool.acquire("inproc://pool-remote").await.expect("acquire");
        assert_ne!(fresh.token(), token);
        pool.close(fresh);
        reactor.shutdown();
    }
}
