use crate::codec::{encode_message, read_identity, read_message};
use bytes::Bytes;
use nix::errno::Errno;
use occams_fabric_core::error::TransportError;
use occams_fabric_core::{Message, PeerToken, TcpConfig};
use occams_fabric_stream::{Link, Sink, SocketKind, Transport};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const UNREACHABLE: u8 = 2;
const DOWN: u8 = 3;

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether a connect error means the peer cannot be reached right now.
pub fn is_unreachable(e: &io::Error) -> bool {
    if let Some(code) = e.raw_os_error() {
        return matches!(
            Errno::from_raw(code),
            Errno::EHOSTUNREACH | Errno::ENETUNREACH | Errno::ECONNREFUSED | Errno::ETIMEDOUT
        );
    }
    matches!(e.kind(), io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut)
}

/// `tcp://host:port`.
///
/// I/O runs as tasks on the given tokio runtime, the reactor thread never blocks on a
/// socket. Bound sockets accept any number of peers (a pair accepts one at a time).
/// Connected sockets dial in the background, reconnect after a failure, and queue
/// outbound messages while connecting. Once a connect attempt failed with an
/// unreachable host, sends fail with [TransportError::HostUnreachable] until the
/// connection is up again.
pub struct TcpTransport {
    rt: Handle,
    config: Arc<TcpConfig>,
}

impl TcpTransport {
    pub fn new(rt: Handle, config: TcpConfig) -> Self {
        Self { rt, config: Arc::new(config) }
    }
}

impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn bind(&self, address: &str, kind: SocketKind, sink: Sink) -> Result<Box<dyn Link>, TransportError> {
        if kind == SocketKind::Dealer {
            return Err(TransportError::Unsupported { kind: "bound dealer", scheme: "tcp" });
        }
        let listener = std::net::TcpListener::bind(address).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(format!("tcp://{}", address))
            } else {
                TransportError::Io(e)
            }
        })?;
        listener.set_nonblocking(true)?;
        let endpoint = format!("tcp://{}", listener.local_addr()?);
        let (close_tx, close_rx) = watch::channel(false);
        let shared = Arc::new(Bound { kind, peers: Mutex::new(HashMap::new()), next_conn: AtomicU64::new(1) });
        debug!("tcp bind {} ({})", endpoint, kind.name());
        self.rt.spawn(accept_loop(listener, shared.clone(), sink, self.config.clone(), close_rx));
        Ok(Box::new(TcpBound { shared, endpoint, config: self.config.clone(), close_tx }))
    }

    fn connect(
        &self, address: &str, kind: SocketKind, identity: PeerToken, sink: Sink,
    ) -> Result<Box<dyn Link>, TransportError> {
        if kind == SocketKind::Router {
            return Err(TransportError::Unsupported { kind: "connected router", scheme: "tcp" });
        }
        if address.rsplit_once(':').map(|(h, p)| h.is_empty() || p.parse::<u16>().is_err()).unwrap_or(true) {
            return Err(TransportError::InvalidEndpoint(format!("tcp://{}", address)));
        }
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let (close_tx, close_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(CONNECTING));
        let dialer = Dialer {
            address: address.to_string(),
            identity,
            sink,
            config: self.config.clone(),
            state: state.clone(),
        };
        self.rt.spawn(dialer.run(rx, close_rx));
        Ok(Box::new(TcpConnected {
            tx,
            state,
            endpoint: format!("tcp://{}", address),
            config: self.config.clone(),
            close_tx,
        }))
    }
}

struct PeerTx {
    conn: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Bound {
    kind: SocketKind,
    peers: Mutex<HashMap<PeerToken, PeerTx>>,
    next_conn: AtomicU64,
}

struct TcpBound {
    shared: Arc<Bound>,
    endpoint: String,
    config: Arc<TcpConfig>,
    close_tx: watch::Sender<bool>,
}

impl Link for TcpBound {
    fn send(&mut self, mut msg: Message) -> Result<(), TransportError> {
        let peers = lock(&self.shared.peers);
        let peer = match self.shared.kind {
            SocketKind::Router => {
                if msg.is_empty() {
                    return Err(TransportError::HostUnreachable("router message without identity".to_string()));
                }
                let identity = PeerToken::from_slice(&msg[0])
                    .map_err(|_| TransportError::HostUnreachable(format!("invalid identity on {}", self.endpoint)))?;
                msg.remove(0);
                peers
                    .get(&identity)
                    .ok_or_else(|| TransportError::HostUnreachable(format!("{} on {}", identity, self.endpoint)))?
            }
            _ => peers
                .values()
                .next()
                .ok_or_else(|| TransportError::HostUnreachable(format!("no peer on {}", self.endpoint)))?,
        };
        let buf = encode_message(&msg, &self.config)?;
        peer.tx.send(buf).map_err(|_| TransportError::HostUnreachable(self.endpoint.clone()))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.close_tx.send(true);
        lock(&self.shared.peers).clear();
        Ok(())
    }
}

async fn accept_loop(
    listener: std::net::TcpListener, shared: Arc<Bound>, sink: Sink, config: Arc<TcpConfig>,
    mut closed: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(l) => l,
        Err(e) => {
            error!("tcp listener: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = closed.changed() => break,
            r = listener.accept() => match r {
                Ok((stream, _)) => {
                    tokio::spawn(serve_peer(stream, shared.clone(), sink.clone(), config.clone(), closed.clone()));
                }
                Err(e) => {
                    warn!("tcp accept: {}", e);
                    tokio::time::sleep(config.reconnect_interval).await;
                }
            },
        }
    }
    trace!("tcp accept loop of {:?} exit", sink.handle());
}

async fn serve_peer(
    stream: TcpStream, shared: Arc<Bound>, sink: Sink, config: Arc<TcpConfig>, mut closed: watch::Receiver<bool>,
) {
    let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    if config.nodelay {
        let _ = stream.set_nodelay(true);
    }
    let (mut rd, mut wr) = stream.into_split();
    let identity = match io_with_timeout!(HANDSHAKE_TIMEOUT, read_identity(&mut rd)) {
        Ok(i) => i,
        Err(e) => {
            debug!("tcp handshake from {}: {}", peer_addr, e);
            return;
        }
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    {
        let mut peers = lock(&shared.peers);
        if shared.kind == SocketKind::Pair && !peers.is_empty() {
            debug!("tcp pair {:?} busy, refuse {}", sink.handle(), peer_addr);
            return;
        }
        // a reconnecting peer replaces its stale connection
        peers.insert(identity, PeerTx { conn, tx });
    }
    trace!("tcp {:?} accepted {} from {}", sink.handle(), identity, peer_addr);
    let prefix = shared.kind == SocketKind::Router;
    let reader = async {
        while let Some(msg) = read_message(&mut rd, &config).await? {
            let msg = if prefix {
                let mut framed = Vec::with_capacity(msg.len() + 1);
                framed.push(Bytes::copy_from_slice(identity.as_bytes()));
                framed.extend(msg);
                framed
            } else {
                msg
            };
            sink.deliver(msg).map_err(io::Error::other)?;
        }
        Ok::<(), io::Error>(())
    };
    let writer = async {
        while let Some(buf) = rx.recv().await {
            wr.write_all(&buf).await?;
        }
        Ok::<(), io::Error>(())
    };
    let r = tokio::select! {
        r = reader => r,
        r = writer => r,
        _ = closed.changed() => Ok(()),
    };
    if let Err(e) = r {
        debug!("tcp peer {} ({}): {}", identity, peer_addr, e);
    }
    let mut peers = lock(&shared.peers);
    if peers.get(&identity).map(|p| p.conn == conn).unwrap_or(false) {
        peers.remove(&identity);
    }
}

struct TcpConnected {
    tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<AtomicU8>,
    endpoint: String,
    config: Arc<TcpConfig>,
    close_tx: watch::Sender<bool>,
}

impl Link for TcpConnected {
    fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        match self.state.load(Ordering::Acquire) {
            UNREACHABLE | DOWN => return Err(TransportError::HostUnreachable(self.endpoint.clone())),
            _ => {}
        }
        let buf = encode_message(&msg, &self.config)?;
        self.tx.send(buf).map_err(|_| TransportError::HostUnreachable(self.endpoint.clone()))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) != DOWN
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.close_tx.send(true);
        Ok(())
    }
}

struct Dialer {
    address: String,
    identity: PeerToken,
    sink: Sink,
    config: Arc<TcpConfig>,
    state: Arc<AtomicU8>,
}

impl Dialer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Bytes>, mut closed: watch::Receiver<bool>) {
        let mut attempts = 0u32;
        loop {
            let r = tokio::select! {
                _ = closed.changed() => break,
                r = TcpStream::connect(&self.address) => r,
            };
            let stream = match r {
                Ok(s) => s,
                Err(e) => {
                    attempts += 1;
                    if is_unreachable(&e) {
                        self.state.store(UNREACHABLE, Ordering::Release);
                    }
                    debug!("tcp connect {} attempt {}: {}", self.address, attempts, e);
                    if self.config.connect_attempts > 0 && attempts >= self.config.connect_attempts {
                        warn!("tcp connect {}: giving up after {} attempts", self.address, attempts);
                        break;
                    }
                    tokio::select! {
                        _ = closed.changed() => break,
                        _ = tokio::time::sleep(self.config.reconnect_interval) => continue,
                    }
                }
            };
            attempts = 0;
            match self.serve(stream, &mut rx, &mut closed).await {
                Ok(true) => break,
                Ok(false) => trace!("tcp {} disconnected", self.address),
                Err(e) => debug!("tcp {} disconnected: {}", self.address, e),
            }
            self.state.store(CONNECTING, Ordering::Release);
            tokio::select! {
                _ = closed.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        self.state.store(DOWN, Ordering::Release);
        trace!("tcp dialer of {} exit", self.address);
    }

    /// Returns true when the link is closed and the dialer should stop.
    async fn serve(
        &self, stream: TcpStream, rx: &mut mpsc::UnboundedReceiver<Bytes>, closed: &mut watch::Receiver<bool>,
    ) -> io::Result<bool> {
        if self.config.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let (mut rd, mut wr) = stream.into_split();
        wr.write_all(self.identity.as_bytes()).await?;
        self.state.store(CONNECTED, Ordering::Release);
        trace!("tcp {} connected as {}", self.address, self.identity);
        let reader = async {
            while let Some(msg) = read_message(&mut rd, &self.config).await? {
                self.sink.deliver(msg).map_err(io::Error::other)?;
            }
            Ok::<bool, io::Error>(false)
        };
        let writer = async {
            while let Some(buf) = rx.recv().await {
                wr.write_all(&buf).await?;
            }
            // every sender is gone
            Ok::<bool, io::Error>(true)
        };
        tokio::select! {
            r = reader => r,
            r = writer => r,
            _ = closed.changed() => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use occams_fabric_stream::{Context, Event};
    use rstest::*;
    use std::time::Instant;

    fn setup(config: TcpConfig) -> (tokio::runtime::Runtime, Context) {
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().expect("rt");
        let ctx = Context::builder().transport(TcpTransport::new(rt.handle().clone(), config)).build();
        (rt, ctx)
    }

    #[test]
    fn test_router_dealer_over_tcp() {
        let (rt, ctx) = setup(TcpConfig::default());
        let (tx, rx) = crossfire::mpsc::unbounded_blocking::<Event>();
        let mut router = ctx.bind("tcp://127.0.0.1:0", SocketKind::Router, &tx).expect("bind");
        assert!(!router.endpoint().ends_with(":0"));
        let id = PeerToken::from_name("dealer");
        let (mut dealer, drx) =
            ctx.connect_standalone(router.endpoint(), SocketKind::Dealer, id).expect("connect");

        dealer.send(vec![Bytes::new(), Bytes::from_static(b"ping")]).expect("send");
        let ev = rx.recv_timeout(Duration::from_secs(5)).expect("recv");
        assert_eq!(ev.handle, router.handle());
        assert_eq!(ev.msg[0], Bytes::copy_from_slice(id.as_bytes()));
        assert_eq!(&ev.msg[1..], &[Bytes::new(), Bytes::from_static(b"ping")]);

        let mut reply = ev.msg;
        reply[2] = Bytes::from_static(b"pong");
        router.send(reply).expect("reply");
        let back = rt
            .block_on(async { tokio::time::timeout(Duration::from_secs(5), drx.recv()).await })
            .expect("in time")
            .expect("recv");
        assert_eq!(back.msg, vec![Bytes::new(), Bytes::from_static(b"pong")]);

        let unknown = PeerToken::from_name("other");
        assert!(matches!(
            router.send(vec![Bytes::copy_from_slice(unknown.as_bytes()), Bytes::new()]),
            Err(TransportError::HostUnreachable(_))
        ));
        assert!(matches!(
            ctx.bind(router.endpoint(), SocketKind::Router, &tx),
            Err(TransportError::AddressInUse(_))
        ));
        dealer.close().expect("close");
        router.close().expect("close");
    }

    #[test]
    fn test_unreachable_peer() {
        let config = TcpConfig { reconnect_interval: Duration::from_millis(20), ..Default::default() };
        let (_rt, ctx) = setup(config);
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            l.local_addr().expect("addr").port()
        };
        let endpoint = format!("tcp://127.0.0.1:{}", port);
        let (mut dealer, _drx) =
            ctx.connect_standalone(&endpoint, SocketKind::Dealer, PeerToken::random()).expect("connect is lazy");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut unreachable = false;
        while Instant::now() < deadline {
            if let Err(e) = dealer.send(vec![Bytes::from_static(b"x")]) {
                assert!(e.is_unreachable());
                unreachable = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(unreachable);
    }

    #[rstest]
    #[case("tcp://nohost")]
    #[case("tcp://127.0.0.1:notaport")]
    #[case("tcp://:80")]
    fn test_invalid_endpoint(#[case] endpoint: &str) {
        let (_rt, ctx) = setup(TcpConfig::default());
        let r = ctx.connect_standalone(endpoint, SocketKind::Dealer, PeerToken::random());
        assert!(matches!(r, Err(TransportError::InvalidEndpoint(_))));
    }

    #[rstest]
    #[case(io::Error::from_raw_os_error(Errno::EHOSTUNREACH as i32), true)]
    #[case(io::Error::from_raw_os_error(Errno::ENETUNREACH as i32), true)]
    #[case(io::Error::from(io::ErrorKind::ConnectionRefused), true)]
    #[case(io::Error::from_raw_os_error(Errno::EACCES as i32), false)]
    fn test_is_unreachable(#[case] e: io::Error, #[case] expect: bool) {
        assert_eq!(is_unreachable(&e), expect);
    }
}
