//! Message-oriented sockets and the context that creates them.
//!
//! A socket is split in two halves: the outbound [Link] owned by whoever sends, and a
//! [Sink] the transport delivers inbound messages into. Sockets owned by a reactor
//! share the poller's sink channel, standalone sockets get a channel of their own.

use crate::inproc::InprocTransport;
use crossfire::{AsyncRx, MTx, mpsc};
use occams_fabric_core::error::TransportError;
use occams_fabric_core::{Message, PeerToken};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Identifies a socket inside one context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u64);

impl SocketHandle {
    /// The reactor's routing command channel
    pub const CONTROL: SocketHandle = SocketHandle(0);
    /// Wakes the reactor out of its poll, carries nothing
    pub const WAKE: SocketHandle = SocketHandle(1);

    const FIRST: u64 = 16;

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.0 < Self::FIRST
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SocketHandle::CONTROL => write!(f, "sock(control)"),
            SocketHandle::WAKE => write!(f, "sock(wake)"),
            _ => write!(f, "sock({})", self.0),
        }
    }
}

/// Socket flavors, following the usual message-queue semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    /// Bound side of a many-to-one pattern. Inbound messages are prefixed with the
    /// identity of the sending peer, outbound messages are routed by their first frame.
    Router,
    /// Connecting side of a router. Frames pass through untouched.
    Dealer,
    /// Exclusive one-to-one channel.
    Pair,
}

impl SocketKind {
    pub fn name(&self) -> &'static str {
        match self {
            SocketKind::Router => "router",
            SocketKind::Dealer => "dealer",
            SocketKind::Pair => "pair",
        }
    }
}

/// One inbound message, tagged with the socket it arrived on.
pub struct Event {
    pub handle: SocketHandle,
    pub msg: Message,
    /// Only set on the control channel, when the sender waits for an ack.
    pub reply: Option<oneshot::Sender<Message>>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "event({:?}, {} frames)", self.handle, self.msg.len())
    }
}

/// Where a transport delivers the inbound messages of one socket.
#[derive(Clone)]
pub struct Sink {
    handle: SocketHandle,
    tx: MTx<Event>,
}

impl Sink {
    #[inline]
    pub fn new(handle: SocketHandle, tx: MTx<Event>) -> Self {
        Self { handle, tx }
    }

    #[inline]
    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    /// Fails once the receiving side is gone.
    #[inline]
    pub fn deliver(&self, msg: Message) -> Result<(), TransportError> {
        self.tx
            .send(Event { handle: self.handle, msg, reply: None })
            .map_err(|_| TransportError::HostUnreachable(format!("{:?} receiver dropped", self.handle)))
    }
}

/// Outbound half of a socket, implemented by each transport.
pub trait Link: Send {
    fn send(&mut self, msg: Message) -> Result<(), TransportError>;

    /// The address peers should use: for a bind with port 0, the port actually picked.
    fn endpoint(&self) -> &str;

    /// False once the link knows its peer is gone for good.
    fn is_connected(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), TransportError>;
}

/// A transport for one endpoint scheme.
///
/// The implementation can be found on:
///
/// - [InprocTransport]: `inproc://`, built into every [Context]
/// - [occams-fabric-tcp](https://docs.rs/occams-fabric-tcp): `tcp://`
pub trait Transport: Send + Sync + 'static {
    fn scheme(&self) -> &'static str;

    /// `address` is the endpoint with its `scheme://` prefix removed.
    fn bind(&self, address: &str, kind: SocketKind, sink: Sink) -> Result<Box<dyn Link>, TransportError>;

    fn connect(
        &self, address: &str, kind: SocketKind, identity: PeerToken, sink: Sink,
    ) -> Result<Box<dyn Link>, TransportError>;
}

/// Split `scheme://address`.
pub fn split_endpoint(endpoint: &str) -> Result<(&str, &str), TransportError> {
    match endpoint.split_once("://") {
        Some((scheme, address)) if !scheme.is_empty() && !address.is_empty() => Ok((scheme, address)),
        _ => Err(TransportError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// A socket: a handle, its kind, and the outbound link.
pub struct Socket {
    handle: SocketHandle,
    kind: SocketKind,
    link: Box<dyn Link>,
    closed: bool,
}

impl Socket {
    #[inline]
    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    #[inline]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        self.link.endpoint()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        !self.closed && self.link.is_connected()
    }

    #[inline]
    pub fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.link.send(msg)
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.link.close()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({} {})", self.handle, self.kind.name(), self.endpoint())
    }
}

struct ContextInner {
    transports: Vec<Arc<dyn Transport>>,
    next_handle: AtomicU64,
}

/// Shared transport context: the transports by scheme, and the socket handle allocator.
///
/// Cloning is cheap. Instances that talk over `inproc://` must share one context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context with the inproc transport only.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder { transports: vec![Arc::new(InprocTransport::new())] }
    }

    #[inline]
    pub fn next_handle(&self) -> SocketHandle {
        SocketHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.inner.transports.iter().any(|t| t.scheme() == scheme)
    }

    fn transport<'a>(&self, endpoint: &'a str) -> Result<(&Arc<dyn Transport>, &'a str), TransportError> {
        let (scheme, address) = split_endpoint(endpoint)?;
        match self.inner.transports.iter().find(|t| t.scheme() == scheme) {
            Some(t) => Ok((t, address)),
            None => Err(TransportError::UnsupportedScheme(scheme.to_string())),
        }
    }

    /// Bind a socket delivering into `tx`.
    pub fn bind(&self, endpoint: &str, kind: SocketKind, tx: &MTx<Event>) -> Result<Socket, TransportError> {
        let (transport, address) = self.transport(endpoint)?;
        let handle = self.next_handle();
        let link = transport.bind(address, kind, Sink::new(handle, tx.clone()))?;
        Ok(Socket { handle, kind, link, closed: false })
    }

    /// Connect a socket delivering into `tx`, announcing `identity` to the bound side.
    pub fn connect(
        &self, endpoint: &str, kind: SocketKind, identity: PeerToken, tx: &MTx<Event>,
    ) -> Result<Socket, TransportError> {
        let (transport, address) = self.transport(endpoint)?;
        let handle = self.next_handle();
        let link = transport.connect(address, kind, identity, Sink::new(handle, tx.clone()))?;
        Ok(Socket { handle, kind, link, closed: false })
    }

    /// Connect a socket that is not owned by a reactor, it gets its own receive channel.
    pub fn connect_standalone(
        &self, endpoint: &str, kind: SocketKind, identity: PeerToken,
    ) -> Result<(Socket, AsyncRx<Event>), TransportError> {
        let (tx, rx) = mpsc::unbounded_async::<Event>();
        let socket = self.connect(endpoint, kind, identity, &tx)?;
        Ok((socket, rx))
    }
}

pub struct ContextBuilder {
    transports: Vec<Arc<dyn Transport>>,
}

impl ContextBuilder {
    /// Register a transport, replacing any previous one with the same scheme.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transports.retain(|t| t.scheme() != transport.scheme());
        self.transports.push(Arc::new(transport));
        self
    }

    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                transports: self.transports,
                next_handle: AtomicU64::new(SocketHandle::FIRST),
            }),
        }
    }
}
