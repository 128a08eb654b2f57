//! The connection reactor.
//!
//! One dedicated thread owns the poller, every socket and the channel tables. Nothing
//! here is locked: other threads mutate routing state only by sending a
//! [RoutingCommand] over the control channel, or a [Task] the loop runs between polls.

use crate::poller::Poller;
use crate::router;
use crate::table::{BackendTable, Health};
use crate::transport::{Context, Event, Socket, SocketHandle, SocketKind};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use crossfire::{MTx, Rx, mpsc};
use occams_fabric_core::config::ReactorConfig;
use occams_fabric_core::error::{ChannelError, FabricError, ProtoError, TransportError};
use occams_fabric_core::id::inproc_endpoint;
use occams_fabric_core::proto::{
    RemoteError, ResponseCode, RoutingAction, RoutingCommand, decode_address, decode_u32, encode_u32,
};
use occams_fabric_core::{Frame, Message, PeerToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Instant;
use tokio::sync::oneshot;

/// Invoked on the reactor thread for every message of the socket it was registered with.
pub type Handler<S> = Box<dyn FnMut(&mut Reactor<S>, SocketHandle, Message)>;

/// Work submitted from another thread, run between two polls.
pub type Task<S> = Box<dyn FnOnce(&mut Reactor<S>) + Send>;

/// Run once on the reactor thread before the first poll.
pub type SetupHook<S> = Box<dyn FnOnce(&mut Reactor<S>) -> Result<(), FabricError> + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    Idle,
    Failing,
    Shutdown,
}

/// User state living on the reactor thread, with hooks into backend traffic.
pub trait ReactorState: Sized + 'static {
    /// Backend traffic whose routing token matches no inproc channel.
    fn on_unrouted(reactor: &mut Reactor<Self>, address: &str, token: PeerToken, body: Message) {
        logger_debug!(
            reactor.logger(),
            "unrouted message ({} frames) from {} for {}, dropped",
            body.len(),
            address,
            token
        );
    }

    /// A backend was closed and its inproc channels with it.
    fn on_backend_closed(_reactor: &mut Reactor<Self>, _address: &str, _reason: CloseReason) {}
}

impl ReactorState for () {}

struct Registered<S> {
    socket: Socket,
    handler: Option<Handler<S>>,
}

/// The socket registry: every socket owned by the reactor, with its handler.
pub struct Io<S> {
    ctx: Context,
    poller: Poller,
    sockets: HashMap<SocketHandle, Registered<S>>,
    logger: Arc<LogFilter>,
}

impl<S> Io<S> {
    pub fn new(ctx: Context, logger: Arc<LogFilter>) -> Self {
        Self { ctx, poller: Poller::new(), sockets: HashMap::new(), logger }
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Bind a socket delivering into the poller, not registered yet.
    #[inline]
    pub fn create_bound(&self, endpoint: &str, kind: SocketKind) -> Result<Socket, TransportError> {
        self.ctx.bind(endpoint, kind, self.poller.sender())
    }

    /// Connect a socket delivering into the poller, not registered yet.
    #[inline]
    pub fn create_connected(
        &self, endpoint: &str, kind: SocketKind, identity: PeerToken,
    ) -> Result<Socket, TransportError> {
        self.ctx.connect(endpoint, kind, identity, self.poller.sender())
    }

    pub fn register(&mut self, socket: Socket, handler: Handler<S>) -> SocketHandle {
        let handle = socket.handle();
        logger_trace!(self.logger, "register {:?}", socket);
        self.poller.register(handle);
        self.sockets.insert(handle, Registered { socket, handler: Some(handler) });
        handle
    }

    pub fn bind(&mut self, endpoint: &str, kind: SocketKind, handler: Handler<S>) -> Result<SocketHandle, TransportError> {
        let socket = self.create_bound(endpoint, kind)?;
        Ok(self.register(socket, handler))
    }

    pub fn connect(
        &mut self, endpoint: &str, kind: SocketKind, identity: PeerToken, handler: Handler<S>,
    ) -> Result<SocketHandle, TransportError> {
        let socket = self.create_connected(endpoint, kind, identity)?;
        Ok(self.register(socket, handler))
    }

    /// Raw send, every error is returned. See [Reactor::send] for the hot path.
    pub fn send(&mut self, handle: SocketHandle, msg: Message) -> Result<(), TransportError> {
        match self.sockets.get_mut(&handle) {
            Some(reg) => reg.socket.send(msg),
            None => Err(TransportError::NotRegistered(handle.0)),
        }
    }

    /// Unregister and close. Unknown handles are an error here, tables decide whether
    /// that matters.
    pub fn close(&mut self, handle: SocketHandle) -> Result<(), TransportError> {
        self.poller.unregister(handle);
        match self.sockets.remove(&handle) {
            Some(mut reg) => {
                logger_trace!(self.logger, "close {:?}", reg.socket);
                reg.socket.close()
            }
            None => Err(TransportError::NotRegistered(handle.0)),
        }
    }

    fn close_all(&mut self) {
        for (handle, mut reg) in self.sockets.drain() {
            self.poller.unregister(handle);
            if let Err(e) = reg.socket.close() {
                logger_warn!(self.logger, "close {:?}: {}", handle, e);
            }
        }
    }

    #[inline]
    pub fn endpoint(&self, handle: SocketHandle) -> Option<&str> {
        self.sockets.get(&handle).map(|r| r.socket.endpoint())
    }

    #[inline]
    pub fn contains(&self, handle: SocketHandle) -> bool {
        self.sockets.contains_key(&handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    #[inline]
    fn take_handler(&mut self, handle: SocketHandle) -> Option<Handler<S>> {
        self.sockets.get_mut(&handle).and_then(|r| r.handler.take())
    }

    #[inline]
    fn restore_handler(&mut self, handle: SocketHandle, handler: Handler<S>) {
        // the handler may have closed its own socket
        if let Some(reg) = self.sockets.get_mut(&handle) {
            if reg.handler.is_none() {
                reg.handler = Some(handler);
            }
        }
    }
}

/// Backends and the number of inproc channels over each.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingStatus {
    pub backends: Vec<(String, u32)>,
}

impl RoutingStatus {
    pub fn encode(&self) -> Message {
        let mut frames = Vec::with_capacity(1 + self.backends.len() * 2);
        frames.push(encode_u32(self.backends.len() as u32));
        for (address, channels) in self.backends.iter() {
            frames.push(Bytes::copy_from_slice(address.as_bytes()));
            frames.push(encode_u32(*channels));
        }
        frames
    }

    pub fn decode(frames: &[Frame]) -> Result<Self, ProtoError> {
        let Some((count, rest)) = frames.split_first() else {
            return Err(ProtoError::Malformed("empty routing status".to_string()));
        };
        let count = decode_u32(count, "backend count")? as usize;
        if rest.len() != count * 2 {
            return Err(ProtoError::Malformed(format!("routing status of {} backends has {} frames", count, rest.len())));
        }
        let mut backends = Vec::with_capacity(count);
        for pair in rest.chunks(2) {
            backends.push((decode_address(&pair[0])?, decode_u32(&pair[1], "channel count")?));
        }
        backends.sort();
        Ok(Self { backends })
    }

    pub fn channels(&self, address: &str) -> Option<u32> {
        self.backends.iter().find(|(a, _)| a == address).map(|(_, c)| *c)
    }
}

/// Answer of the reactor to a routing command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub code: ResponseCode,
    pub body: Message,
}

impl Ack {
    fn encode(self) -> Message {
        let mut msg = Vec::with_capacity(self.body.len() + 1);
        msg.push(self.code.encode());
        msg.extend(self.body);
        msg
    }

    pub fn decode(mut msg: Message) -> Result<Self, ProtoError> {
        if msg.is_empty() {
            return Err(ProtoError::Malformed("empty ack".to_string()));
        }
        let body = msg.split_off(1);
        Ok(Self { code: ResponseCode::decode(&msg[0])?, body })
    }

    /// The body of a successful ack, otherwise the error it carries.
    pub fn into_result(self) -> Result<Message, FabricError> {
        self.code.into_result(self.body)
    }
}

/// The reactor, only ever touched by its own thread.
pub struct Reactor<S> {
    pub io: Io<S>,
    pub backends: BackendTable,
    pub state: S,
    config: ReactorConfig,
    tasks: Rx<Task<S>>,
    running: Arc<AtomicBool>,
    last_maintenance: Instant,
    handle: Weak<HandleInner<S>>,
}

impl<S: ReactorState> Reactor<S> {
    /// A handle to this reactor, for work that completes on other threads.
    /// `None` once every outside handle is gone.
    #[inline]
    pub fn handle(&self) -> Option<ReactorHandle<S>> {
        self.handle.upgrade().map(|inner| ReactorHandle { inner })
    }

    #[inline]
    pub fn logger(&self) -> &LogFilter {
        &self.io.logger
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    #[inline]
    pub fn context(&self) -> &Context {
        self.io.context()
    }

    /// Send on a reactor socket. A missing peer is routine on this transport: the
    /// message is logged and dropped, never raised into the loop.
    pub fn send(&mut self, handle: SocketHandle, msg: Message) -> bool {
        match self.io.send(handle, msg) {
            Ok(()) => {
                if let Some(b) = self.backends.get_by_handle_mut(handle) {
                    b.monitor.record_outbound();
                }
                true
            }
            Err(e) => {
                if e.is_unreachable() {
                    logger_debug!(self.io.logger, "send on {:?} dropped: {}", handle, e);
                } else {
                    logger_warn!(self.io.logger, "send on {:?} failed: {}", handle, e);
                }
                if let Some(b) = self.backends.get_by_handle_mut(handle) {
                    b.monitor.record_failure();
                }
                false
            }
        }
    }

    /// The backend connection of `address`, connected on first use.
    pub fn open_backend(&mut self, address: &str) -> Result<SocketHandle, TransportError> {
        self.backends.open(&mut self.io, address, |io, address| {
            let socket = io.create_connected(address, SocketKind::Dealer, PeerToken::random())?;
            let handler: Handler<S> = Box::new(router::demultiplex::<S>);
            logger_debug!(io.logger, "backend {} opened as {:?}", address, socket.handle());
            Ok((socket, handler))
        })
    }

    /// Unknown addresses are a no-op, `Ok(false)`.
    pub fn close_backend(&mut self, address: &str, reason: CloseReason) -> Result<bool, ChannelError> {
        let r = self.backends.close(&mut self.io, address);
        if !matches!(r, Ok(false)) {
            logger_debug!(self.io.logger, "backend {} closed ({:?})", address, reason);
            S::on_backend_closed(self, address, reason);
        }
        r
    }

    /// The inproc channel `token` under the backend of `address`, both opened on first use.
    ///
    /// The channel is a bound pair socket at [inproc_endpoint], whatever arrives on it is
    /// multiplexed onto the backend.
    pub fn open_inproc(&mut self, address: &str, token: PeerToken) -> Result<SocketHandle, TransportError> {
        self.open_backend(address)?;
        let Some(backend) = self.backends.get_mut(address) else {
            return Err(TransportError::Closed);
        };
        let owner = address.to_string();
        backend.inproc.open(&mut self.io, token, move |io, token| {
            let socket = io.create_bound(&inproc_endpoint(&owner, token), SocketKind::Pair)?;
            let token = *token;
            let handler: Handler<S> =
                Box::new(move |r: &mut Reactor<S>, _h, msg| router::multiplex(r, &owner, token, msg));
            Ok((socket, handler))
        })
    }

    /// Unknown channels are a no-op, `Ok(false)`.
    pub fn close_inproc(&mut self, address: &str, token: &PeerToken) -> Result<bool, TransportError> {
        match self.backends.get_mut(address) {
            Some(backend) => backend.inproc.close(&mut self.io, token),
            None => Ok(false),
        }
    }

    pub fn status(&self) -> RoutingStatus {
        let mut backends: Vec<(String, u32)> =
            self.backends.iter().map(|b| (b.address.clone(), b.inproc.len() as u32)).collect();
        backends.sort();
        RoutingStatus { backends }
    }

    /// Apply a routing command, returning the ack body.
    pub fn apply(&mut self, cmd: &RoutingCommand) -> Result<Message, FabricError> {
        let address = || {
            cmd.address
                .as_deref()
                .ok_or_else(|| ProtoError::Malformed(format!("{:?} without address", cmd.action)))
        };
        let token = || cmd.inproc.ok_or_else(|| ProtoError::Malformed(format!("{:?} without token", cmd.action)));
        match cmd.action {
            RoutingAction::OpenBackend => {
                self.open_backend(address()?)?;
                Ok(Vec::new())
            }
            RoutingAction::CloseBackend => {
                self.close_backend(address()?, CloseReason::Requested)?;
                Ok(Vec::new())
            }
            RoutingAction::OpenInproc => {
                let (address, token) = (address()?, token()?);
                self.open_inproc(address, token)?;
                Ok(vec![Bytes::from(inproc_endpoint(address, &token))])
            }
            RoutingAction::CloseInproc => {
                self.close_inproc(address()?, &token()?)?;
                Ok(Vec::new())
            }
            RoutingAction::GetStatus => Ok(self.status().encode()),
        }
    }

    fn on_control(&mut self, msg: Message, reply: Option<oneshot::Sender<Message>>) {
        let result = match msg.first() {
            Some(frame) if msg.len() == 1 => {
                RoutingCommand::decode(frame).map_err(FabricError::from).and_then(|cmd| {
                    logger_debug!(self.io.logger, "routing command {:?}", cmd);
                    self.apply(&cmd)
                })
            }
            _ => Err(ProtoError::Malformed(format!("routing command of {} frames", msg.len())).into()),
        };
        let ack = match result {
            Ok(body) => Ack { code: ResponseCode::Ok, body },
            Err(FabricError::Proto(ProtoError::UnknownAction(a))) => {
                logger_warn!(self.io.logger, "unknown routing action {}", a);
                Ack { code: ResponseCode::UnknownCommand, body: vec![encode_u32(a)] }
            }
            Err(e) => {
                logger_warn!(self.io.logger, "routing command failed: {}", e);
                Ack {
                    code: ResponseCode::Exception,
                    body: vec![RemoteError::new(RemoteError::GENERIC, e.to_string()).encode()],
                }
            }
        };
        if self.config.ack_routing_commands {
            if let Some(reply) = reply {
                let _ = reply.send(ack.encode());
            }
        }
    }

    fn on_message(&mut self, handle: SocketHandle, msg: Message) {
        let Some(mut handler) = self.io.take_handler(handle) else {
            logger_trace!(self.io.logger, "{:?} has no handler, {} frames dropped", handle, msg.len());
            return;
        };
        handler(self, handle, msg);
        self.io.restore_handler(handle, handler);
    }

    fn dispatch(&mut self, ev: Event) {
        match ev.handle {
            SocketHandle::CONTROL => self.on_control(ev.msg, ev.reply),
            SocketHandle::WAKE => {}
            handle => self.on_message(handle, ev.msg),
        }
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            task(self);
        }
    }

    fn maintain(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_maintenance) < self.config.maintenance_interval {
            return;
        }
        self.last_maintenance = now;
        let doomed: Vec<(String, Health)> = self
            .backends
            .iter()
            .filter_map(|b| match b.monitor.verdict(now, &self.config, b.inproc.len()) {
                Health::Healthy => None,
                h => Some((b.address.clone(), h)),
            })
            .collect();
        for (address, health) in doomed {
            logger_info!(self.io.logger, "closing backend {}: {:?}", address, health);
            let reason = if health == Health::Idle { CloseReason::Idle } else { CloseReason::Failing };
            if let Err(e) = self.close_backend(&address, reason) {
                logger_warn!(self.io.logger, "close backend {}: {}", address, e);
            }
        }
    }

    /// Stop the loop after the current turn.
    #[inline]
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn run(mut self, setup: Vec<SetupHook<S>>) {
        for hook in setup {
            if let Err(e) = hook(&mut self) {
                logger_error!(self.io.logger, "reactor setup failed: {}", e);
            }
        }
        logger_info!(self.io.logger, "reactor started");
        while self.running.load(Ordering::Acquire) {
            if let Some(ev) = self.io.poller.poll(self.config.poll_timeout) {
                self.dispatch(ev);
            }
            self.drain_tasks();
            self.maintain();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let addresses: Vec<String> = self.backends.iter().map(|b| b.address.clone()).collect();
        match self.backends.close_all(&mut self.io) {
            Ok(n) => logger_debug!(self.io.logger, "closed {} backends", n),
            Err(e) => logger_warn!(self.io.logger, "shutdown: {}", e),
        }
        for address in addresses {
            S::on_backend_closed(self, &address, CloseReason::Shutdown);
        }
        self.io.close_all();
        // tasks queued after the last turn are dropped, their reply channels with them
        while self.tasks.try_recv().is_ok() {}
        logger_info!(self.io.logger, "reactor stopped");
    }
}

struct HandleInner<S> {
    events: MTx<Event>,
    tasks: MTx<Task<S>>,
    running: Arc<AtomicBool>,
    config: ReactorConfig,
    logger: Arc<LogFilter>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    thread_id: OnceLock<thread::ThreadId>,
}

impl<S> HandleInner<S> {
    fn wake(&self) {
        let _ = self.events.send(Event { handle: SocketHandle::WAKE, msg: Vec::new(), reply: None });
    }
}

impl<S> Drop for HandleInner<S> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.wake();
    }
}

/// Cross-thread access to a running reactor. The loop stops when the last handle drops.
pub struct ReactorHandle<S> {
    inner: Arc<HandleInner<S>>,
}

impl<S> Clone for ReactorHandle<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: ReactorState> ReactorHandle<S> {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.inner.logger.set_level(level);
    }

    /// Send a routing command over the control channel.
    ///
    /// With `ack_routing_commands`, waits for the reactor's ack and returns it;
    /// otherwise returns `None` as soon as the command is queued.
    pub async fn submit(&self, cmd: &RoutingCommand) -> Result<Option<Ack>, FabricError> {
        let frame = cmd.encode()?;
        if !self.inner.config.ack_routing_commands {
            self.post(frame, None)?;
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        self.post(frame, Some(tx))?;
        match tokio::time::timeout(self.inner.config.ack_timeout, rx).await {
            Ok(Ok(msg)) => Ok(Some(Ack::decode(msg)?)),
            Ok(Err(_)) => Err(FabricError::Shutdown),
            Err(_) => Err(FabricError::Timeout),
        }
    }

    fn post(&self, frame: Frame, reply: Option<oneshot::Sender<Message>>) -> Result<(), FabricError> {
        if !self.is_running() {
            return Err(FabricError::Shutdown);
        }
        self.inner
            .events
            .send(Event { handle: SocketHandle::CONTROL, msg: vec![frame], reply })
            .map_err(|_| FabricError::Shutdown)
    }

    /// Run `f` on the reactor thread between two polls.
    pub fn execute<F>(&self, f: F) -> Result<(), FabricError>
    where
        F: FnOnce(&mut Reactor<S>) + Send + 'static,
    {
        if !self.is_running() {
            return Err(FabricError::Shutdown);
        }
        self.inner.tasks.send(Box::new(f)).map_err(|_| FabricError::Shutdown)?;
        self.inner.wake();
        Ok(())
    }

    /// Run `f` on the reactor thread and wait for its result.
    pub async fn query<R, F>(&self, f: F) -> Result<R, FabricError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Reactor<S>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |r| {
            let _ = tx.send(f(r));
        })?;
        rx.await.map_err(|_| FabricError::Shutdown)
    }

    /// Stop the loop and wait for the thread to exit.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wake();
        if self.inner.thread_id.get() == Some(&thread::current().id()) {
            return;
        }
        let th = self.inner.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(th) = th {
            if th.join().is_err() {
                logger_error!(self.inner.logger, "reactor thread panicked");
            }
        }
    }
}

pub struct ReactorBuilder<S> {
    ctx: Context,
    config: ReactorConfig,
    name: String,
    logger: Arc<LogFilter>,
    setup: Vec<SetupHook<S>>,
}

impl<S: ReactorState> ReactorBuilder<S> {
    pub fn new(ctx: Context, config: ReactorConfig) -> Self {
        Self { ctx, config, name: "reactor".to_string(), logger: Arc::new(LogFilter::new()), setup: Vec::new() }
    }

    /// Thread name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn logger(mut self, logger: Arc<LogFilter>) -> Self {
        self.logger = logger;
        self
    }

    /// Run `hook` on the reactor thread before the first poll.
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut Reactor<S>) -> Result<(), FabricError> + Send + 'static,
    {
        self.setup.push(Box::new(hook));
        self
    }

    /// Start the reactor thread. `init` builds the user state on that thread.
    pub fn spawn<F>(self, init: F) -> Result<ReactorHandle<S>, FabricError>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let Self { ctx, config, name, logger, setup } = self;
        let (task_tx, task_rx) = mpsc::unbounded_blocking::<Task<S>>();
        // the event channel exists before the loop, so the handle can post right away
        let (events, event_rx) = mpsc::unbounded_blocking::<Event>();
        let running = Arc::new(AtomicBool::new(true));
        let inner = Arc::new(HandleInner {
            events: events.clone(),
            tasks: task_tx,
            running: running.clone(),
            config: config.clone(),
            logger: logger.clone(),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
        });
        let weak = Arc::downgrade(&inner);
        let th = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Some(inner) = weak.upgrade() {
                    let _ = inner.thread_id.set(thread::current().id());
                }
                let io = Io { ctx, poller: Poller::with_channel(events, event_rx), sockets: HashMap::new(), logger };
                let reactor = Reactor {
                    io,
                    backends: BackendTable::new(),
                    state: init(),
                    config,
                    tasks: task_rx,
                    running,
                    last_maintenance: Instant::now(),
                    handle: weak,
                };
                reactor.run(setup);
            })
            .map_err(TransportError::Io)?;
        *inner.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(th);
        Ok(ReactorHandle { inner })
    }
}
