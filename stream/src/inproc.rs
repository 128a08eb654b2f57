//! In-process transport, `inproc://name`.
//!
//! Endpoints live in a registry shared by every socket of one [Context](crate::Context).
//! A connect must happen after the bind, otherwise it is refused.

use crate::transport::{Link, Sink, SocketKind, Transport};
use bytes::Bytes;
use occams_fabric_core::error::TransportError;
use occams_fabric_core::{Message, PeerToken};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[inline]
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

type Registry = Arc<Mutex<HashMap<String, Arc<InprocEndpoint>>>>;

struct InprocEndpoint {
    name: String,
    kind: SocketKind,
    binder: Sink,
    peers: Mutex<HashMap<PeerToken, Sink>>,
    open: AtomicBool,
}

pub struct InprocTransport {
    registry: Registry,
}

impl Default for InprocTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InprocTransport {
    pub fn new() -> Self {
        Self { registry: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl Transport for InprocTransport {
    fn scheme(&self) -> &'static str {
        "inproc"
    }

    fn bind(&self, address: &str, kind: SocketKind, sink: Sink) -> Result<Box<dyn Link>, TransportError> {
        if kind == SocketKind::Dealer {
            return Err(TransportError::Unsupported { kind: "bound dealer", scheme: "inproc" });
        }
        let mut registry = lock(&self.registry);
        if registry.contains_key(address) {
            return Err(TransportError::AddressInUse(format!("inproc://{}", address)));
        }
        let ep = Arc::new(InprocEndpoint {
            name: address.to_string(),
            kind,
            binder: sink,
            peers: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        });
        registry.insert(address.to_string(), ep.clone());
        trace!("inproc bind {} ({})", address, kind.name());
        Ok(Box::new(InprocBound { ep, registry: self.registry.clone(), endpoint: format!("inproc://{}", address) }))
    }

    fn connect(
        &self, address: &str, kind: SocketKind, identity: PeerToken, sink: Sink,
    ) -> Result<Box<dyn Link>, TransportError> {
        let refused = || TransportError::ConnectionRefused(format!("inproc://{}", address));
        let ep = lock(&self.registry).get(address).cloned().ok_or_else(refused)?;
        match (kind, ep.kind) {
            (SocketKind::Dealer, SocketKind::Router) | (SocketKind::Pair, SocketKind::Pair) => {}
            (SocketKind::Router, _) => {
                return Err(TransportError::Unsupported { kind: "connected router", scheme: "inproc" });
            }
            _ => return Err(refused()),
        }
        {
            let mut peers = lock(&ep.peers);
            if ep.kind == SocketKind::Pair && !peers.is_empty() {
                return Err(refused());
            }
            if peers.contains_key(&identity) {
                return Err(TransportError::AddressInUse(format!("identity {} on inproc://{}", identity, address)));
            }
            peers.insert(identity, sink);
        }
        trace!("inproc connect {} as {}", address, identity);
        Ok(Box::new(InprocConnected { ep, identity, endpoint: format!("inproc://{}", address) }))
    }
}

struct InprocBound {
    ep: Arc<InprocEndpoint>,
    registry: Registry,
    endpoint: String,
}

impl Link for InprocBound {
    fn send(&mut self, mut msg: Message) -> Result<(), TransportError> {
        let peers = lock(&self.ep.peers);
        match self.ep.kind {
            SocketKind::Router => {
                if msg.is_empty() {
                    return Err(TransportError::HostUnreachable("router message without identity".to_string()));
                }
                let identity = PeerToken::from_slice(&msg[0]).map_err(|_| {
                    TransportError::HostUnreachable(format!("invalid identity frame on {}", self.endpoint))
                })?;
                let Some(peer) = peers.get(&identity) else {
                    return Err(TransportError::HostUnreachable(format!("{} on {}", identity, self.endpoint)));
                };
                peer.deliver(msg.split_off(1))
            }
            _ => match peers.values().next() {
                Some(peer) => peer.deliver(msg),
                None => Err(TransportError::HostUnreachable(format!("no peer on {}", self.endpoint))),
            },
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.ep.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut registry = lock(&self.registry);
        if registry.get(&self.ep.name).map(|e| Arc::ptr_eq(e, &self.ep)).unwrap_or(false) {
            registry.remove(&self.ep.name);
        }
        lock(&self.ep.peers).clear();
        Ok(())
    }
}

struct InprocConnected {
    ep: Arc<InprocEndpoint>,
    identity: PeerToken,
    endpoint: String,
}

impl Link for InprocConnected {
    fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        if !self.ep.open.load(Ordering::Acquire) {
            return Err(TransportError::HostUnreachable(self.endpoint.clone()));
        }
        match self.ep.kind {
            SocketKind::Router => {
                let mut framed = Vec::with_capacity(msg.len() + 1);
                framed.push(Bytes::copy_from_slice(self.identity.as_bytes()));
                framed.extend(msg);
                self.ep.binder.deliver(framed)
            }
            _ => self.ep.binder.deliver(msg),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.ep.open.load(Ordering::Acquire)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        lock(&self.ep.peers).remove(&self.identity);
        Ok(())
    }
}
