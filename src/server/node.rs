//! Hosting nodes: services bound to a local endpoint each.
//!
//! A node endpoint is a router socket owned by the reactor. Requests are handed to the
//! node's [NodeService] on the tokio blocking pool, with a [Responder] that sends the
//! synchronous part and the callback parts back through the reactor.

use crate::state::{Binding, FabricState, HostedNode};
use bytes::Bytes;
use occams_fabric_codec::Codec;
use occams_fabric_core::envelope::{Envelope, restore_envelope, split_envelope};
use occams_fabric_core::error::{FabricError, ProtoError};
use occams_fabric_core::proto::{RemoteError, RequestHeader, ResponseHeader};
use occams_fabric_core::{Frame, Message, NodeId};
use occams_fabric_stream::reactor::Handler;
use occams_fabric_stream::{Reactor, ReactorHandle, SocketHandle, SocketKind};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Application code behind a node.
///
/// Runs on a blocking thread. Every request must be answered through its responder,
/// a responder dropped without a reply answers with an error.
pub trait NodeService: Send + Sync + 'static {
    fn call(&self, req: NodeRequest);
}

impl<F> NodeService for F
where
    F: Fn(NodeRequest) + Send + Sync + 'static,
{
    #[inline]
    fn call(&self, req: NodeRequest) {
        self(req)
    }
}

pub struct NodeRequest {
    pub node: NodeId,
    /// Callback parts the caller expects after the synchronous one
    pub additional_parts: u32,
    pub payload: Bytes,
    pub responder: Responder,
}

/// Sends the response parts of one request. Cheap to clone.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    reactor: ReactorHandle<FabricState>,
    socket: SocketHandle,
    envelope: Envelope,
    /// Put before the response header, `OK` when answering over the control channel
    prefix: Option<Frame>,
    additional_parts: u32,
    replied: AtomicBool,
}

impl ResponderInner {
    fn send(&self, part: u32, result: Result<Bytes, RemoteError>) -> bool {
        let (header, payload) = match result {
            Ok(payload) => (ResponseHeader::result(part), payload),
            Err(e) => (ResponseHeader::error(part), e.encode()),
        };
        let mut body = Vec::with_capacity(3);
        if let Some(prefix) = self.prefix.as_ref() {
            body.push(prefix.clone());
        }
        body.push(header.encode());
        body.push(payload);
        let msg = restore_envelope(self.envelope.clone(), body);
        let socket = self.socket;
        self.reactor
            .execute(move |r| {
                r.send(socket, msg);
            })
            .is_ok()
    }
}

impl Drop for ResponderInner {
    fn drop(&mut self) {
        if !*self.replied.get_mut() {
            self.send(0, Err(RemoteError::new(RemoteError::GENERIC, "request dropped without a reply")));
        }
    }
}

impl Responder {
    fn new(
        reactor: ReactorHandle<FabricState>, socket: SocketHandle, envelope: Envelope, prefix: Option<Frame>,
        additional_parts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                reactor,
                socket,
                envelope,
                prefix,
                additional_parts,
                replied: AtomicBool::new(false),
            }),
        }
    }

    /// Send the synchronous part, only the first reply counts.
    pub fn reply(&self, result: Result<Bytes, RemoteError>) -> bool {
        if self.inner.replied.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.send(0, result)
    }

    /// Send callback part `part`, counted from 1.
    pub fn callback(&self, part: u32, result: Result<Bytes, RemoteError>) -> bool {
        if part == 0 || part > self.inner.additional_parts {
            warn!("callback part {} out of range 1..={}", part, self.inner.additional_parts);
            return false;
        }
        self.inner.send(part, result)
    }

    #[inline]
    pub fn additional_parts(&self) -> u32 {
        self.inner.additional_parts
    }

    #[inline]
    pub fn has_replied(&self) -> bool {
        self.inner.replied.load(Ordering::Acquire)
    }
}

/// A service decoding its requests and encoding its results with `C`.
pub fn typed<C, Req, Resp, F>(f: F) -> impl NodeService
where
    C: Codec,
    Req: DeserializeOwned + 'static,
    Resp: Serialize + 'static,
    F: Fn(NodeId, Req) -> Result<Resp, RemoteError> + Send + Sync + 'static,
{
    let codec = C::default();
    move |req: NodeRequest| {
        let result = match codec.decode::<Req>(&req.payload) {
            Ok(args) => f(req.node, args).and_then(|resp| match codec.encode(&resp) {
                Ok(buf) => Ok(Bytes::from(buf)),
                Err(()) => Err(RemoteError::new(RemoteError::GENERIC, "failed to encode the response")),
            }),
            Err(()) => Err(RemoteError::new(RemoteError::MALFORMED, "failed to decode the request")),
        };
        req.responder.reply(result);
    }
}

/// Host `service` as `node`, replacing the service of a node already hosted.
pub fn host(r: &mut Reactor<FabricState>, node: NodeId, service: Arc<dyn NodeService>) {
    match r.state.nodes.get_mut(&node) {
        Some(hosted) => hosted.service = service,
        None => {
            r.state.nodes.insert(node, HostedNode { service, binding: None });
        }
    }
    logger_debug!(r.logger(), "hosting {}", node);
}

/// Stop hosting `node`, closing its endpoint.
pub fn unhost(r: &mut Reactor<FabricState>, node: &NodeId) -> Result<bool, FabricError> {
    if !close_binding(r, node)? {
        return Ok(false);
    }
    Ok(r.state.nodes.remove(node).is_some())
}

fn node_endpoint(prefix: &str, node: &NodeId) -> String {
    if prefix.starts_with("tcp://") {
        format!("{}:0", prefix)
    } else {
        format!("{}/{}", prefix, node)
    }
}

/// The bound address of `node`, binding it on first use. `caller` is recorded as a
/// route holder.
pub fn open_binding(r: &mut Reactor<FabricState>, node: NodeId, caller: Option<&str>) -> Result<String, FabricError> {
    let Some(hosted) = r.state.nodes.get_mut(&node) else {
        return Err(FabricError::NoSuchNode(node));
    };
    if let Some(binding) = hosted.binding.as_mut() {
        if let Some(caller) = caller {
            binding.callers.insert(caller.to_string());
        }
        return Ok(binding.address.clone());
    }
    let endpoint = node_endpoint(&r.state.bind_prefix, &node);
    let handler: Handler<FabricState> = Box::new(move |r, handle, msg| serve(r, node, handle, msg));
    let handle = r.io.bind(&endpoint, SocketKind::Router, handler)?;
    let address = r.io.endpoint(handle).unwrap_or(&endpoint).to_string();
    let mut callers = HashSet::new();
    if let Some(caller) = caller {
        callers.insert(caller.to_string());
    }
    logger_info!(r.logger(), "{} bound at {}", node, address);
    if let Some(hosted) = r.state.nodes.get_mut(&node) {
        hosted.binding = Some(Binding { handle, address: address.clone(), callers });
    }
    Ok(address)
}

/// Close the endpoint of `node`, false if the node is not hosted here.
pub fn close_binding(r: &mut Reactor<FabricState>, node: &NodeId) -> Result<bool, FabricError> {
    let Some(hosted) = r.state.nodes.get_mut(node) else {
        return Ok(false);
    };
    if let Some(binding) = hosted.binding.take() {
        logger_info!(r.logger(), "{} unbound from {}", node, binding.address);
        r.io.close(binding.handle)?;
    }
    Ok(true)
}

/// Forget `caller` as a route holder of `node`.
pub fn unregister_caller(r: &mut Reactor<FabricState>, node: &NodeId, caller: &str) -> bool {
    match r.state.nodes.get_mut(node).and_then(|h| h.binding.as_mut()) {
        Some(binding) => binding.callers.remove(caller),
        None => false,
    }
}

/// `[RequestHeader][payload]`
pub(crate) fn parse_request(body: &[Frame]) -> Result<(RequestHeader, Bytes), ProtoError> {
    match body {
        [header, payload] => Ok((RequestHeader::decode(header)?, payload.clone())),
        _ => Err(ProtoError::Malformed(format!("request of {} frames", body.len()))),
    }
}

/// Handler of a node endpoint.
fn serve(r: &mut Reactor<FabricState>, node: NodeId, socket: SocketHandle, msg: Message) {
    let (envelope, body) = match split_envelope(msg) {
        Ok(split) => split,
        Err(e) => {
            logger_warn!(r.logger(), "{}: request dropped: {}", node, e);
            return;
        }
    };
    match parse_request(&body) {
        Ok((header, payload)) => dispatch(r, socket, envelope, None, node, header, payload),
        Err(e) => {
            logger_warn!(r.logger(), "{}: {}", node, e);
            let body = vec![ResponseHeader::error(0).encode(), RemoteError::new(RemoteError::MALFORMED, e.to_string()).encode()];
            r.send(socket, restore_envelope(envelope, body));
        }
    }
}

/// Run the service of `node` for one request, the response goes out on `socket`.
pub(crate) fn dispatch(
    r: &mut Reactor<FabricState>, socket: SocketHandle, envelope: Envelope, prefix: Option<Frame>, node: NodeId,
    header: RequestHeader, payload: Bytes,
) {
    let Some(service) = r.state.nodes.get(&node).map(|h| h.service.clone()) else {
        let mut body = Vec::with_capacity(3);
        body.extend(prefix);
        body.push(ResponseHeader::error(0).encode());
        body.push(RemoteError::new(RemoteError::NO_SUCH_NODE, format!("{} is not hosted here", node)).encode());
        r.send(socket, restore_envelope(envelope, body));
        return;
    };
    let Some(reactor) = r.handle() else {
        logger_debug!(r.logger(), "shutting down, request for {} dropped", node);
        return;
    };
    let responder = Responder::new(reactor, socket, envelope, prefix, header.additional_parts);
    let guard = responder.clone();
    let req = NodeRequest { node, additional_parts: header.additional_parts, payload, responder };
    r.state.rt.spawn_blocking(move || {
        if catch_unwind(AssertUnwindSafe(|| service.call(req))).is_err() {
            error!("service of {} panicked", node);
            guard.reply(Err(RemoteError::new(RemoteError::PANIC, format!("service of {} panicked", node))));
        }
    });
}
