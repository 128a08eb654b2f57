//! What a fabric instance keeps on its reactor thread.

use crate::router;
use crate::server::node::NodeService;
use occams_fabric_core::error::TransportError;
use occams_fabric_core::{InstanceId, Message, NodeId, PeerToken, Route};
use occams_fabric_stream::{CloseReason, Reactor, ReactorState, SocketHandle};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// Topology listener, called on the reactor thread with the instance and its control
/// address. Must not block.
pub type Listener = Arc<dyn Fn(InstanceId, &str) + Send + Sync>;

pub(crate) enum PendingReply {
    Once(oneshot::Sender<Result<Message, TransportError>>),
    /// Multi-part replies, removed once the receiver is gone
    Stream(mpsc::UnboundedSender<Message>),
}

/// A control request waiting for its reply, keyed by its correlation token.
pub(crate) struct Pending {
    pub address: String,
    pub reply: PendingReply,
}

/// The bound endpoint of a hosted node.
pub struct Binding {
    pub handle: SocketHandle,
    pub address: String,
    /// Control addresses of the instances that opened a route to it
    pub callers: HashSet<String>,
}

pub struct HostedNode {
    pub service: Arc<dyn NodeService>,
    pub binding: Option<Binding>,
}

pub struct FabricState {
    pub instance: InstanceId,
    pub control_address: Option<String>,
    pub(crate) control_socket: Option<SocketHandle>,
    /// Where node endpoints get bound
    pub bind_prefix: String,
    pub nodes: HashMap<NodeId, HostedNode>,
    /// The route cache of the node router
    pub routes: HashMap<NodeId, Route>,
    /// Known instances by control address, this one included
    pub instances: HashMap<InstanceId, String>,
    pub(crate) pending: HashMap<PeerToken, Pending>,
    pub(crate) on_connect: Vec<Listener>,
    pub(crate) on_disconnect: Vec<Listener>,
    pub(crate) rt: Handle,
}

impl FabricState {
    pub fn new(instance: InstanceId, bind_prefix: String, rt: Handle) -> Self {
        Self {
            instance,
            control_address: None,
            control_socket: None,
            bind_prefix,
            nodes: HashMap::new(),
            routes: HashMap::new(),
            instances: HashMap::new(),
            pending: HashMap::new(),
            on_connect: Vec::new(),
            on_disconnect: Vec::new(),
            rt,
        }
    }

    /// The remote instance whose control channel is `address`.
    pub fn instance_at(&self, address: &str) -> Option<InstanceId> {
        self.instances.iter().find(|(id, a)| **id != self.instance && a.as_str() == address).map(|(id, _)| *id)
    }

    /// Remote instances, sorted.
    pub fn remote_instances(&self) -> Vec<(InstanceId, String)> {
        let mut list: Vec<(InstanceId, String)> =
            self.instances.iter().filter(|(id, _)| **id != self.instance).map(|(id, a)| (*id, a.clone())).collect();
        list.sort();
        list
    }
}

fn notify(r: &Reactor<FabricState>, listeners: &[Listener], instance: InstanceId, address: &str) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(instance, address))).is_err() {
            logger_error!(r.logger(), "topology listener panicked on {}", instance);
        }
    }
}

/// Record a connected instance, listeners fire when it is new or moved.
pub(crate) fn register_instance(r: &mut Reactor<FabricState>, instance: InstanceId, address: &str) -> bool {
    if r.state.instances.get(&instance).map(|a| a.as_str()) == Some(address) {
        return false;
    }
    r.state.instances.insert(instance, address.to_string());
    logger_info!(r.logger(), "instance {} connected at {}", instance, address);
    let listeners = r.state.on_connect.clone();
    notify(r, &listeners, instance, address);
    true
}

/// Drop an instance with its routes and control connection. Idempotent.
pub(crate) fn forget_instance(r: &mut Reactor<FabricState>, instance: InstanceId) -> bool {
    if instance == r.state.instance {
        return false;
    }
    let Some(address) = r.state.instances.remove(&instance) else {
        return false;
    };
    let routes = router::drop_routes_via_instance(r, instance);
    if let Err(e) = r.close_backend(&address, CloseReason::Requested) {
        logger_warn!(r.logger(), "close control channel of {}: {}", instance, e);
    }
    logger_info!(r.logger(), "instance {} at {} disconnected, {} routes dropped", instance, address, routes);
    let listeners = r.state.on_disconnect.clone();
    notify(r, &listeners, instance, &address);
    true
}

impl ReactorState for FabricState {
    /// Traffic for no inproc channel is a control reply, or late.
    fn on_unrouted(r: &mut Reactor<Self>, address: &str, token: PeerToken, mut body: Message) {
        let Some(pending) = r.state.pending.remove(&token) else {
            logger_debug!(r.logger(), "no channel or request {} on {}, {} frames dropped", token, address, body.len());
            return;
        };
        if body.first().is_some_and(|f| f.is_empty()) {
            body.remove(0);
        }
        match pending.reply {
            PendingReply::Once(tx) => {
                let _ = tx.send(Ok(body));
            }
            PendingReply::Stream(tx) => {
                if tx.send(body).is_ok() {
                    r.state.pending.insert(token, Pending { address: pending.address, reply: PendingReply::Stream(tx) });
                }
            }
        }
    }

    fn on_backend_closed(r: &mut Reactor<Self>, address: &str, reason: CloseReason) {
        let orphans: Vec<PeerToken> =
            r.state.pending.iter().filter(|(_, p)| p.address == address).map(|(t, _)| *t).collect();
        for token in orphans {
            if let Some(Pending { reply: PendingReply::Once(tx), .. }) = r.state.pending.remove(&token) {
                let _ = tx.send(Err(TransportError::Closed));
            }
        }
        match reason {
            CloseReason::Failing => {
                router::drop_routes_at(r, address);
                if let Some(instance) = r.state.instance_at(address) {
                    forget_instance(r, instance);
                }
            }
            CloseReason::Requested => {
                if let Some(instance) = r.state.instance_at(address) {
                    forget_instance(r, instance);
                }
            }
            // reopened on next use
            CloseReason::Idle | CloseReason::Shutdown => {}
        }
    }
}
