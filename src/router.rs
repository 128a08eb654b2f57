//! Node level routing: which physical address reaches a node.
//!
//! Routes are cached on the reactor thread. Opening a route to a remote node asks its
//! instance to bind the node (`OPEN_ROUTE_TO_NODE`) and connects one backend to the
//! returned address; every later call to that node reuses both.

use crate::client::control::ControlClient;
use crate::server::node;
use crate::state::FabricState;
use occams_fabric_core::error::FabricError;
use occams_fabric_core::{InstanceId, NodeId, Route};
use occams_fabric_stream::{CloseReason, Reactor, ReactorHandle};

/// Drop the cached route to `node`, closing its backend unless another route shares it.
pub fn drop_route(r: &mut Reactor<FabricState>, node: &NodeId) -> Option<Route> {
    let route = r.state.routes.remove(node)?;
    logger_debug!(r.logger(), "route to {} via {} dropped", node, route.address);
    if !r.state.routes.values().any(|other| other.address == route.address) {
        if let Err(e) = r.close_backend(&route.address, CloseReason::Requested) {
            logger_warn!(r.logger(), "close backend {}: {}", route.address, e);
        }
    }
    Some(route)
}

/// Drop every route to a node owned by `instance`.
pub fn drop_routes_via_instance(r: &mut Reactor<FabricState>, instance: InstanceId) -> u32 {
    let doomed: Vec<NodeId> = r.state.routes.keys().filter(|n| n.instance() == instance).copied().collect();
    let mut count = 0;
    for node in doomed {
        if drop_route(r, &node).is_some() {
            count += 1;
        }
    }
    count
}

/// The backend of `address` failed: every route over it is stale.
pub(crate) fn drop_routes_at(r: &mut Reactor<FabricState>, address: &str) {
    let before = r.state.routes.len();
    r.state.routes.retain(|_, route| route.address != address);
    let dropped = before - r.state.routes.len();
    if dropped > 0 {
        logger_info!(r.logger(), "{} routes via failed backend {} dropped", dropped, address);
    }
}

/// Opens, caches and closes routes on behalf of callers on any thread.
#[derive(Clone)]
pub struct NodeRouter {
    reactor: ReactorHandle<FabricState>,
    control: ControlClient,
    instance: InstanceId,
}

impl NodeRouter {
    pub fn new(reactor: ReactorHandle<FabricState>, control: ControlClient, instance: InstanceId) -> Self {
        Self { reactor, control, instance }
    }

    pub async fn route(&self, node: NodeId) -> Result<Option<Route>, FabricError> {
        self.reactor.query(move |r| r.state.routes.get(&node).cloned()).await
    }

    /// The route to `node`, opened on first use with `caller_address` as the route holder.
    ///
    /// Idempotent: later calls return the cached route, over the same backend.
    pub async fn open_route_to_node(&self, node: NodeId, caller_address: &str) -> Result<Route, FabricError> {
        if let Some(route) = self.route(node).await? {
            return Ok(route);
        }
        let address = if node.instance() == self.instance {
            let caller = caller_address.to_string();
            self.reactor.query(move |r| node::open_binding(r, node, Some(&caller))).await??
        } else {
            let control = self.control_address(node.instance()).await?;
            self.control.open_route_to_node(&control, node, caller_address).await?
        };
        let route = Route::new(node, address, self.instance);
        self.reactor
            .query(move |r| -> Result<Route, FabricError> {
                // a concurrent open may have won, keep its route
                let route = r.state.routes.entry(node).or_insert(route).clone();
                r.open_backend(&route.address)?;
                Ok(route)
            })
            .await?
    }

    /// Drop the route to `node` here and release it on the owning instance.
    /// False when there was no route.
    pub async fn close_route_to_node(&self, node: NodeId, caller_address: &str) -> Result<bool, FabricError> {
        let dropped = self.reactor.query(move |r| drop_route(r, &node)).await?.is_some();
        if node.instance() == self.instance {
            let caller = caller_address.to_string();
            self.reactor.query(move |r| node::unregister_caller(r, &node, &caller)).await?;
        } else if let Ok(control) = self.control_address(node.instance()).await {
            if let Err(e) = self.control.close_route_to_node(&control, node, Some(caller_address)).await {
                warn!("release route to {} on {}: {}", node, control, e);
            }
        }
        Ok(dropped)
    }

    pub async fn close_routes_via_instance(&self, instance: InstanceId) -> Result<u32, FabricError> {
        self.reactor.query(move |r| drop_routes_via_instance(r, instance)).await
    }

    async fn control_address(&self, instance: InstanceId) -> Result<String, FabricError> {
        self.reactor
            .query(move |r| r.state.instances.get(&instance).cloned())
            .await?
            .ok_or(FabricError::NoSuchInstance(instance))
    }
}
