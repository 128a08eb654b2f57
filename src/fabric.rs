use crate::client::{Call, Callback, ChannelPool, ControlClient, Invoker};
use crate::router::NodeRouter;
use crate::server::control;
use crate::server::node::{self, NodeService};
use crate::state::{self, FabricState, Listener};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use occams_fabric_codec::Codec;
use occams_fabric_core::error::{FabricError, InvokeError};
use occams_fabric_core::{FabricConfig, InstanceId, NodeId, Route};
use occams_fabric_stream::reactor::RoutingStatus;
use occams_fabric_stream::{Context, ReactorBuilder, ReactorHandle};
use occams_fabric_tcp::TcpTransport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Where the instances to connect at startup come from.
pub trait InstanceDirectory: Send + Sync + 'static {
    /// Control addresses of the known instances.
    fn instances(&self) -> Vec<String>;
}

/// A fixed list of control addresses.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory(pub Vec<String>);

impl InstanceDirectory for StaticDirectory {
    fn instances(&self) -> Vec<String> {
        self.0.clone()
    }
}

pub struct FabricBuilder {
    config: FabricConfig,
    instance: Option<InstanceId>,
    ctx: Option<Context>,
    rt: Option<Handle>,
    directory: Option<Box<dyn InstanceDirectory>>,
    logger: Option<Arc<LogFilter>>,
    hosted: Vec<(u64, Arc<dyn NodeService>)>,
}

impl FabricBuilder {
    pub fn new(config: FabricConfig) -> Self {
        Self { config, instance: None, ctx: None, rt: None, directory: None, logger: None, hosted: Vec::new() }
    }

    /// Defaults to a random id.
    pub fn instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Defaults to a context with the inproc and tcp transports.
    /// Instances talking over `inproc://` must share one context.
    pub fn context(mut self, ctx: Context) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Runtime of the invocation drivers and node services, defaults to the current one.
    pub fn runtime(mut self, rt: Handle) -> Self {
        self.rt = Some(rt);
        self
    }

    pub fn directory<D: InstanceDirectory>(mut self, directory: D) -> Self {
        self.directory = Some(Box::new(directory));
        self
    }

    pub fn logger(mut self, logger: Arc<LogFilter>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Host `service` as the local node `local` from the start.
    pub fn host<N: NodeService>(mut self, local: u64, service: N) -> Self {
        self.hosted.push((local, Arc::new(service)));
        self
    }

    pub async fn build(self) -> Result<Fabric, FabricError> {
        let Self { config, instance, ctx, rt, directory, logger, hosted } = self;
        let rt = rt.unwrap_or_else(Handle::current);
        let instance = instance.unwrap_or_else(InstanceId::random);
        let ctx = ctx.unwrap_or_else(|| {
            Context::builder().transport(TcpTransport::new(rt.clone(), config.tcp.clone())).build()
        });
        let mut builder = ReactorBuilder::new(ctx.clone(), config.reactor.clone()).name("fabric-reactor");
        if let Some(logger) = logger {
            builder = builder.logger(logger);
        }
        let (prefix, state_rt) = (config.bind_prefix.clone(), rt.clone());
        let reactor = builder.spawn(move || FabricState::new(instance, prefix, state_rt))?;

        let endpoint = config.control_endpoint.clone();
        let control_address = reactor
            .query(move |r| -> Result<String, FabricError> {
                let address = control::bind(r, &endpoint)?;
                r.state.instances.insert(instance, address.clone());
                for (local, service) in hosted {
                    node::host(r, NodeId::new(instance, local), service);
                }
                Ok(address)
            })
            .await??;
        info!("fabric instance {} listening on {}", instance, control_address);

        let control = ControlClient::new(reactor.clone(), config.control_timeout);
        let pool = Arc::new(ChannelPool::new(reactor.clone(), ctx, config.pool.clone()));
        let fabric = Fabric {
            instance,
            router: NodeRouter::new(reactor.clone(), control.clone(), instance),
            invoker: Invoker::new(pool.clone(), rt).with_timeout(config.call_timeout),
            control_address,
            reactor,
            control,
            pool,
        };
        if let Some(directory) = directory {
            for address in directory.instances() {
                if let Err(e) = fabric.connect_to_instance(&address).await {
                    warn!("connect to instance at {}: {}", address, e);
                }
            }
        }
        Ok(fabric)
    }
}

/// One instance of the fabric.
///
/// Nodes hosted here are reachable by every connected instance, and nodes of connected
/// instances can be called from here. Dropping the last handle to the reactor stops it,
/// call [Fabric::shutdown] to also wait for it.
pub struct Fabric {
    instance: InstanceId,
    control_address: String,
    reactor: ReactorHandle<FabricState>,
    control: ControlClient,
    router: NodeRouter,
    pool: Arc<ChannelPool<FabricState>>,
    invoker: Invoker<ChannelPool<FabricState>>,
}

impl Fabric {
    #[inline]
    pub fn builder(config: FabricConfig) -> FabricBuilder {
        FabricBuilder::new(config)
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Where other instances reach this one.
    #[inline]
    pub fn control_address(&self) -> &str {
        &self.control_address
    }

    /// The id of the local node `local`.
    #[inline]
    pub fn node(&self, local: u64) -> NodeId {
        NodeId::new(self.instance, local)
    }

    #[inline]
    pub fn reactor(&self) -> &ReactorHandle<FabricState> {
        &self.reactor
    }

    #[inline]
    pub fn control(&self) -> &ControlClient {
        &self.control
    }

    #[inline]
    pub fn router(&self) -> &NodeRouter {
        &self.router
    }

    #[inline]
    pub fn pool(&self) -> &Arc<ChannelPool<FabricState>> {
        &self.pool
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.reactor.set_log_level(level);
    }

    /// Connect to the instance whose control channel is at `address`.
    ///
    /// Connect listeners fire the first time an instance shows up.
    pub async fn connect_to_instance(&self, address: &str) -> Result<InstanceId, FabricError> {
        let (instance, nodes) = self.control.get_instance_status(address).await?;
        if instance == self.instance {
            return Ok(instance);
        }
        debug!("instance {} at {} hosts {} nodes", instance, address, nodes.len());
        let address = address.to_string();
        self.reactor.query(move |r| state::register_instance(r, instance, &address)).await?;
        Ok(instance)
    }

    /// Drop the routes via `instance` and its control connection. False if unknown.
    pub async fn disconnect_instance(&self, instance: InstanceId) -> Result<bool, FabricError> {
        self.reactor.query(move |r| state::forget_instance(r, instance)).await
    }

    /// Connected instances and their control addresses, this one excluded.
    pub async fn get_active_connections(&self) -> Result<Vec<(InstanceId, String)>, FabricError> {
        self.reactor.query(|r| r.state.remote_instances()).await
    }

    /// `f` runs on the reactor thread and must not block.
    pub async fn subscribe_to_connect<F>(&self, f: F) -> Result<(), FabricError>
    where
        F: Fn(InstanceId, &str) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(f);
        self.reactor.query(move |r| r.state.on_connect.push(listener)).await
    }

    /// `f` runs on the reactor thread and must not block.
    pub async fn subscribe_to_disconnect<F>(&self, f: F) -> Result<(), FabricError>
    where
        F: Fn(InstanceId, &str) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(f);
        self.reactor.query(move |r| r.state.on_disconnect.push(listener)).await
    }

    /// Host `service` as `node`, which must belong to this instance.
    pub async fn host_node<N: NodeService>(&self, node: NodeId, service: N) -> Result<(), FabricError> {
        if node.instance() != self.instance {
            return Err(FabricError::NoSuchInstance(node.instance()));
        }
        let service: Arc<dyn NodeService> = Arc::new(service);
        self.reactor.query(move |r| node::host(r, node, service)).await
    }

    pub async fn unhost_node(&self, node: NodeId) -> Result<bool, FabricError> {
        self.reactor.query(move |r| node::unhost(r, &node)).await?
    }

    /// Bind a local node, returning its address.
    pub async fn open_binding(&self, node: NodeId) -> Result<String, FabricError> {
        self.reactor.query(move |r| node::open_binding(r, node, None)).await?
    }

    pub async fn close_binding(&self, node: NodeId) -> Result<bool, FabricError> {
        self.reactor.query(move |r| node::close_binding(r, &node)).await?
    }

    pub async fn open_route_to_node(&self, node: NodeId) -> Result<Route, FabricError> {
        self.router.open_route_to_node(node, &self.control_address).await
    }

    pub async fn close_route_to_node(&self, node: NodeId) -> Result<bool, FabricError> {
        let route = self.router.route(node).await?;
        let dropped = self.router.close_route_to_node(node, &self.control_address).await?;
        if let Some(route) = route {
            self.pool.purge(&route.address);
        }
        Ok(dropped)
    }

    /// Drop every route to the nodes of `instance`, returning how many there were.
    pub async fn close_routes_via_instance(&self, instance: InstanceId) -> Result<u32, FabricError> {
        self.router.close_routes_via_instance(instance).await
    }

    /// Invoke `node`, opening the route on first use.
    pub async fn call(&self, node: NodeId, payload: Bytes) -> Result<Call, FabricError> {
        self.call_with_callbacks(node, payload, Vec::new()).await
    }

    /// Invoke `node` expecting one asynchronous part per callback.
    pub async fn call_with_callbacks(
        &self, node: NodeId, payload: Bytes, callbacks: Vec<Callback>,
    ) -> Result<Call, FabricError> {
        let route = self.open_route_to_node(node).await?;
        Ok(self.invoker.invoke(&route.address, payload, callbacks))
    }

    /// Invoke `node` with a payload encoded by `C`, and decode its result.
    pub async fn call_typed<C, Req, Resp>(&self, node: NodeId, req: &Req) -> Result<Resp, FabricError>
    where
        C: Codec,
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let codec = C::default();
        let payload = codec.encode(req).map_err(|_| FabricError::Codec("encode the request"))?;
        let call = self.call(node, Bytes::from(payload)).await?;
        let result = call.result().await?;
        codec.decode(&result).map_err(|_| FabricError::Codec("decode the response"))
    }

    /// Invoke `node` through the control channel of its instance, without a route.
    ///
    /// Returns the synchronous part and the `additional_parts` callback parts.
    pub async fn forward(
        &self, node: NodeId, payload: Bytes, additional_parts: u32,
    ) -> Result<Vec<Result<Bytes, InvokeError>>, FabricError> {
        let owner = node.instance();
        let address = self
            .reactor
            .query(move |r| r.state.instances.get(&owner).cloned())
            .await?
            .ok_or(FabricError::NoSuchInstance(owner))?;
        self.control.forward(&address, node, payload, additional_parts).await
    }

    /// Backends of the reactor and their inproc channel counts.
    pub async fn routing_status(&self) -> Result<RoutingStatus, FabricError> {
        self.reactor.query(|r| r.status()).await
    }

    /// Stop the reactor and wait for it.
    pub async fn shutdown(&self) {
        let reactor = self.reactor.clone();
        if tokio::task::spawn_blocking(move || reactor.shutdown()).await.is_err() {
            error!("reactor shutdown panicked");
        }
    }
}
