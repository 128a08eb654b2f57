#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # occams-fabric
//!
//! An inter-process routing fabric. A cluster is made of instances, each hosting logical
//! nodes addressed by [NodeId]. Any instance can invoke any node of any instance it is
//! connected to, and the routes between them can be opened and closed while traffic is
//! flowing.
//!
//! ## Components
//!
//! - [`occams-fabric-core`](https://docs.rs/occams-fabric-core): ids, wire headers, errors and config.
//! - [`occams-fabric-stream`](https://docs.rs/occams-fabric-stream): sockets and the
//!   multiplexing reactor.
//! - [`occams-fabric-tcp`](https://docs.rs/occams-fabric-tcp): the `tcp://` transport.
//! - [`occams-fabric-codec`](https://docs.rs/occams-fabric-codec): payload codecs for
//!   [Fabric::call_typed] and [server::typed].
//!
//! ## Usage
//!
//! ```no_run
//! use bytes::Bytes;
//! use occams_fabric::{Fabric, FabricConfig, NodeRequest};
//!
//! # async fn run() -> Result<(), occams_fabric::FabricError> {
//! let server = Fabric::builder(FabricConfig::default())
//!     .host(1, |req: NodeRequest| {
//!         req.responder.reply(Ok(req.payload.clone()));
//!     })
//!     .build()
//!     .await?;
//! let client = Fabric::builder(FabricConfig::default()).build().await?;
//! client.connect_to_instance(server.control_address()).await?;
//! let call = client.call(server.node(1), Bytes::from_static(b"ping")).await?;
//! assert_eq!(call.result().await?, Bytes::from_static(b"ping"));
//! # Ok(())
//! # }
//! ```
//!
//! ## The Design
//!
//! Every instance runs one [Reactor](occams_fabric_stream::Reactor) thread holding the
//! [FabricState]: hosted nodes, the route cache and the known instances. Each instance
//! binds a control channel, where other instances ask it to bind a node
//! (`OPEN_ROUTE_TO_NODE`), report its status, drop routes or forward an invocation.
//!
//! An invocation runs over a pooled [ChannelConnection](client::ChannelConnection): an
//! inproc channel multiplexed over the single backend connection the reactor keeps
//! towards the node's address. The reply is one synchronous part followed by optional
//! asynchronous parts, each handed to its callback. The lifecycle of a call is tracked by
//! an [AsyncOperation](client::AsyncOperation), which settles exactly once whether the
//! call completes, fails, times out or gets cancelled.

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod fabric;
pub mod router;
pub mod server;
pub mod state;

pub use client::{Call, Callback, ControlClient};
pub use fabric::{Fabric, FabricBuilder, InstanceDirectory, StaticDirectory};
pub use router::NodeRouter;
pub use server::{NodeRequest, NodeService, Responder};
pub use state::FabricState;

pub use occams_fabric_core::error::{FabricError, InvokeError};
pub use occams_fabric_core::proto::RemoteError;
pub use occams_fabric_core::{FabricConfig, InstanceId, NodeId, PoolConfig, ReactorConfig, Route, TcpConfig};
pub use occams_fabric_stream::Context;
