#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # occams-fabric-stream
//!
//! This crate provides the message plumbing for `occams-fabric`: sockets, the
//! in-process transport, and the reactor that multiplexes many logical channels
//! over one connection per remote address.
//!
//! If you are looking for node routing and remote invocation, use
//! [`occams-fabric`](https://docs.rs/occams-fabric) instead.
//!
//! ## Components
//!
//! - [`occams-fabric-core`](https://docs.rs/occams-fabric-core): ids, frames, wire headers, errors and config.
//! - Transports, selected by the scheme of an endpoint:
//!   - [InprocTransport](crate::inproc::InprocTransport): `inproc://`, built into every [Context].
//!   - [`occams-fabric-tcp`](https://docs.rs/occams-fabric-tcp): `tcp://`.
//!
//! ## The Design
//!
//! Sockets come in three kinds, [SocketKind]: a bound `Router` that prefixes inbound
//! messages with the sender's identity, the `Dealer` that connects to it, and the
//! exclusive `Pair`.
//!
//! A [Reactor](crate::reactor::Reactor) owns a set of sockets on a dedicated thread.
//! Every socket delivers into the same [crossfire](https://docs.rs/crossfire) channel,
//! so one poll waits on all of them. The routing tables ([crate::table]) are only
//! touched on that thread. Other threads talk to it through a
//! [ReactorHandle](crate::reactor::ReactorHandle): routing commands on the control
//! channel, optionally acknowledged, or closures run between two polls.
//!
//! For each remote address there is one backend `Dealer`. A caller opens an inproc
//! channel under it, named by a [PeerToken](occams_fabric_core::PeerToken), and gets a
//! `Pair` endpoint to connect to. What the caller writes there is prefixed with the
//! token and sent on the backend ([router::multiplex]). Replies carry the token back
//! and are forwarded to the matching channel ([router::demultiplex]).
//!
//! Sending to a peer that is gone is routine: the message is logged and dropped.
//!

#[macro_use]
extern crate captains_log;

pub mod inproc;
pub mod poller;
pub mod reactor;
pub mod router;
pub mod table;
pub mod transport;

pub use reactor::{CloseReason, Reactor, ReactorBuilder, ReactorHandle, ReactorState};
pub use transport::{Context, Event, Link, Sink, Socket, SocketHandle, SocketKind, Transport};
