//! # occams-fabric-core
//!
//! This crate provides the core utilities for [`occams-fabric`](https://docs.rs/occams-fabric):
//! identifiers, envelopes, wire formats, configuration and the error types shared by the
//! other crates in the workspace.

pub mod config;
pub use config::*;
pub mod envelope;
pub mod error;
pub mod id;
pub mod proto;

pub use envelope::{Envelope, Frame, Message};
pub use id::{InstanceId, NodeId, PeerToken, Route};
