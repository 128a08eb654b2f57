//! The serving side of an instance: the control channel and the hosted nodes.

pub mod control;
pub mod node;

pub use node::{NodeRequest, NodeService, Responder, typed};
