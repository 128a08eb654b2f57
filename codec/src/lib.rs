#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # occams-fabric-codec
//!
//! This crate provides the payload codec trait of [`occams-fabric`](https://docs.rs/occams-fabric).
//!
//! The fabric itself moves opaque bytes: invocation payloads, results and callback
//! deliveries. A codec turns typed requests and responses into those bytes at the edges.

/*
 *  Note that there's no unify output interface in each serde impl,
 *  whatever we want to serialize into (std::io::Write / Buffer/ Vec<u8>),
 *  require the codec implement to match.
 */

#[macro_use]
extern crate captains_log;

use serde::{Deserialize, Serialize};

/// The codec is immutable, if need changing (like setting up cipher), should have inner
/// mutablilty
pub trait Codec: Default + Send + Sync + Sized + 'static {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()>;

    /// serialize the msg into buf (with std::io::Writer), and return the size written
    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

#[cfg(feature = "msgpack")]
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
mod msgpack;
#[cfg(feature = "msgpack")]
pub use msgpack::*;
