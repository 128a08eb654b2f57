#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # occams-fabric-tcp
//!
//! This crate provides the `tcp://` transport for [`occams-fabric-stream`](https://docs.rs/occams-fabric-stream).
//! Register it on a context, with the handle of the tokio runtime to run the socket tasks on:
//!
//! ```no_run
//! use occams_fabric_core::TcpConfig;
//! use occams_fabric_stream::Context;
//! use occams_fabric_tcp::TcpTransport;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let ctx = Context::builder().transport(TcpTransport::new(rt.handle().clone(), TcpConfig::default())).build();
//! ```
//!
//! The framing is described in [codec].

#[macro_use]
extern crate captains_log;

macro_rules! io_with_timeout {
    ($timeout: expr, $f: expr) => {{
        if $timeout == std::time::Duration::from_secs(0) {
            $f.await
        } else {
            match tokio::time::timeout($timeout, $f).await {
                Ok(Ok(r)) => Ok(r),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
            }
        }
    }};
}

pub mod codec;
mod transport;
pub use transport::*;
