//! Error types of every layer.
//!
//! - [TransportError]: socket level, logged and dropped on the hot path.
//! - [ProtoError]: malformed frames and unknown codes.
//! - [ChannelError]: channel table failures, closing aggregates per-channel errors.
//! - [InvokeError]: the outcome delivered to an invocation's caller, cloneable.
//! - [FabricError]: what the public API returns.

use crate::id::{InstanceId, NodeId};
use crate::proto::RemoteError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("address in use: {0}")]
    AddressInUse(String),
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("{kind} sockets are not supported over {scheme}")]
    Unsupported { kind: &'static str, scheme: &'static str },
    #[error("socket closed")]
    Closed,
    #[error("socket {0} is not registered")]
    NotRegistered(u64),
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Routine on a best-effort transport: the peer is gone.
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::HostUnreachable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated { what: &'static str, need: usize, have: usize },
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    #[error("unknown routing action {0}")]
    UnknownAction(u32),
    #[error("unknown response code {0}")]
    UnknownCode(u32),
    #[error("unknown response kind {0}")]
    UnknownKind(u32),
    #[error("address too long: {0} bytes")]
    AddressTooLong(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no backend for {0}")]
    NoBackend(String),
    #[error("failed to close {} channel(s), first: {}", .0.len(), first_failure(.0))]
    Close(Vec<(String, TransportError)>),
}

fn first_failure(failures: &[(String, TransportError)]) -> String {
    match failures.first() {
        Some((addr, e)) => format!("{}: {}", addr, e),
        None => String::new(),
    }
}

/// Outcome of a failed invocation, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    #[error("remote error: {0}")]
    Remote(RemoteError),
    #[error("invocation timed out")]
    Timeout,
    #[error("invocation canceled")]
    Canceled,
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("no route to {0}")]
    NoSuchRoute(NodeId),
    #[error("no such node {0}")]
    NoSuchNode(NodeId),
    #[error("no such instance {0}")]
    NoSuchInstance(InstanceId),
    #[error("peer rejected command {0}")]
    UnknownCommand(u32),
    #[error("remote exception: {0}")]
    Remote(RemoteError),
    #[error("unknown error reported by peer")]
    UnknownError,
    #[error("payload codec failed to {0}")]
    Codec(&'static str),
    #[error("request timed out")]
    Timeout,
    #[error("reactor is shut down")]
    Shutdown,
}

impl From<FabricError> for InvokeError {
    fn from(e: FabricError) -> Self {
        match e {
            FabricError::Invoke(e) => e,
            FabricError::Timeout => InvokeError::Timeout,
            FabricError::Remote(r) => InvokeError::Remote(r),
            FabricError::Proto(e) => InvokeError::Protocol(e.to_string()),
            e => InvokeError::Connection(e.to_string()),
        }
    }
}
