//! Moving messages between inproc channels and their backend connection.
//!
//! On the wire, a backend message is `[token, frames...]`: the token of the inproc
//! channel goes first, so the remote router sees `[dealer identity, token, ...]` and can
//! address its reply back to the same channel.

use crate::reactor::{Reactor, ReactorState};
use crate::transport::SocketHandle;
use bytes::Bytes;
use occams_fabric_core::{Message, PeerToken};

/// Inproc channel `token` of backend `address` → the backend connection.
pub fn multiplex<S: ReactorState>(reactor: &mut Reactor<S>, address: &str, token: PeerToken, msg: Message) {
    let Some(backend) = reactor.backends.get(address) else {
        logger_debug!(reactor.logger(), "backend {} gone, drop message of {}", address, token);
        return;
    };
    let handle = backend.handle;
    let mut framed = Vec::with_capacity(msg.len() + 1);
    framed.push(Bytes::copy_from_slice(token.as_bytes()));
    framed.extend(msg);
    reactor.send(handle, framed);
}

/// Backend connection → the inproc channel named by the first frame.
///
/// Messages for a token with no open channel go to [ReactorState::on_unrouted].
pub fn demultiplex<S: ReactorState>(reactor: &mut Reactor<S>, handle: SocketHandle, mut msg: Message) {
    let Some(backend) = reactor.backends.get_by_handle_mut(handle) else {
        logger_debug!(reactor.logger(), "{:?} is no longer a backend, drop", handle);
        return;
    };
    backend.monitor.record_inbound();
    let address = backend.address.clone();
    if msg.is_empty() {
        logger_warn!(reactor.logger(), "empty message from backend {}", address);
        return;
    }
    let token = match PeerToken::from_slice(&msg[0]) {
        Ok(t) => t,
        Err(e) => {
            logger_warn!(reactor.logger(), "backend {} sent a bad routing token: {}", address, e);
            return;
        }
    };
    let body = msg.split_off(1);
    match reactor.backends.get_inproc_socket(&address, &token) {
        Some(inproc) => {
            reactor.send(inproc, body);
        }
        None => S::on_unrouted(reactor, &address, token, body),
    }
}
