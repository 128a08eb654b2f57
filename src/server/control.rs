//! The control channel dispatcher.
//!
//! Requests are `[envelope][Preamble][frames...]`, answered with
//! `[envelope][ResponseCode][frames...]`. The envelope is put back on every answer, and
//! no request can take the loop down: failures and panics become `EXCEPTION` answers.

use super::node;
use crate::router;
use crate::state::FabricState;
use occams_fabric_core::envelope::{Envelope, restore_envelope, split_envelope};
use occams_fabric_core::error::{FabricError, ProtoError};
use occams_fabric_core::proto::{CommandType, Preamble, RemoteError, ResponseCode, decode_address, encode_u32};
use occams_fabric_core::{Frame, InstanceId, Message, NodeId};
use occams_fabric_stream::{Reactor, SocketHandle, SocketKind};
use bytes::Bytes;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Bind the control channel at `endpoint`, returning the address peers should use.
pub fn bind(r: &mut Reactor<FabricState>, endpoint: &str) -> Result<String, FabricError> {
    let handle = r.io.bind(endpoint, SocketKind::Router, Box::new(dispatch))?;
    let address = r.io.endpoint(handle).unwrap_or(endpoint).to_string();
    r.state.control_socket = Some(handle);
    r.state.control_address = Some(address.clone());
    logger_info!(r.logger(), "control channel of {} bound at {}", r.state.instance, address);
    Ok(address)
}

fn dispatch(r: &mut Reactor<FabricState>, socket: SocketHandle, msg: Message) {
    let (envelope, body) = match split_envelope(msg) {
        Ok(split) => split,
        Err(e) => {
            logger_warn!(r.logger(), "control message dropped: {}", e);
            return;
        }
    };
    let reply = match catch_unwind(AssertUnwindSafe(|| handle_command(r, socket, &envelope, body))) {
        Ok(Ok(Some(reply))) => reply,
        // answered by a node later
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            logger_debug!(r.logger(), "control command failed: {}", e);
            error_reply(e)
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            logger_error!(r.logger(), "control command panicked: {}", msg);
            vec![ResponseCode::Exception.encode(), RemoteError::new(RemoteError::PANIC, msg).encode()]
        }
    };
    r.send(socket, restore_envelope(envelope, reply));
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn error_reply(e: FabricError) -> Message {
    match e {
        FabricError::NoSuchNode(node) => vec![ResponseCode::NoSuchNode(node).encode()],
        FabricError::NoSuchInstance(instance) => vec![ResponseCode::NoSuchInstance(instance).encode()],
        FabricError::NoSuchRoute(node) => vec![ResponseCode::NoSuchRoute(node).encode()],
        FabricError::Proto(e) => vec![
            ResponseCode::Exception.encode(),
            RemoteError::new(RemoteError::MALFORMED, e.to_string()).encode(),
        ],
        e => vec![ResponseCode::Exception.encode(), RemoteError::new(RemoteError::GENERIC, e.to_string()).encode()],
    }
}

#[inline]
fn ok(frames: impl IntoIterator<Item = Frame>) -> Option<Message> {
    let mut reply = vec![ResponseCode::Ok.encode()];
    reply.extend(frames);
    Some(reply)
}

fn arg<'a>(args: &'a [Frame], i: usize, what: &str) -> Result<&'a Frame, ProtoError> {
    args.get(i).ok_or_else(|| ProtoError::Malformed(format!("missing {}", what)))
}

fn handle_command(
    r: &mut Reactor<FabricState>, socket: SocketHandle, envelope: &Envelope, body: Message,
) -> Result<Option<Message>, FabricError> {
    let Some((preamble, args)) = body.split_first() else {
        return Err(ProtoError::Malformed("control message without preamble".to_string()).into());
    };
    let preamble = Preamble::decode(preamble)?;
    let Ok(cmd) = preamble.command() else {
        logger_warn!(r.logger(), "unknown control command {}", preamble.0);
        return Ok(Some(vec![ResponseCode::UnknownCommand.encode(), encode_u32(preamble.0)]));
    };
    logger_debug!(r.logger(), "control {:?} ({} frames)", cmd, args.len());
    match cmd {
        CommandType::GetInstanceStatus => {
            let mut nodes: Vec<&NodeId> = r.state.nodes.keys().collect();
            nodes.sort();
            let instance = Bytes::copy_from_slice(r.state.instance.as_bytes());
            let nodes: Vec<Frame> = nodes.into_iter().map(|n| Bytes::copy_from_slice(&n.to_bytes())).collect();
            Ok(ok(std::iter::once(instance).chain(nodes)))
        }
        CommandType::OpenRouteToNode => {
            let node = NodeId::from_slice(arg(args, 0, "node")?)?;
            let caller = decode_address(arg(args, 1, "caller address")?)?;
            let address = node::open_binding(r, node, Some(&caller))?;
            Ok(ok([Bytes::from(address)]))
        }
        CommandType::OpenBindingForNode => {
            let node = NodeId::from_slice(arg(args, 0, "node")?)?;
            let address = node::open_binding(r, node, None)?;
            Ok(ok([Bytes::from(address)]))
        }
        CommandType::CloseBindingForNode => {
            let node = NodeId::from_slice(arg(args, 0, "node")?)?;
            if node::close_binding(r, &node)? { Ok(ok([])) } else { Err(FabricError::NoSuchNode(node)) }
        }
        CommandType::CloseRouteToNode => {
            let node = NodeId::from_slice(arg(args, 0, "node")?)?;
            let dropped = router::drop_route(r, &node).is_some();
            let released = match args.get(1) {
                Some(caller) => node::unregister_caller(r, &node, &decode_address(caller)?),
                None => false,
            };
            if dropped || released { Ok(ok([])) } else { Err(FabricError::NoSuchRoute(node)) }
        }
        CommandType::CloseRoutesViaInstance => {
            let instance = InstanceId::from_slice(arg(args, 0, "instance")?)?;
            let count = router::drop_routes_via_instance(r, instance);
            Ok(ok([encode_u32(count)]))
        }
        CommandType::Forward => {
            let node = NodeId::from_slice(arg(args, 0, "node")?)?;
            if !r.state.nodes.contains_key(&node) {
                return Err(FabricError::NoSuchNode(node));
            }
            let (header, payload) = node::parse_request(&args[1..])?;
            node::dispatch(r, socket, envelope.clone(), Some(ResponseCode::Ok.encode()), node, header, payload);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reply_codes() {
        let node = NodeId::new(InstanceId::from_name("b"), 1);
        let reply = error_reply(FabricError::NoSuchNode(node));
        assert_eq!(ResponseCode::decode(&reply[0]), Ok(ResponseCode::NoSuchNode(node)));
        let reply = error_reply(FabricError::NoSuchRoute(node));
        assert_eq!(reply, vec![ResponseCode::NoSuchRoute(node).encode()]);
        let reply = error_reply(ProtoError::Malformed("x".to_string()).into());
        assert_eq!(ResponseCode::decode(&reply[0]), Ok(ResponseCode::Exception));
        assert_eq!(RemoteError::decode(&reply[1]).code, RemoteError::MALFORMED);
        let reply = error_reply(FabricError::Timeout);
        assert_eq!(RemoteError::decode(&reply[1]).code, RemoteError::GENERIC);
    }

    #[test]
    fn test_panic_message() {
        let p = catch_unwind(|| -> u32 { panic!("boom {}", 1) }).expect_err("panics");
        assert_eq!(panic_message(p.as_ref()), "boom 1");
        let p = catch_unwind(|| -> u32 { panic!("static") }).expect_err("panics");
        assert_eq!(panic_message(p.as_ref()), "static");
    }
}
